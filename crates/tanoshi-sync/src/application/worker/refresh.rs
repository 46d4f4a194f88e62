use std::collections::HashSet;

use tokio::{
    task::JoinHandle,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::domain::{
    repositories::{library::LibraryRepository, track::TrackRepository},
    services::tracker::{ErrorKind, TrackerService},
};

struct RefreshWorker<T, L>
where
    T: TrackRepository + 'static,
    L: LibraryRepository + 'static,
{
    period: u64,
    service: TrackerService<T, L>,
    cancel: CancellationToken,
}

impl<T, L> RefreshWorker<T, L>
where
    T: TrackRepository + 'static,
    L: LibraryRepository + 'static,
{
    fn new(period: u64, service: TrackerService<T, L>, cancel: CancellationToken) -> Self {
        #[cfg(not(debug_assertions))]
        let period = if period > 0 && period < 600 { 600 } else { period };

        Self {
            period,
            service,
            cancel,
        }
    }

    async fn refresh(&self) {
        let results = match self.service.refresh_all(&self.cancel).await {
            Ok(results) => results,
            Err(e) => {
                error!("failed to load tracks: {e}");
                return;
            }
        };

        let mut expired = HashSet::new();
        let mut failed = 0;
        for (track, res) in &results {
            let Err(e) = res else {
                continue;
            };
            failed += 1;

            match e.kind() {
                ErrorKind::Relogin => {
                    if expired.insert(track.tracker_id) {
                        error!("tracker {} needs a new login: {e}", track.tracker_id);
                    }
                }
                ErrorKind::RetryLater => {
                    warn!(
                        "manga {} on tracker {} will be retried: {e}",
                        track.manga_id, track.tracker_id
                    );
                }
                _ => {
                    error!(
                        "failed to refresh manga {} on tracker {}: {e}",
                        track.manga_id, track.tracker_id
                    );
                }
            }
        }

        info!("refreshed {} tracks, {failed} failed", results.len());
    }

    async fn run(self) {
        if self.period == 0 {
            info!("periodic refresh disabled");
            return;
        }

        info!("periodic refresh every {} seconds", self.period);
        let mut interval = time::interval(time::Duration::from_secs(self.period));

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("refresh worker stopped");
                    break;
                }
                start = interval.tick() => {
                    info!("start periodic refresh");
                    self.refresh().await;
                    info!("periodic refresh done in {:?}", Instant::now() - start);
                }
            }
        }
    }
}

/// Refresh every bound track each `period` seconds until `cancel` fires.
pub fn start<T, L>(
    period: u64,
    service: TrackerService<T, L>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    T: TrackRepository + 'static,
    L: LibraryRepository + 'static,
{
    let worker = RefreshWorker::new(period, service, cancel);

    tokio::spawn(worker.run())
}
