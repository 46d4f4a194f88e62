use std::{collections::HashSet, fmt::Display, future::Future, sync::Arc};

use chrono::Utc;
use futures::{StreamExt, stream};
use tanoshi_tracker::{
    LibrarySnapshot, StatusUpdate, Track, TrackSearch, TrackStatus, Tracker, reconcile,
    update_track_status,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    domain::{
        repositories::{
            library::{LibraryRepository, LibraryRepositoryError},
            track::{TrackRepository, TrackRepositoryError},
        },
        services::locks::TrackLocks,
    },
    infrastructure::registry::TrackerRegistry,
};

const CONCURRENT_REFRESHES: usize = 4;

/// What the user should do about a failed sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Relogin,
    RetryLater,
    BackendIncompatible,
    InvalidInput,
    Internal,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            ErrorKind::Relogin => "log in to the tracker again",
            ErrorKind::RetryLater => "tracker unreachable, try again later",
            ErrorKind::BackendIncompatible => "unexpected response from the tracker",
            ErrorKind::InvalidInput => "invalid request",
            ErrorKind::Internal => "internal error",
        };
        write!(f, "{message}")
    }
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("repository error: {0}")]
    RepositoryError(#[from] TrackRepositoryError),
    #[error("library error: {0}")]
    LibraryError(#[from] LibraryRepositoryError),
    #[error("{0}")]
    Tracker(#[from] tanoshi_tracker::Error),
    #[error("tracker {0} not available")]
    NoTracker(i32),
    #[error("manga {0} is not tracked on tracker {1}")]
    NotTracked(i64, i32),
    #[error("sync cancelled")]
    Cancelled,
    #[error("other error: {0}")]
    Other(String),
}

impl TrackerError {
    pub fn kind(&self) -> ErrorKind {
        use tanoshi_tracker::Error;

        match self {
            TrackerError::Tracker(Error::AuthExpired | Error::NoCredentials) => ErrorKind::Relogin,
            TrackerError::Tracker(Error::Transient(_)) | TrackerError::Cancelled => {
                ErrorKind::RetryLater
            }
            TrackerError::Tracker(Error::RemoteProtocol(_)) => ErrorKind::BackendIncompatible,
            TrackerError::Tracker(Error::NotFound | Error::Validation(_))
            | TrackerError::NoTracker(_)
            | TrackerError::NotTracked(..) => ErrorKind::InvalidInput,
            TrackerError::Tracker(Error::Store(_))
            | TrackerError::RepositoryError(_)
            | TrackerError::LibraryError(_)
            | TrackerError::Other(_) => ErrorKind::Internal,
        }
    }
}

async fn until_cancelled<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, TrackerError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TrackerError::Cancelled),
        out = fut => Ok(out),
    }
}

/// Forward-only merge of freshly derived progress into a track.
fn merge_progress(track: &mut Track, reconciled: &Track) {
    if reconciled.last_chapter_read > track.last_chapter_read {
        track.last_chapter_read = reconciled.last_chapter_read;
    }
    if track.started_reading_date == 0 {
        track.started_reading_date = reconciled.started_reading_date;
    }
}

fn settle(track: &mut Track) {
    if track.status == TrackStatus::Completed
        && track.total_chapters > 0
        && track.last_chapter_read < track.total_chapters as f32
    {
        track.last_chapter_read = track.total_chapters as f32;
    }
    if track.status != TrackStatus::Completed {
        track.finished_reading_date = 0;
    }
}

/// A user's change to a bound track, `None` keeps the stored value.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TrackEdit {
    pub status: Option<TrackStatus>,
    pub score: Option<f32>,
    /// Replaces the progress even when lower
    pub last_chapter_read: Option<f32>,
    pub started_reading_date: Option<i64>,
    pub finished_reading_date: Option<i64>,
}

impl TrackEdit {
    fn apply_to(&self, track: &mut Track) {
        if let Some(status) = self.status {
            track.status = status;
        }
        if let Some(score) = self.score {
            track.score = score;
        }
        if let Some(last_chapter_read) = self.last_chapter_read {
            track.last_chapter_read = last_chapter_read;
        }
        if let Some(date) = self.started_reading_date {
            track.started_reading_date = date;
        }
        if let Some(date) = self.finished_reading_date {
            track.finished_reading_date = date;
        }
    }
}

/// Bind, add, update, refresh and unbind of `(manga, tracker)` pairs.
///
/// Operations on the same pair run one at a time. Each runs on its own task:
/// a caller giving up after the remote entry was written doesn't stop the
/// local copy from being saved.
pub struct TrackerService<T, L>
where
    T: TrackRepository + 'static,
    L: LibraryRepository + 'static,
{
    track_repo: Arc<T>,
    library_repo: Arc<L>,
    registry: Arc<TrackerRegistry>,
    locks: TrackLocks,
}

impl<T, L> Clone for TrackerService<T, L>
where
    T: TrackRepository + 'static,
    L: LibraryRepository + 'static,
{
    fn clone(&self) -> Self {
        Self {
            track_repo: self.track_repo.clone(),
            library_repo: self.library_repo.clone(),
            registry: self.registry.clone(),
            locks: self.locks.clone(),
        }
    }
}

impl<T, L> TrackerService<T, L>
where
    T: TrackRepository + 'static,
    L: LibraryRepository + 'static,
{
    pub fn new(track_repo: T, library_repo: L, registry: TrackerRegistry) -> Self {
        Self {
            track_repo: Arc::new(track_repo),
            library_repo: Arc::new(library_repo),
            registry: Arc::new(registry),
            locks: TrackLocks::new(),
        }
    }

    pub fn registry(&self) -> &TrackerRegistry {
        &self.registry
    }

    fn tracker(&self, tracker_id: i32) -> Result<Arc<dyn Tracker>, TrackerError> {
        self.registry
            .get(tracker_id)
            .ok_or(TrackerError::NoTracker(tracker_id))
    }

    pub async fn login(
        &self,
        tracker_id: i32,
        username: &str,
        password: &str,
    ) -> Result<(), TrackerError> {
        self.tracker(tracker_id)?
            .login(username, password)
            .await?;

        Ok(())
    }

    pub async fn logout(&self, tracker_id: i32) -> Result<(), TrackerError> {
        self.tracker(tracker_id)?.logout().await?;

        Ok(())
    }

    pub async fn search(
        &self,
        tracker_id: i32,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<TrackSearch>, TrackerError> {
        let tracker = self.tracker(tracker_id)?;
        let results = until_cancelled(cancel, tracker.search(query)).await??;

        Ok(results)
    }

    pub async fn get_tracks(&self, manga_id: i64) -> Result<Vec<Track>, TrackerError> {
        Ok(self.track_repo.get_tracks_by_manga_id(manga_id).await?)
    }

    pub async fn get_all_tracks(&self) -> Result<Vec<Track>, TrackerError> {
        Ok(self.track_repo.get_all_tracks().await?)
    }

    /// Run `op` holding the lock of the pair, on a task of its own.
    async fn exclusive<R, F, Fut>(
        &self,
        manga_id: i64,
        tracker_id: i32,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<R, TrackerError>
    where
        R: Send + 'static,
        F: FnOnce(Self, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<R, TrackerError>> + Send + 'static,
    {
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TrackerError::Cancelled),
            guard = self.locks.acquire(manga_id, tracker_id) => guard,
        };

        let svc = self.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _guard = guard;
            op(svc, cancel).await
        })
        .await
        .map_err(|e| TrackerError::Other(format!("sync task failed: {e}")))?
    }

    /// Link `track` to its remote entry, creating the entry when missing.
    pub async fn bind(
        &self,
        track: Track,
        cancel: &CancellationToken,
    ) -> Result<Track, TrackerError> {
        self.exclusive(
            track.manga_id,
            track.tracker_id,
            cancel,
            move |svc, cancel| async move { svc.bind_locked(track, &cancel).await },
        )
        .await
    }

    pub async fn add(&self, track: Track, cancel: &CancellationToken) -> Result<Track, TrackerError> {
        self.exclusive(
            track.manga_id,
            track.tracker_id,
            cancel,
            move |svc, cancel| async move {
                let tracker = svc.tracker(track.tracker_id)?;
                let library = svc.library_repo.get_snapshot(track.manga_id).await?;
                svc.add_locked(tracker.as_ref(), track, &library, &cancel)
                    .await
            },
        )
        .await
    }

    /// Apply a user's edit to the stored track and push it.
    pub async fn update(
        &self,
        manga_id: i64,
        tracker_id: i32,
        edit: TrackEdit,
        set_to_read: bool,
        cancel: &CancellationToken,
    ) -> Result<Track, TrackerError> {
        self.exclusive(
            manga_id,
            tracker_id,
            cancel,
            move |svc, cancel| async move {
                let tracker = svc.tracker(tracker_id)?;
                let mut track = svc
                    .track_repo
                    .get_track(manga_id, tracker_id)
                    .await?
                    .ok_or(TrackerError::NotTracked(manga_id, tracker_id))?;
                edit.apply_to(&mut track);

                let update = StatusUpdate {
                    set_to_read,
                    set_to_complete: true,
                    must_read_to_complete: false,
                };
                svc.push_locked(tracker.as_ref(), track, update, &cancel)
                    .await
            },
        )
        .await
    }

    /// Pull the remote state of a bound track, adding it again if it vanished.
    pub async fn refresh(
        &self,
        manga_id: i64,
        tracker_id: i32,
        cancel: &CancellationToken,
    ) -> Result<Track, TrackerError> {
        self.exclusive(manga_id, tracker_id, cancel, move |svc, cancel| async move {
            svc.refresh_locked(manga_id, tracker_id, &cancel).await
        })
        .await
    }

    /// Forget the binding, deleting the remote entry first when asked to.
    pub async fn unbind(
        &self,
        manga_id: i64,
        tracker_id: i32,
        remove_remote: bool,
        cancel: &CancellationToken,
    ) -> Result<(), TrackerError> {
        self.exclusive(manga_id, tracker_id, cancel, move |svc, cancel| async move {
            svc.unbind_locked(manga_id, tracker_id, remove_remote, &cancel)
                .await
        })
        .await
    }

    /// Report `chapter_number` as read to every logged in tracker of the manga.
    pub async fn on_chapters_read(
        &self,
        manga_id: i64,
        chapter_number: f32,
        cancel: &CancellationToken,
    ) -> Result<Vec<(i32, Result<Track, TrackerError>)>, TrackerError> {
        let mut jobs = vec![];
        for track in self.track_repo.get_tracks_by_manga_id(manga_id).await? {
            let tracker_id = track.tracker_id;
            let logged_in = match self.registry.get(tracker_id) {
                Some(tracker) => tracker.is_logged_in().await,
                None => false,
            };
            if !logged_in {
                debug!("tracker {tracker_id} not logged in, skip manga {manga_id}");
                continue;
            }

            jobs.push(async move {
                let res = self
                    .exclusive(manga_id, tracker_id, cancel, move |svc, cancel| async move {
                        svc.chapter_read_locked(manga_id, tracker_id, chapter_number, &cancel)
                            .await
                    })
                    .await;
                (tracker_id, res)
            });
        }

        Ok(futures::future::join_all(jobs).await)
    }

    /// Refresh every track whose tracker is logged in.
    pub async fn refresh_all(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<(Track, Result<Track, TrackerError>)>, TrackerError> {
        let logged: HashSet<i32> = self
            .registry
            .logged_trackers()
            .await
            .iter()
            .map(|tracker| tracker.id())
            .collect();

        let tracks = self.track_repo.get_all_tracks().await?;
        let results = stream::iter(
            tracks
                .into_iter()
                .filter(|track| logged.contains(&track.tracker_id)),
        )
        .map(|track| async move {
            let res = self
                .refresh(track.manga_id, track.tracker_id, cancel)
                .await;
            (track, res)
        })
        .buffer_unordered(CONCURRENT_REFRESHES)
        .collect::<Vec<_>>()
        .await;

        Ok(results)
    }

    async fn bind_locked(
        &self,
        mut track: Track,
        cancel: &CancellationToken,
    ) -> Result<Track, TrackerError> {
        let tracker = self.tracker(track.tracker_id)?;
        let library = self.library_repo.get_snapshot(track.manga_id).await?;

        let remote = match until_cancelled(cancel, tracker.find_remote(&track)).await? {
            Ok(remote) => remote,
            Err(tanoshi_tracker::Error::NotFound) => None,
            Err(e) => {
                error!("failed to look up manga {} on {}: {e}", track.manga_id, tracker.name());
                return Err(e.into());
            }
        };

        let Some(remote) = remote else {
            debug!("manga {} not on {} list yet", track.manga_id, tracker.name());
            return self
                .add_locked(tracker.as_ref(), track, &library, cancel)
                .await;
        };

        track.copy_remote_info_from(&remote);
        track.copy_personal_from(&remote);

        let reconciled = reconcile(
            track.clone(),
            tracker.descriptor().supports_reading_dates,
            &library,
        );
        merge_progress(&mut track, &reconciled);

        let update = StatusUpdate {
            set_to_read: true,
            set_to_complete: true,
            must_read_to_complete: true,
        };
        self.push_locked(tracker.as_ref(), track, update, cancel)
            .await
    }

    async fn add_locked(
        &self,
        tracker: &dyn Tracker,
        mut track: Track,
        library: &LibrarySnapshot,
        cancel: &CancellationToken,
    ) -> Result<Track, TrackerError> {
        let previous = track.clone();

        track.status = TrackStatus::Reading;
        track.score = 0.0;
        let mut track = reconcile(track, tracker.descriptor().supports_reading_dates, library);
        merge_progress(&mut track, &previous);

        let update = StatusUpdate {
            set_to_read: true,
            set_to_complete: false,
            must_read_to_complete: false,
        };
        self.push_locked(tracker, track, update, cancel).await
    }

    /// Apply the status rule, push and persist.
    ///
    /// Cancellation is only honoured before the push.
    async fn push_locked(
        &self,
        tracker: &dyn Tracker,
        mut track: Track,
        update: StatusUpdate,
        cancel: &CancellationToken,
    ) -> Result<Track, TrackerError> {
        let before = track.status;
        update_track_status(&mut track, update);

        if tracker.descriptor().supports_reading_dates {
            let now = Utc::now().timestamp_millis();
            if track.status == TrackStatus::Reading
                && before == TrackStatus::Planning
                && track.started_reading_date == 0
            {
                track.started_reading_date = now;
            }
            if track.status == TrackStatus::Completed
                && before != TrackStatus::Completed
                && track.finished_reading_date == 0
            {
                track.finished_reading_date = now;
            }
        }
        settle(&mut track);

        if cancel.is_cancelled() {
            return Err(TrackerError::Cancelled);
        }

        debug!(
            "push manga {} to {}: {} chapter {}",
            track.manga_id,
            tracker.name(),
            track.status,
            track.last_chapter_read
        );
        let remote = tracker.push(&track).await?;
        track.copy_remote_info_from(&remote);
        if remote.last_chapter_read > track.last_chapter_read {
            track.last_chapter_read = remote.last_chapter_read;
        }
        settle(&mut track);

        track.id = Some(self.track_repo.upsert_track(&track).await?);

        Ok(track)
    }

    async fn refresh_locked(
        &self,
        manga_id: i64,
        tracker_id: i32,
        cancel: &CancellationToken,
    ) -> Result<Track, TrackerError> {
        let tracker = self.tracker(tracker_id)?;
        let mut track = self
            .track_repo
            .get_track(manga_id, tracker_id)
            .await?
            .ok_or(TrackerError::NotTracked(manga_id, tracker_id))?;

        let remote = match until_cancelled(cancel, tracker.find_remote(&track)).await? {
            Ok(remote) => remote,
            Err(tanoshi_tracker::Error::NotFound) => None,
            Err(e) => return Err(e.into()),
        };

        let Some(remote) = remote else {
            info!("manga {manga_id} vanished from {}, adding it again", tracker.name());
            let library = self.library_repo.get_snapshot(manga_id).await?;
            return self
                .add_locked(tracker.as_ref(), track, &library, cancel)
                .await;
        };

        track.copy_remote_info_from(&remote);
        track.copy_personal_from(&remote);
        settle(&mut track);

        track.id = Some(self.track_repo.upsert_track(&track).await?);

        Ok(track)
    }

    async fn unbind_locked(
        &self,
        manga_id: i64,
        tracker_id: i32,
        remove_remote: bool,
        cancel: &CancellationToken,
    ) -> Result<(), TrackerError> {
        let track = self
            .track_repo
            .get_track(manga_id, tracker_id)
            .await?
            .ok_or(TrackerError::NotTracked(manga_id, tracker_id))?;

        if remove_remote {
            let tracker = self.tracker(tracker_id)?;
            if tracker.descriptor().can_remove_from_service {
                if cancel.is_cancelled() {
                    return Err(TrackerError::Cancelled);
                }
                match tracker.remove(&track).await {
                    Ok(()) | Err(tanoshi_tracker::Error::NotFound) => {}
                    Err(e) => return Err(e.into()),
                }
            } else {
                warn!("{} can't remove entries, only unbinding", tracker.name());
            }
        }

        self.track_repo.delete_track(manga_id, tracker_id).await?;

        Ok(())
    }

    async fn chapter_read_locked(
        &self,
        manga_id: i64,
        tracker_id: i32,
        chapter_number: f32,
        cancel: &CancellationToken,
    ) -> Result<Track, TrackerError> {
        let tracker = self.tracker(tracker_id)?;
        let mut track = self
            .track_repo
            .get_track(manga_id, tracker_id)
            .await?
            .ok_or(TrackerError::NotTracked(manga_id, tracker_id))?;

        if chapter_number <= track.last_chapter_read {
            return Ok(track);
        }

        track.last_chapter_read = chapter_number;
        self.push_locked(tracker.as_ref(), track, StatusUpdate::reading(), cancel)
            .await
    }
}

#[cfg(test)]
mod test {
    use std::{
        collections::HashMap,
        sync::{
            Mutex,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use tanoshi_tracker::{Descriptor, Error};

    use super::*;
    use crate::{
        infrastructure::{
            database::{self, Pool},
            repositories::{library::LibraryRepositoryImpl, track::TrackRepositoryImpl},
        },
        testing,
    };

    const FAKE_ID: i32 = 99;

    static FAKE: Descriptor = Descriptor {
        id: FAKE_ID,
        name: "fake",
        statuses: &TrackStatus::ALL,
        score_scale: 10,
        supports_reading_dates: true,
        can_remove_from_service: true,
        color: 0,
    };

    /// Remote entries keyed by remote id, with scripted failures.
    #[derive(Default)]
    struct FakeTracker {
        remote: Mutex<HashMap<i64, Track>>,
        find_error: Mutex<Option<Error>>,
        push_error: Mutex<Option<Error>>,
        logged_in: AtomicBool,
        push_delay: Duration,
        finds: AtomicUsize,
        pushes: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeTracker {
        fn new(push_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                logged_in: AtomicBool::new(true),
                push_delay,
                ..Default::default()
            })
        }

        fn remote(&self, remote_id: i64) -> Option<Track> {
            self.remote.lock().unwrap().get(&remote_id).cloned()
        }

        fn set_remote(&self, track: Track) {
            self.remote.lock().unwrap().insert(track.remote_id, track);
        }

        fn fail(&self, e: &Error) -> Error {
            if *e == Error::AuthExpired {
                self.logged_in.store(false, Ordering::SeqCst);
            }
            e.clone()
        }
    }

    #[async_trait]
    impl Tracker for FakeTracker {
        fn descriptor(&self) -> &'static Descriptor {
            &FAKE
        }

        fn display_score(&self, track: &Track) -> String {
            format!("{}", self.get_10_point_score(track.score))
        }

        async fn is_logged_in(&self) -> bool {
            self.logged_in.load(Ordering::SeqCst)
        }

        async fn login(&self, _username: &str, _password: &str) -> Result<(), Error> {
            self.logged_in.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn logout(&self) -> Result<(), Error> {
            self.logged_in.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn search(&self, query: &str) -> Result<Vec<TrackSearch>, Error> {
            let remote = self.remote.lock().unwrap();
            Ok(remote
                .values()
                .filter(|t| t.title.contains(query))
                .map(|t| TrackSearch {
                    tracker_id: FAKE_ID,
                    remote_id: t.remote_id,
                    title: t.title.clone(),
                    ..Default::default()
                })
                .collect())
        }

        async fn find_remote(&self, track: &Track) -> Result<Option<Track>, Error> {
            self.finds.fetch_add(1, Ordering::SeqCst);
            let error = self.find_error.lock().unwrap().clone();
            if let Some(e) = error {
                return Err(self.fail(&e));
            }
            Ok(self.remote(track.remote_id))
        }

        async fn push(&self, track: &Track) -> Result<Track, Error> {
            let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
            tokio::time::sleep(self.push_delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let error = self.push_error.lock().unwrap().clone();
            if let Some(e) = error {
                return Err(self.fail(&e));
            }

            self.pushes.fetch_add(1, Ordering::SeqCst);
            let remote = Track {
                id: None,
                ..track.clone()
            };
            self.set_remote(remote.clone());
            Ok(remote)
        }

        async fn remove(&self, track: &Track) -> Result<(), Error> {
            match self.remote.lock().unwrap().remove(&track.remote_id) {
                Some(_) => Ok(()),
                None => Err(Error::NotFound),
            }
        }
    }

    type Service = TrackerService<TrackRepositoryImpl, LibraryRepositoryImpl>;

    async fn setup(tracker: Arc<FakeTracker>) -> (Service, Pool) {
        let pool = database::in_memory().await;
        let registry = TrackerRegistry::new(vec![tracker as Arc<dyn Tracker>]);
        let svc = TrackerService::new(
            TrackRepositoryImpl::new(pool.clone()),
            LibraryRepositoryImpl::new(pool.clone()),
            registry,
        );
        (svc, pool)
    }

    /// Ten chapters, the first `read` of them read at `1000 * number`.
    async fn manga(pool: &Pool, status: &str, read: i32) -> i64 {
        let manga_id = testing::insert_manga(pool, "Dungeon Meshi", status).await;
        for number in 1..=10 {
            let chapter_id =
                testing::insert_chapter(pool, manga_id, 10 - number, number as f32, number <= read)
                    .await;
            if number <= read {
                testing::insert_history(pool, chapter_id, 1000 * number as i64).await;
            }
        }
        manga_id
    }

    fn unbound(manga_id: i64, remote_id: i64) -> Track {
        Track {
            remote_id,
            total_chapters: 10,
            ..Track::new(manga_id, FAKE_ID)
        }
    }

    #[tokio::test]
    async fn test_bind_existing_entry() {
        let fake = FakeTracker::new(Duration::ZERO);
        let (svc, pool) = setup(fake.clone()).await;
        let manga_id = manga(&pool, "ongoing", 5).await;

        fake.set_remote(Track {
            title: "Delicious in Dungeon".to_string(),
            status: TrackStatus::Reading,
            score: 80.0,
            last_chapter_read: 3.0,
            started_reading_date: 500,
            ..unbound(0, 5)
        });

        let track = svc
            .bind(unbound(manga_id, 5), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(track.title, "Delicious in Dungeon");
        assert_eq!(track.score, 80.0);
        assert_eq!(track.last_chapter_read, 5.0);
        assert_eq!(track.started_reading_date, 500);
        assert_eq!(track.status, TrackStatus::Reading);
        assert_eq!(fake.remote(5).unwrap().last_chapter_read, 5.0);
        assert_eq!(
            svc.track_repo.get_track(manga_id, FAKE_ID).await.unwrap(),
            Some(track)
        );
    }

    #[tokio::test]
    async fn test_bind_keeps_remote_progress_ahead() {
        let fake = FakeTracker::new(Duration::ZERO);
        let (svc, pool) = setup(fake.clone()).await;
        let manga_id = manga(&pool, "ongoing", 2).await;

        fake.set_remote(Track {
            status: TrackStatus::OnHold,
            last_chapter_read: 7.0,
            ..unbound(0, 5)
        });

        let track = svc
            .bind(unbound(manga_id, 5), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(track.last_chapter_read, 7.0);
        assert_eq!(track.status, TrackStatus::OnHold);
    }

    #[tokio::test]
    async fn test_bind_without_entry_adds() {
        let fake = FakeTracker::new(Duration::ZERO);
        let (svc, pool) = setup(fake.clone()).await;
        let manga_id = manga(&pool, "ongoing", 3).await;

        let track = svc
            .bind(unbound(manga_id, 5), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(track.status, TrackStatus::Reading);
        assert_eq!(track.score, 0.0);
        assert_eq!(track.last_chapter_read, 3.0);
        assert_eq!(track.started_reading_date, 1000);
        assert_eq!(track.finished_reading_date, 0);
        assert_eq!(fake.pushes.load(Ordering::SeqCst), 1);
        assert!(fake.remote(5).is_some());
    }

    #[tokio::test]
    async fn test_add_unread_is_planning() {
        let fake = FakeTracker::new(Duration::ZERO);
        let (svc, pool) = setup(fake.clone()).await;
        let manga_id = manga(&pool, "ongoing", 0).await;

        let track = svc
            .add(unbound(manga_id, 5), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(track.status, TrackStatus::Planning);
        assert_eq!(track.score, 0.0);
        assert_eq!(fake.remote(5).unwrap().status, TrackStatus::Planning);
    }

    #[tokio::test]
    async fn test_add_fully_read() {
        let fake = FakeTracker::new(Duration::ZERO);
        let (svc, pool) = setup(fake.clone()).await;
        let manga_id = manga(&pool, "completed", 10).await;

        let track = svc
            .add(unbound(manga_id, 5), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(track.status, TrackStatus::Completed);
        assert_eq!(track.last_chapter_read, 10.0);
        assert_eq!(track.started_reading_date, 1000);
        assert_eq!(track.finished_reading_date, 10_000);
    }

    #[tokio::test]
    async fn test_failed_lookup_propagates() {
        let fake = FakeTracker::new(Duration::ZERO);
        let (svc, pool) = setup(fake.clone()).await;
        let manga_id = manga(&pool, "ongoing", 3).await;
        *fake.find_error.lock().unwrap() = Some(Error::Transient("timeout".to_string()));

        let err = svc
            .bind(unbound(manga_id, 5), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RetryLater);
        assert_eq!(fake.pushes.load(Ordering::SeqCst), 0);
        assert!(svc.get_tracks(manga_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_merges_remote() {
        let fake = FakeTracker::new(Duration::ZERO);
        let (svc, pool) = setup(fake.clone()).await;
        let manga_id = manga(&pool, "ongoing", 3).await;
        let cancel = CancellationToken::new();
        svc.bind(unbound(manga_id, 5), &cancel).await.unwrap();

        fake.set_remote(Track {
            status: TrackStatus::OnHold,
            score: 60.0,
            last_chapter_read: 7.0,
            ..unbound(manga_id, 5)
        });
        let track = svc.refresh(manga_id, FAKE_ID, &cancel).await.unwrap();
        assert_eq!(track.status, TrackStatus::OnHold);
        assert_eq!(track.score, 60.0);
        assert_eq!(track.last_chapter_read, 7.0);

        // a lagging remote doesn't move progress back
        fake.set_remote(Track {
            status: TrackStatus::Reading,
            last_chapter_read: 2.0,
            ..unbound(manga_id, 5)
        });
        let track = svc.refresh(manga_id, FAKE_ID, &cancel).await.unwrap();
        assert_eq!(track.last_chapter_read, 7.0);
        assert_eq!(fake.pushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_vanished_entry_adds() {
        let fake = FakeTracker::new(Duration::ZERO);
        let (svc, pool) = setup(fake.clone()).await;
        let manga_id = manga(&pool, "ongoing", 3).await;
        let cancel = CancellationToken::new();
        svc.bind(unbound(manga_id, 5), &cancel).await.unwrap();

        fake.remote.lock().unwrap().clear();
        let track = svc.refresh(manga_id, FAKE_ID, &cancel).await.unwrap();

        assert_eq!(track.status, TrackStatus::Reading);
        assert_eq!(fake.pushes.load(Ordering::SeqCst), 2);
        assert!(fake.remote(5).is_some());
    }

    #[tokio::test]
    async fn test_refresh_unbound() {
        let fake = FakeTracker::new(Duration::ZERO);
        let (svc, pool) = setup(fake.clone()).await;
        let manga_id = manga(&pool, "ongoing", 3).await;

        let err = svc
            .refresh(manga_id, FAKE_ID, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::NotTracked(..)));

        let err = svc
            .refresh(manga_id, 1, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::NoTracker(1)));
    }

    #[tokio::test]
    async fn test_chapters_read_completes() {
        let fake = FakeTracker::new(Duration::ZERO);
        let (svc, pool) = setup(fake.clone()).await;
        let manga_id = manga(&pool, "ongoing", 3).await;
        let cancel = CancellationToken::new();
        svc.bind(unbound(manga_id, 5), &cancel).await.unwrap();

        let results = svc.on_chapters_read(manga_id, 10.0, &cancel).await.unwrap();
        assert_eq!(results.len(), 1);
        let (tracker_id, res) = results.into_iter().next().unwrap();
        assert_eq!(tracker_id, FAKE_ID);

        let track = res.unwrap();
        assert_eq!(track.status, TrackStatus::Completed);
        assert_eq!(track.last_chapter_read, 10.0);
        assert!(track.finished_reading_date > 0);

        // older chapters don't trigger a push
        svc.on_chapters_read(manga_id, 4.0, &cancel).await.unwrap();
        assert_eq!(fake.pushes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_auth_expired_keeps_track() {
        let fake = FakeTracker::new(Duration::ZERO);
        let (svc, pool) = setup(fake.clone()).await;
        let manga_id = manga(&pool, "ongoing", 3).await;
        let cancel = CancellationToken::new();
        let bound = svc.bind(unbound(manga_id, 5), &cancel).await.unwrap();

        *fake.push_error.lock().unwrap() = Some(Error::AuthExpired);
        let results = svc.on_chapters_read(manga_id, 8.0, &cancel).await.unwrap();
        let err = results.into_iter().next().unwrap().1.unwrap_err();
        assert!(matches!(err, TrackerError::Tracker(Error::AuthExpired)));
        assert_eq!(err.kind(), ErrorKind::Relogin);

        assert_eq!(
            svc.track_repo.get_track(manga_id, FAKE_ID).await.unwrap(),
            Some(bound)
        );
        assert!(!svc.registry().has_logged_trackers().await);

        // logged out trackers are skipped
        let results = svc.on_chapters_read(manga_id, 9.0, &cancel).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_same_pair_is_serialized() {
        let fake = FakeTracker::new(Duration::from_millis(30));
        let (svc, pool) = setup(fake.clone()).await;
        let manga_id = manga(&pool, "ongoing", 3).await;
        let cancel = CancellationToken::new();
        let bound = svc.bind(unbound(manga_id, 5), &cancel).await.unwrap();

        let updates = (4..8).map(|chapter| {
            let edit = TrackEdit {
                last_chapter_read: Some(chapter as f32),
                ..Default::default()
            };
            svc.update(manga_id, bound.tracker_id, edit, true, &cancel)
        });
        for res in futures::future::join_all(updates).await {
            res.unwrap();
        }

        assert_eq!(fake.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(fake.pushes.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_status_edit_keeps_newer_progress() {
        let fake = FakeTracker::new(Duration::ZERO);
        let (svc, pool) = setup(fake.clone()).await;
        let manga_id = manga(&pool, "ongoing", 3).await;
        let cancel = CancellationToken::new();
        let bound = svc.bind(unbound(manga_id, 5), &cancel).await.unwrap();
        assert_eq!(bound.last_chapter_read, 3.0);

        // chapters read while the user was editing
        svc.on_chapters_read(manga_id, 8.0, &cancel).await.unwrap();

        let edit = TrackEdit {
            status: Some(TrackStatus::OnHold),
            score: Some(70.0),
            ..Default::default()
        };
        let track = svc
            .update(manga_id, FAKE_ID, edit, false, &cancel)
            .await
            .unwrap();

        assert_eq!(track.status, TrackStatus::OnHold);
        assert_eq!(track.score, 70.0);
        assert_eq!(track.last_chapter_read, 8.0);
        assert_eq!(fake.remote(5).unwrap().last_chapter_read, 8.0);
        assert_eq!(
            svc.track_repo.get_track(manga_id, FAKE_ID).await.unwrap(),
            Some(track)
        );
    }

    #[tokio::test]
    async fn test_chapter_edit_can_go_back() {
        let fake = FakeTracker::new(Duration::ZERO);
        let (svc, pool) = setup(fake.clone()).await;
        let manga_id = manga(&pool, "ongoing", 3).await;
        let cancel = CancellationToken::new();
        svc.bind(unbound(manga_id, 5), &cancel).await.unwrap();
        svc.on_chapters_read(manga_id, 8.0, &cancel).await.unwrap();

        let edit = TrackEdit {
            last_chapter_read: Some(2.0),
            ..Default::default()
        };
        let track = svc
            .update(manga_id, FAKE_ID, edit, true, &cancel)
            .await
            .unwrap();

        assert_eq!(track.last_chapter_read, 2.0);
        assert_eq!(fake.remote(5).unwrap().last_chapter_read, 2.0);
    }

    #[tokio::test]
    async fn test_update_unbound() {
        let fake = FakeTracker::new(Duration::ZERO);
        let (svc, _pool) = setup(fake.clone()).await;
        let cancel = CancellationToken::new();

        let err = svc
            .update(42, FAKE_ID, TrackEdit::default(), false, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::NotTracked(42, FAKE_ID)));
        assert_eq!(fake.pushes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pairs_run_in_parallel() {
        let fake = FakeTracker::new(Duration::from_millis(100));
        let (svc, pool) = setup(fake.clone()).await;
        let first = manga(&pool, "ongoing", 3).await;
        let second = manga(&pool, "ongoing", 3).await;
        let cancel = CancellationToken::new();

        let (a, b) = tokio::join!(
            svc.add(unbound(first, 5), &cancel),
            svc.add(unbound(second, 6), &cancel)
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(fake.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let fake = FakeTracker::new(Duration::ZERO);
        let (svc, pool) = setup(fake.clone()).await;
        let manga_id = manga(&pool, "ongoing", 3).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = svc.bind(unbound(manga_id, 5), &cancel).await.unwrap_err();

        assert!(matches!(err, TrackerError::Cancelled));
        assert_eq!(fake.finds.load(Ordering::SeqCst), 0);
        assert!(svc.get_tracks(manga_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_push_is_persisted() {
        let fake = FakeTracker::new(Duration::from_millis(300));
        let (svc, pool) = setup(fake.clone()).await;
        let manga_id = manga(&pool, "ongoing", 3).await;
        let cancel = CancellationToken::new();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), svc.add(unbound(manga_id, 5), &cancel))
                .await;
        assert!(abandoned.is_err());
        cancel.cancel();

        tokio::time::sleep(Duration::from_millis(600)).await;
        let stored = svc.get_tracks(manga_id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].last_chapter_read, 3.0);
        assert_eq!(fake.remote(5).unwrap().last_chapter_read, 3.0);
    }

    #[tokio::test]
    async fn test_unbind() {
        let fake = FakeTracker::new(Duration::ZERO);
        let (svc, pool) = setup(fake.clone()).await;
        let manga_id = manga(&pool, "ongoing", 3).await;
        let cancel = CancellationToken::new();

        svc.bind(unbound(manga_id, 5), &cancel).await.unwrap();
        svc.unbind(manga_id, FAKE_ID, true, &cancel).await.unwrap();
        assert!(fake.remote(5).is_none());
        assert!(svc.get_tracks(manga_id).await.unwrap().is_empty());

        let err = svc
            .unbind(manga_id, FAKE_ID, false, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::NotTracked(..)));

        // already gone remotely
        svc.bind(unbound(manga_id, 5), &cancel).await.unwrap();
        fake.remote.lock().unwrap().clear();
        svc.unbind(manga_id, FAKE_ID, true, &cancel).await.unwrap();
        assert!(svc.get_tracks(manga_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_all_skips_logged_out() {
        let fake = FakeTracker::new(Duration::ZERO);
        let (svc, pool) = setup(fake.clone()).await;
        let first = manga(&pool, "ongoing", 3).await;
        let second = manga(&pool, "ongoing", 5).await;
        let cancel = CancellationToken::new();
        svc.bind(unbound(first, 5), &cancel).await.unwrap();
        svc.bind(unbound(second, 6), &cancel).await.unwrap();

        let results = svc.refresh_all(&cancel).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, res)| res.is_ok()));

        fake.logged_in.store(false, Ordering::SeqCst);
        assert!(svc.refresh_all(&cancel).await.unwrap().is_empty());
    }

    #[test]
    fn test_error_kinds() {
        let cases = [
            (TrackerError::Tracker(Error::AuthExpired), ErrorKind::Relogin),
            (TrackerError::Tracker(Error::NoCredentials), ErrorKind::Relogin),
            (
                TrackerError::Tracker(Error::Transient("timeout".to_string())),
                ErrorKind::RetryLater,
            ),
            (
                TrackerError::Tracker(Error::RemoteProtocol("html".to_string())),
                ErrorKind::BackendIncompatible,
            ),
            (
                TrackerError::Tracker(Error::Validation("no id".to_string())),
                ErrorKind::InvalidInput,
            ),
            (TrackerError::NoTracker(3), ErrorKind::InvalidInput),
            (TrackerError::Cancelled, ErrorKind::RetryLater),
        ];

        for (err, kind) in cases {
            assert_eq!(err.kind(), kind, "{err}");
        }
    }
}
