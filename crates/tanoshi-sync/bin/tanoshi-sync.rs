#[macro_use]
extern crate log;

use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use tanoshi_sync::{
    application::worker,
    domain::services::tracker::{TrackEdit, TrackerError, TrackerService},
    infrastructure::{
        config::Config,
        database,
        registry::TrackerRegistry,
        repositories::{
            credential::CredentialRepositoryImpl, library::LibraryRepositoryImpl,
            track::TrackRepositoryImpl,
        },
    },
};
use tanoshi_tracker::{CredentialStore, MyAnimeList, Track, TrackStatus, Tracker, myanimelist};
use tokio_util::sync::CancellationToken;

type Service = TrackerService<TrackRepositoryImpl, LibraryRepositoryImpl>;

#[derive(Parser)]
struct Opts {
    /// Path to config file
    #[clap(long)]
    config: Option<String>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in, for myanimelist USERNAME is the code verifier and SECRET the code
    Login {
        tracker: String,
        username: String,
        secret: String,
    },
    Logout {
        tracker: String,
    },
    /// Print the url to authorize tanoshi on myanimelist
    Authorize { tracker: String },
    /// `id:<id>` and `my:<title>` are understood
    Search { tracker: String, query: String },
    /// Link a manga to a remote id or url
    Bind {
        manga_id: i64,
        tracker: String,
        remote: String,
    },
    /// Edit a bound track and push it
    Update {
        manga_id: i64,
        tracker: String,
        /// planning, reading, completed, on_hold or dropped
        #[clap(long)]
        status: Option<TrackStatus>,
        /// Index in the score list of the tracker
        #[clap(long)]
        score: Option<usize>,
        #[clap(long)]
        chapter: Option<f32>,
    },
    Refresh { manga_id: i64 },
    Unbind {
        manga_id: i64,
        tracker: String,
        /// Delete the entry on the tracker too
        #[clap(long)]
        remote: bool,
    },
    /// Report a chapter as read to every tracker of the manga
    Read { manga_id: i64, chapter: f32 },
    /// Refresh periodically until ctrl+c
    Watch,
    Status,
}

fn init_logger() {
    let mut builder = env_logger::Builder::from_default_env();
    if std::env::var("RUST_LOG").is_err() {
        if let Ok(tanoshi_log) = std::env::var("TANOSHI_LOG") {
            builder.parse_filters(&format!(
                "tanoshi_sync={tanoshi_log},tanoshi_tracker={tanoshi_log}"
            ));
        }
    }
    builder.init();
}

fn tracker(svc: &Service, name: &str) -> Result<Arc<dyn Tracker>, anyhow::Error> {
    svc.registry()
        .find_by_name(name)
        .ok_or_else(|| anyhow!("tracker {name} is not configured"))
}

fn report(e: TrackerError) -> anyhow::Error {
    anyhow!("{e} ({})", e.kind())
}

fn print_track(name: &str, track: &Track, score: &str) {
    println!(
        "{name}\t{}\t{}\tchapter {}/{}\tscore {score}\t{}",
        track.title,
        track.status,
        track.last_chapter_read,
        track.total_chapters,
        track.tracking_url
    );
}

async fn run(
    command: Command,
    config: &Config,
    store: Arc<dyn CredentialStore>,
    svc: Service,
    cancel: CancellationToken,
) -> Result<(), anyhow::Error> {
    match command {
        Command::Login {
            tracker: name,
            username,
            secret,
        } => {
            let tracker = tracker(&svc, &name)?;
            svc.login(tracker.id(), &username, &secret)
                .await
                .map_err(report)?;
            println!("logged in to {}", tracker.name());
        }
        Command::Logout { tracker: name } => {
            let tracker = tracker(&svc, &name)?;
            svc.logout(tracker.id()).await.map_err(report)?;
            println!("logged out of {}", tracker.name());
        }
        Command::Authorize { tracker: name } => {
            if !name.eq_ignore_ascii_case(myanimelist::NAME) {
                return Err(anyhow!("{name} doesn't need an authorization"));
            }
            let mal = config
                .myanimelist
                .as_ref()
                .ok_or_else(|| anyhow!("myanimelist is not configured"))?;
            let session = MyAnimeList::new(
                mal.client_id.clone(),
                mal.client_secret.clone(),
                mal.redirect_url.clone(),
                store,
                config.request_timeout(),
            )?
            .authorize_url()?;

            println!("open {}", session.authorize_url);
            if let Some(verifier) = session.pkce_code_verifier {
                println!(
                    "then run: tanoshi-sync login {} {} <code>",
                    myanimelist::NAME,
                    verifier.secret()
                );
            }
        }
        Command::Search {
            tracker: name,
            query,
        } => {
            let tracker = tracker(&svc, &name)?;
            let results = svc
                .search(tracker.id(), &query, &cancel)
                .await
                .map_err(report)?;
            for result in results {
                println!(
                    "{}\t{}\t{} chapters\t{}",
                    result.remote_id, result.title, result.total_chapters, result.tracking_url
                );
            }
        }
        Command::Bind {
            manga_id,
            tracker: name,
            remote,
        } => {
            let tracker = tracker(&svc, &name)?;
            let track = match remote.parse::<i64>() {
                Ok(remote_id) => svc
                    .search(tracker.id(), &format!("id:{remote_id}"), &cancel)
                    .await
                    .map_err(report)?
                    .into_iter()
                    .next()
                    .ok_or_else(|| anyhow!("{remote_id} not found on {}", tracker.name()))?
                    .into_track(manga_id),
                Err(_) => Track {
                    tracking_url: remote,
                    ..Track::new(manga_id, tracker.id())
                },
            };
            let track = svc.bind(track, &cancel).await.map_err(report)?;
            print_track(tracker.name(), &track, &tracker.display_score(&track));
        }
        Command::Update {
            manga_id,
            tracker: name,
            status,
            score,
            chapter,
        } => {
            let tracker = tracker(&svc, &name)?;
            let edit = TrackEdit {
                status,
                score: score.map(|index| tracker.index_to_score(index)),
                last_chapter_read: chapter,
                ..Default::default()
            };

            let track = svc
                .update(manga_id, tracker.id(), edit, chapter.is_some(), &cancel)
                .await
                .map_err(report)?;
            print_track(tracker.name(), &track, &tracker.display_score(&track));
        }
        Command::Refresh { manga_id } => {
            let mut failed = false;
            for track in svc.get_tracks(manga_id).await.map_err(report)? {
                let Some(tracker) = svc.registry().get(track.tracker_id) else {
                    warn!("tracker {} is not configured", track.tracker_id);
                    continue;
                };
                match svc.refresh(manga_id, track.tracker_id, &cancel).await {
                    Ok(track) => {
                        print_track(tracker.name(), &track, &tracker.display_score(&track))
                    }
                    Err(e) => {
                        failed = true;
                        eprintln!("{}: {}", tracker.name(), report(e));
                    }
                }
            }
            if failed {
                return Err(anyhow!("some trackers failed to refresh"));
            }
        }
        Command::Unbind {
            manga_id,
            tracker: name,
            remote,
        } => {
            let tracker = tracker(&svc, &name)?;
            svc.unbind(manga_id, tracker.id(), remote, &cancel)
                .await
                .map_err(report)?;
            println!("manga {manga_id} unbound from {}", tracker.name());
        }
        Command::Read { manga_id, chapter } => {
            let mut failed = false;
            for (tracker_id, res) in svc
                .on_chapters_read(manga_id, chapter, &cancel)
                .await
                .map_err(report)?
            {
                let name = svc
                    .registry()
                    .get(tracker_id)
                    .map(|t| t.name())
                    .unwrap_or("unknown");
                match res {
                    Ok(track) => println!("{name}: chapter {}", track.last_chapter_read),
                    Err(e) => {
                        failed = true;
                        eprintln!("{name}: {}", report(e));
                    }
                }
            }
            if failed {
                return Err(anyhow!("some trackers were not updated"));
            }
        }
        Command::Watch => {
            let handle = worker::refresh::start(config.refresh_interval, svc, cancel.clone());
            handle.await?;
        }
        Command::Status => {
            for tracker in svc.registry().trackers() {
                let state = if tracker.is_logged_in().await {
                    "logged in"
                } else {
                    "logged out"
                };
                println!("{}\t{state}", tracker.name());
            }
            for track in svc.get_all_tracks().await.map_err(report)? {
                match svc.registry().get(track.tracker_id) {
                    Some(tracker) => {
                        print!("manga {}\t", track.manga_id);
                        print_track(tracker.name(), &track, &tracker.display_score(&track));
                    }
                    None => warn!(
                        "manga {} is bound to unknown tracker {}",
                        track.manga_id, track.tracker_id
                    ),
                }
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    init_logger();

    let opts = Opts::parse();
    let config = Config::open(opts.config).context("failed to init config")?;

    debug!("config: {config:?}");

    let pool = database::establish_connection(&config.database_path, config.create_database).await?;
    let store: Arc<dyn CredentialStore> = Arc::new(CredentialRepositoryImpl::new(pool.clone()));
    let registry = TrackerRegistry::from_config(&config, store.clone())?;
    let svc = TrackerService::new(
        TrackRepositoryImpl::new(pool.clone()),
        LibraryRepositoryImpl::new(pool.clone()),
        registry,
    );

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl+c signal");
            ctrl_c.cancel();
        }
    });

    let res = run(opts.command, &config, store, svc, cancel).await;

    info!("closing database...");
    pool.close().await;

    res
}
