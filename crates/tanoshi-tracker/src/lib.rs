#[macro_use]
extern crate log;

pub mod credential;
pub mod error;
pub mod http;
pub mod model;
pub mod progress;

pub mod myanimelist;
pub use myanimelist::MyAnimeList;

pub mod kavita;
pub use kavita::Kavita;

pub use credential::{CredentialStore, Credentials, MemoryCredentialStore, Vault};
pub use error::Error;
pub use model::{Chapter, HistoryEntry, LibrarySnapshot, Track, TrackSearch, TrackStatus};
pub use progress::{StatusUpdate, reconcile, update_track_status};

#[cfg(test)]
mod testing;

use async_trait::async_trait;
use oauth2::{CsrfToken, PkceCodeVerifier};
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub struct Session {
    pub authorize_url: String,
    pub csrf_state: CsrfToken,
    pub pkce_code_verifier: Option<PkceCodeVerifier>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub token_type: String,
    pub expires_in: i64,
    pub access_token: String,
    pub refresh_token: String,
}

/// Static facts about a tracker backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    pub id: i32,
    pub name: &'static str,
    /// Canonical statuses the backend can represent, in display order
    pub statuses: &'static [TrackStatus],
    /// Highest native score, `0` when the backend has no scores
    pub score_scale: u32,
    pub supports_reading_dates: bool,
    pub can_remove_from_service: bool,
    /// 0xRRGGBB
    pub color: u32,
}

impl Descriptor {
    pub fn supports_status(&self, status: TrackStatus) -> bool {
        self.statuses.contains(&status)
    }

    pub fn score_list(&self) -> Vec<String> {
        if self.score_scale == 0 {
            return vec![];
        }
        (0..=self.score_scale).map(|score| score.to_string()).collect()
    }
}

/// A tracking service the library can be synced with.
///
/// Implementors only translate and transport; the bind, add, update and
/// refresh flows built on top of these calls are shared by every backend.
/// Any `Error::AuthExpired` returned has already cleared the cached session.
#[async_trait]
pub trait Tracker: Send + Sync {
    fn descriptor(&self) -> &'static Descriptor;

    fn id(&self) -> i32 {
        self.descriptor().id
    }

    fn name(&self) -> &'static str {
        self.descriptor().name
    }

    /// Canonical score for an index of `Descriptor::score_list`.
    fn index_to_score(&self, index: usize) -> f32 {
        let scale = self.descriptor().score_scale;
        if scale == 0 {
            return 0.0;
        }
        (index.min(scale as usize) as f32) * 100.0 / scale as f32
    }

    fn get_10_point_score(&self, score: f32) -> f32 {
        score / 10.0
    }

    fn display_score(&self, track: &Track) -> String;

    async fn is_logged_in(&self) -> bool;

    async fn login(&self, username: &str, password: &str) -> Result<(), Error>;

    /// Always clears local credentials, even when a remote call fails.
    async fn logout(&self) -> Result<(), Error>;

    /// `id:<n>` looks an entry up by id, `my:<title>` searches the user's
    /// own list, anything else is a global text search.
    async fn search(&self, query: &str) -> Result<Vec<TrackSearch>, Error>;

    /// Fetch the user's entry for `track`, `None` if there is none.
    async fn find_remote(&self, track: &Track) -> Result<Option<Track>, Error>;

    /// Create or update the remote entry, returning the remote state.
    async fn push(&self, track: &Track) -> Result<Track, Error>;

    async fn remove(&self, _track: &Track) -> Result<(), Error> {
        Err(Error::Validation(format!(
            "{} does not support removing entries",
            self.name()
        )))
    }
}

pub const SEARCH_ID_PREFIX: &str = "id:";
pub const SEARCH_LIST_PREFIX: &str = "my:";

/// How a search query should be dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchQuery<'a> {
    Id(i64),
    List(&'a str),
    Text(&'a str),
}

impl<'a> SearchQuery<'a> {
    pub fn parse(query: &'a str) -> Self {
        if let Some(id) = query
            .strip_prefix(SEARCH_ID_PREFIX)
            .and_then(|id| id.trim().parse().ok())
        {
            return SearchQuery::Id(id);
        }

        if let Some(title) = query.strip_prefix(SEARCH_LIST_PREFIX) {
            return SearchQuery::List(title.trim());
        }

        SearchQuery::Text(query.trim())
    }
}
