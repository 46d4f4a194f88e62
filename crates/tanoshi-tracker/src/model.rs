use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

/// Backend agnostic reading status.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackStatus {
    #[default]
    Planning,
    Reading,
    Completed,
    OnHold,
    Dropped,
}

impl TrackStatus {
    pub const ALL: [TrackStatus; 5] = [
        TrackStatus::Planning,
        TrackStatus::Reading,
        TrackStatus::Completed,
        TrackStatus::OnHold,
        TrackStatus::Dropped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrackStatus::Planning => "planning",
            TrackStatus::Reading => "reading",
            TrackStatus::Completed => "completed",
            TrackStatus::OnHold => "on_hold",
            TrackStatus::Dropped => "dropped",
        }
    }
}

impl Display for TrackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TrackStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TrackStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown status {s}"))
    }
}

/// Synchronization record of one manga on one tracker.
///
/// Dates are epoch milliseconds, `0` means unset. `total_chapters == 0`
/// means the total is unknown.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: Option<i64>,
    pub manga_id: i64,
    pub tracker_id: i32,
    /// Numeric id of the entry on the tracker, `0` when the backend keys
    /// entries by url instead.
    pub remote_id: i64,
    pub library_id: Option<i64>,
    pub title: String,
    pub cover_url: String,
    pub tracking_url: String,
    pub status: TrackStatus,
    /// 0 to 100, translated per backend
    pub score: f32,
    pub last_chapter_read: f32,
    pub total_chapters: i32,
    pub started_reading_date: i64,
    pub finished_reading_date: i64,
}

impl Track {
    pub fn new(manga_id: i64, tracker_id: i32) -> Self {
        Self {
            manga_id,
            tracker_id,
            ..Default::default()
        }
    }

    /// Adopt the user's personal list data found on the tracker.
    ///
    /// Progress only moves forward; a remote entry that lags behind local
    /// progress does not pull `last_chapter_read` back.
    pub fn copy_personal_from(&mut self, other: &Track) {
        self.status = other.status;
        self.score = other.score;
        self.started_reading_date = other.started_reading_date;
        self.finished_reading_date = other.finished_reading_date;
        if other.last_chapter_read > self.last_chapter_read {
            self.last_chapter_read = other.last_chapter_read;
        }
    }

    /// Adopt descriptive fields of the remote entry, keeping local identity.
    pub fn copy_remote_info_from(&mut self, other: &Track) {
        if other.remote_id != 0 {
            self.remote_id = other.remote_id;
        }
        if other.library_id.is_some() {
            self.library_id = other.library_id;
        }
        if !other.title.is_empty() {
            self.title = other.title.clone();
        }
        if !other.cover_url.is_empty() {
            self.cover_url = other.cover_url.clone();
        }
        if !other.tracking_url.is_empty() {
            self.tracking_url = other.tracking_url.clone();
        }
        if other.total_chapters != 0 {
            self.total_chapters = other.total_chapters;
        }
    }
}

/// A candidate entry returned by a tracker search.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackSearch {
    pub tracker_id: i32,
    pub remote_id: i64,
    pub library_id: Option<i64>,
    pub title: String,
    pub summary: String,
    pub cover_url: String,
    pub tracking_url: String,
    pub publishing_status: String,
    pub total_chapters: i32,
    /// Status on the user's own list, if the entry is already there
    pub list_status: Option<TrackStatus>,
}

impl TrackSearch {
    pub fn into_track(self, manga_id: i64) -> Track {
        Track {
            manga_id,
            tracker_id: self.tracker_id,
            remote_id: self.remote_id,
            library_id: self.library_id,
            title: self.title,
            cover_url: self.cover_url,
            tracking_url: self.tracking_url,
            total_chapters: self.total_chapters,
            ..Default::default()
        }
    }
}

/// Chapter of the local library, read only here.
#[derive(Debug, Clone, PartialEq)]
pub struct Chapter {
    pub id: i64,
    pub read: bool,
    /// Position in the source's listing, `0` is the newest chapter.
    pub source_order: i32,
    /// Parsed chapter number, negative when it couldn't be recognized.
    pub number: f32,
}

impl Chapter {
    pub fn is_recognized_number(&self) -> bool {
        self.number >= 0.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub chapter_id: i64,
    /// epoch milliseconds, `0` when never opened
    pub last_read: i64,
}

/// Everything the reconciler needs to know about a title at one point in time.
#[derive(Debug, Default, Clone)]
pub struct LibrarySnapshot {
    pub chapters: Vec<Chapter>,
    pub history: Vec<HistoryEntry>,
    pub one_shot_or_completed: bool,
}
