//! Progress derivation from the local library and the automatic status rules
//! shared by every tracker.

use crate::model::{LibrarySnapshot, Track, TrackStatus};

impl LibrarySnapshot {
    /// Every chapter is read and the title won't get new ones.
    pub fn all_read(&self) -> bool {
        self.one_shot_or_completed && self.chapters.iter().all(|chapter| chapter.read)
    }

    /// Earliest history timestamp, `0` if nothing was read yet.
    pub fn start_date(&self) -> i64 {
        if !self.chapters.iter().any(|chapter| chapter.read) {
            return 0;
        }

        self.history
            .iter()
            .filter(|entry| entry.last_read > 0)
            .map(|entry| entry.last_read)
            .min()
            .unwrap_or(0)
    }

    /// Latest history timestamp, only meaningful once everything is read.
    pub fn completed_date(&self, all_read: bool) -> i64 {
        if !all_read {
            return 0;
        }

        self.history
            .iter()
            .map(|entry| entry.last_read)
            .max()
            .filter(|date| *date > 0)
            .unwrap_or(0)
    }

    /// Number of the read chapter that comes first in source order.
    ///
    /// Sources list the newest chapter at order `0`, so this is the furthest
    /// chapter read. Chapters without a recognized number are skipped.
    pub fn last_chapter_read(&self) -> f32 {
        self.chapters
            .iter()
            .filter(|chapter| chapter.read && chapter.is_recognized_number())
            .min_by_key(|chapter| chapter.source_order)
            .map(|chapter| chapter.number)
            .unwrap_or(0.0)
    }
}

/// Derive reading dates, progress and forced statuses from the library.
///
/// Pure and idempotent: feeding the output back with the same snapshot
/// yields the same track.
pub fn reconcile(mut track: Track, supports_reading_dates: bool, library: &LibrarySnapshot) -> Track {
    let all_read = library.all_read();

    if supports_reading_dates {
        track.started_reading_date = library.start_date();
        track.finished_reading_date = library.completed_date(all_read);
    }

    track.last_chapter_read = match library.last_chapter_read() {
        last if last == 0.0 && all_read => 1.0,
        last => last,
    };

    if track.last_chapter_read == 0.0 {
        track.status = TrackStatus::Planning;
    }

    if all_read {
        track.status = TrackStatus::Completed;
    }

    if track.status == TrackStatus::Completed {
        if track.total_chapters > 0 && track.last_chapter_read < track.total_chapters as f32 {
            track.last_chapter_read = track.total_chapters as f32;
        }
    } else {
        track.finished_reading_date = 0;
    }

    track
}

/// Flags controlling the automatic transitions applied before a push.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Move a planned entry to reading once progress exists.
    pub set_to_read: bool,
    /// Move to completed once the last chapter is reached.
    pub set_to_complete: bool,
    /// Only complete entries that are currently being read.
    pub must_read_to_complete: bool,
}

impl StatusUpdate {
    pub fn reading() -> Self {
        Self {
            set_to_read: true,
            set_to_complete: true,
            must_read_to_complete: false,
        }
    }
}

/// Planning -> Reading and X -> Completed, nothing else happens automatically.
pub fn update_track_status(track: &mut Track, update: StatusUpdate) {
    if update.set_to_read
        && track.status == TrackStatus::Planning
        && track.last_chapter_read != 0.0
    {
        track.status = TrackStatus::Reading;
    }

    if update.set_to_complete
        && (!update.must_read_to_complete || track.status == TrackStatus::Reading)
        && track.total_chapters != 0
        && track.last_chapter_read.floor() as i32 == track.total_chapters
    {
        track.status = TrackStatus::Completed;
    }

    if track.status != TrackStatus::Completed {
        track.finished_reading_date = 0;
    }
}
