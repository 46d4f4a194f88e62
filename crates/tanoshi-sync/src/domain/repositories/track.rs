use async_trait::async_trait;
use tanoshi_tracker::Track;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackRepositoryError {
    #[error("database return error: {0}")]
    DbError(#[from] sqlx::Error),
}

#[async_trait]
pub trait TrackRepository: Send + Sync {
    async fn get_tracks_by_manga_id(&self, manga_id: i64)
    -> Result<Vec<Track>, TrackRepositoryError>;

    async fn get_track(
        &self,
        manga_id: i64,
        tracker_id: i32,
    ) -> Result<Option<Track>, TrackRepositoryError>;

    async fn get_all_tracks(&self) -> Result<Vec<Track>, TrackRepositoryError>;

    /// Insert or replace the track of `(manga_id, tracker_id)`, returning its id.
    async fn upsert_track(&self, track: &Track) -> Result<i64, TrackRepositoryError>;

    /// Returns whether a track was deleted.
    async fn delete_track(
        &self,
        manga_id: i64,
        tracker_id: i32,
    ) -> Result<bool, TrackRepositoryError>;
}
