use async_trait::async_trait;
use tanoshi_tracker::{Chapter, HistoryEntry, LibrarySnapshot};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LibraryRepositoryError {
    #[error("database error: {0}")]
    DbError(#[from] sqlx::Error),
}

/// Read only view of the local library.
#[async_trait]
pub trait LibraryRepository: Send + Sync {
    async fn get_chapters_by_manga_id(
        &self,
        manga_id: i64,
    ) -> Result<Vec<Chapter>, LibraryRepositoryError>;

    async fn get_history_by_manga_id(
        &self,
        manga_id: i64,
    ) -> Result<Vec<HistoryEntry>, LibraryRepositoryError>;

    async fn is_one_shot_or_completed(&self, manga_id: i64) -> Result<bool, LibraryRepositoryError>;

    async fn get_snapshot(&self, manga_id: i64) -> Result<LibrarySnapshot, LibraryRepositoryError> {
        Ok(LibrarySnapshot {
            chapters: self.get_chapters_by_manga_id(manga_id).await?,
            history: self.get_history_by_manga_id(manga_id).await?,
            one_shot_or_completed: self.is_one_shot_or_completed(manga_id).await?,
        })
    }
}
