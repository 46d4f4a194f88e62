use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tanoshi_tracker::{Chapter, HistoryEntry};

use crate::{
    domain::repositories::library::{LibraryRepository, LibraryRepositoryError},
    infrastructure::database::Pool,
};

/// Publication statuses after which no new chapter is expected.
const FINISHED_STATUSES: [&str; 3] = ["completed", "one_shot", "oneshot"];

#[derive(Clone)]
pub struct LibraryRepositoryImpl {
    pool: Pool,
}

impl LibraryRepositoryImpl {
    pub fn new<P: Into<Pool>>(pool: P) -> Self {
        Self { pool: pool.into() }
    }
}

#[async_trait]
impl LibraryRepository for LibraryRepositoryImpl {
    async fn get_chapters_by_manga_id(
        &self,
        manga_id: i64,
    ) -> Result<Vec<Chapter>, LibraryRepositoryError> {
        let chapters = sqlx::query(
            r#"SELECT id, read, source_order, number
            FROM chapter
            WHERE manga_id = ?
            ORDER BY source_order"#,
        )
        .bind(manga_id)
        .fetch_all(&self.pool as &SqlitePool)
        .await?
        .into_iter()
        .map(|row| Chapter {
            id: row.get(0),
            read: row.get(1),
            source_order: row.get(2),
            number: row.get::<f64, _>(3) as f32,
        })
        .collect();

        Ok(chapters)
    }

    async fn get_history_by_manga_id(
        &self,
        manga_id: i64,
    ) -> Result<Vec<HistoryEntry>, LibraryRepositoryError> {
        let history = sqlx::query(
            r#"SELECT history.chapter_id, history.last_read
            FROM history
            JOIN chapter ON chapter.id = history.chapter_id
            WHERE chapter.manga_id = ?"#,
        )
        .bind(manga_id)
        .fetch_all(&self.pool as &SqlitePool)
        .await?
        .into_iter()
        .map(|row| HistoryEntry {
            chapter_id: row.get(0),
            last_read: row.get(1),
        })
        .collect();

        Ok(history)
    }

    async fn is_one_shot_or_completed(&self, manga_id: i64) -> Result<bool, LibraryRepositoryError> {
        let status: Option<String> = sqlx::query("SELECT status FROM manga WHERE id = ?")
            .bind(manga_id)
            .fetch_optional(&self.pool as &SqlitePool)
            .await?
            .map(|row| row.get(0));

        Ok(status
            .map(|status| status.trim().to_lowercase().replace([' ', '-'], "_"))
            .is_some_and(|status| FINISHED_STATUSES.contains(&status.as_str())))
    }
}
