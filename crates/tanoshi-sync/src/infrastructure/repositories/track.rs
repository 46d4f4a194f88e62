use async_trait::async_trait;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use tanoshi_tracker::{Track, TrackStatus};

use crate::{
    domain::repositories::track::{TrackRepository, TrackRepositoryError},
    infrastructure::database::Pool,
};

const COLUMNS: &str = r#"id,
    manga_id,
    tracker_id,
    remote_id,
    library_id,
    title,
    cover_url,
    tracking_url,
    status,
    score,
    last_chapter_read,
    total_chapters,
    started_reading_date,
    finished_reading_date"#;

#[derive(Clone)]
pub struct TrackRepositoryImpl {
    pool: Pool,
}

impl TrackRepositoryImpl {
    pub fn new<P: Into<Pool>>(pool: P) -> Self {
        Self { pool: pool.into() }
    }
}

fn track_from_row(row: &SqliteRow) -> Track {
    let status: String = row.get(8);
    let status = status.parse().unwrap_or_else(|e| {
        warn!("{e}, track {} treated as planning", row.get::<i64, _>(0));
        TrackStatus::Planning
    });

    Track {
        id: row.get(0),
        manga_id: row.get(1),
        tracker_id: row.get(2),
        remote_id: row.get(3),
        library_id: row.get(4),
        title: row.get(5),
        cover_url: row.get(6),
        tracking_url: row.get(7),
        status,
        score: row.get::<f64, _>(9) as f32,
        last_chapter_read: row.get::<f64, _>(10) as f32,
        total_chapters: row.get(11),
        started_reading_date: row.get(12),
        finished_reading_date: row.get(13),
    }
}

#[async_trait]
impl TrackRepository for TrackRepositoryImpl {
    async fn get_tracks_by_manga_id(
        &self,
        manga_id: i64,
    ) -> Result<Vec<Track>, TrackRepositoryError> {
        let tracks = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM track WHERE manga_id = ? ORDER BY tracker_id"
        ))
        .bind(manga_id)
        .fetch_all(&self.pool as &SqlitePool)
        .await?
        .iter()
        .map(track_from_row)
        .collect();

        Ok(tracks)
    }

    async fn get_track(
        &self,
        manga_id: i64,
        tracker_id: i32,
    ) -> Result<Option<Track>, TrackRepositoryError> {
        let track = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM track WHERE manga_id = ? AND tracker_id = ?"
        ))
        .bind(manga_id)
        .bind(tracker_id)
        .fetch_optional(&self.pool as &SqlitePool)
        .await?
        .as_ref()
        .map(track_from_row);

        Ok(track)
    }

    async fn get_all_tracks(&self) -> Result<Vec<Track>, TrackRepositoryError> {
        let tracks = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM track ORDER BY manga_id, tracker_id"
        ))
        .fetch_all(&self.pool as &SqlitePool)
        .await?
        .iter()
        .map(track_from_row)
        .collect();

        Ok(tracks)
    }

    async fn upsert_track(&self, track: &Track) -> Result<i64, TrackRepositoryError> {
        let row = sqlx::query(
            r#"INSERT INTO track(
                manga_id,
                tracker_id,
                remote_id,
                library_id,
                title,
                cover_url,
                tracking_url,
                status,
                score,
                last_chapter_read,
                total_chapters,
                started_reading_date,
                finished_reading_date
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(manga_id, tracker_id) DO UPDATE SET
            remote_id = excluded.remote_id,
            library_id = excluded.library_id,
            title = excluded.title,
            cover_url = excluded.cover_url,
            tracking_url = excluded.tracking_url,
            status = excluded.status,
            score = excluded.score,
            last_chapter_read = excluded.last_chapter_read,
            total_chapters = excluded.total_chapters,
            started_reading_date = excluded.started_reading_date,
            finished_reading_date = excluded.finished_reading_date
            RETURNING id"#,
        )
        .bind(track.manga_id)
        .bind(track.tracker_id)
        .bind(track.remote_id)
        .bind(track.library_id)
        .bind(&track.title)
        .bind(&track.cover_url)
        .bind(&track.tracking_url)
        .bind(track.status.as_str())
        .bind(track.score as f64)
        .bind(track.last_chapter_read as f64)
        .bind(track.total_chapters)
        .bind(track.started_reading_date)
        .bind(track.finished_reading_date)
        .fetch_one(&self.pool as &SqlitePool)
        .await?;

        Ok(row.get(0))
    }

    async fn delete_track(
        &self,
        manga_id: i64,
        tracker_id: i32,
    ) -> Result<bool, TrackRepositoryError> {
        let res = sqlx::query("DELETE FROM track WHERE manga_id = ? AND tracker_id = ?")
            .bind(manga_id)
            .bind(tracker_id)
            .execute(&self.pool as &SqlitePool)
            .await?;

        Ok(res.rows_affected() > 0)
    }
}
