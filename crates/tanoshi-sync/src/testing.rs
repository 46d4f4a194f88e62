use sqlx::{Row, SqlitePool};

use crate::infrastructure::database::Pool;

pub async fn insert_manga(pool: &Pool, title: &str, status: &str) -> i64 {
    sqlx::query("INSERT INTO manga (title, status) VALUES (?, ?) RETURNING id")
        .bind(title)
        .bind(status)
        .fetch_one(pool as &SqlitePool)
        .await
        .unwrap()
        .get(0)
}

pub async fn insert_chapter(
    pool: &Pool,
    manga_id: i64,
    source_order: i32,
    number: f32,
    read: bool,
) -> i64 {
    sqlx::query(
        "INSERT INTO chapter (manga_id, source_order, number, read) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(manga_id)
    .bind(source_order)
    .bind(number as f64)
    .bind(read)
    .fetch_one(pool as &SqlitePool)
    .await
    .unwrap()
    .get(0)
}

pub async fn insert_history(pool: &Pool, chapter_id: i64, last_read: i64) {
    sqlx::query("INSERT INTO history (chapter_id, last_read) VALUES (?, ?)")
        .bind(chapter_id)
        .bind(last_read)
        .execute(pool as &SqlitePool)
        .await
        .unwrap();
}
