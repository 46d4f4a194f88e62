use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tanoshi_tracker::{CredentialStore, Credentials, Error};

use crate::infrastructure::database::Pool;

fn store_error(e: sqlx::Error) -> Error {
    error!("credential store: {e}");
    Error::Store(format!("{e}"))
}

/// Tracker logins kept next to the library.
#[derive(Clone)]
pub struct CredentialRepositoryImpl {
    pool: Pool,
}

impl CredentialRepositoryImpl {
    pub fn new<P: Into<Pool>>(pool: P) -> Self {
        Self { pool: pool.into() }
    }
}

#[async_trait]
impl CredentialStore for CredentialRepositoryImpl {
    async fn get_credentials(&self, tracker_id: i32) -> Result<Option<Credentials>, Error> {
        let credentials = sqlx::query(
            "SELECT username, password FROM tracker_credential WHERE tracker_id = ?",
        )
        .bind(tracker_id)
        .fetch_optional(&self.pool as &SqlitePool)
        .await
        .map_err(store_error)?
        .map(|row| Credentials {
            username: row.get(0),
            secret: row.get(1),
        })
        .filter(|c| !c.username.is_empty() || !c.secret.is_empty());

        Ok(credentials)
    }

    async fn set_credentials(
        &self,
        tracker_id: i32,
        username: &str,
        secret: &str,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"INSERT INTO tracker_credential(tracker_id, username, password) VALUES (?, ?, ?)
            ON CONFLICT(tracker_id) DO UPDATE SET
            username = excluded.username,
            password = excluded.password"#,
        )
        .bind(tracker_id)
        .bind(username)
        .bind(secret)
        .execute(&self.pool as &SqlitePool)
        .await
        .map_err(store_error)?;

        Ok(())
    }

    async fn clear_credentials(&self, tracker_id: i32) -> Result<(), Error> {
        sqlx::query(
            "UPDATE tracker_credential SET username = '', password = '' WHERE tracker_id = ?",
        )
        .bind(tracker_id)
        .execute(&self.pool as &SqlitePool)
        .await
        .map_err(store_error)?;

        Ok(())
    }

    async fn get_token(&self, tracker_id: i32) -> Result<Option<String>, Error> {
        let token = sqlx::query("SELECT token FROM tracker_credential WHERE tracker_id = ?")
            .bind(tracker_id)
            .fetch_optional(&self.pool as &SqlitePool)
            .await
            .map_err(store_error)?
            .and_then(|row| row.get::<Option<String>, _>(0));

        Ok(token)
    }

    async fn set_token(&self, tracker_id: i32, token: &str) -> Result<(), Error> {
        sqlx::query(
            r#"INSERT INTO tracker_credential(tracker_id, token) VALUES (?, ?)
            ON CONFLICT(tracker_id) DO UPDATE SET token = excluded.token"#,
        )
        .bind(tracker_id)
        .bind(token)
        .execute(&self.pool as &SqlitePool)
        .await
        .map_err(store_error)?;

        Ok(())
    }

    async fn clear_token(&self, tracker_id: i32) -> Result<(), Error> {
        sqlx::query("UPDATE tracker_credential SET token = NULL WHERE tracker_id = ?")
            .bind(tracker_id)
            .execute(&self.pool as &SqlitePool)
            .await
            .map_err(store_error)?;

        Ok(())
    }
}
