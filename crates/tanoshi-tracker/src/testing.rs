use std::sync::Arc;

use axum::Router;

use crate::{CredentialStore, MemoryCredentialStore};

/// Serve `app` on an ephemeral local port, returning its base url.
pub async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

pub async fn store_with(
    tracker_id: i32,
    username: &str,
    secret: &str,
    token: &str,
) -> Arc<MemoryCredentialStore> {
    let store = Arc::new(MemoryCredentialStore::new());
    store
        .set_credentials(tracker_id, username, secret)
        .await
        .unwrap();
    store.set_token(tracker_id, token).await.unwrap();
    store
}
