use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::Error;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub fn client(timeout: Duration) -> Result<reqwest::Client, Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .user_agent(concat!("tanoshi-tracker/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::RemoteProtocol(format!("failed to build http client: {e}")))
}

/// Send a request, the response status is not inspected.
pub async fn send(req: RequestBuilder) -> Result<Response, Error> {
    req.send().await.map_err(|e| {
        let e = Error::from(e);
        if e.is_transient() {
            warn!("{e}");
        }
        e
    })
}

/// Map a response status to the error taxonomy.
pub fn check(res: Response) -> Result<Response, Error> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::AuthExpired),
        StatusCode::NOT_FOUND => Err(Error::NotFound),
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => {
            warn!("{} responded with {status}", res.url());
            Err(Error::Transient(format!("server responded with {status}")))
        }
        _ => {
            error!("{} responded with {status}", res.url());
            Err(Error::RemoteProtocol(format!(
                "server responded with {status}"
            )))
        }
    }
}

pub async fn json<T: DeserializeOwned>(res: Response) -> Result<T, Error> {
    let url = res.url().to_string();
    let body = res.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| {
        error!("malformed response from {url}: {e}");
        Error::RemoteProtocol(format!("{e}"))
    })
}
