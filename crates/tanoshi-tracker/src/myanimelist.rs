use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use oauth2::{
    AuthType, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, ErrorResponse,
    PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, RefreshToken, RequestTokenError,
    TokenResponse, TokenUrl,
    basic::{BasicClient, BasicTokenResponse},
    reqwest::async_http_client,
};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;

use crate::{
    CredentialStore, Descriptor, Error, SearchQuery, Session, Token, Tracker, Vault, http,
    model::{Track, TrackSearch, TrackStatus},
};

pub const NAME: &str = "myanimelist";
pub const ID: i32 = 1;

pub static DESCRIPTOR: Descriptor = Descriptor {
    id: ID,
    name: NAME,
    statuses: &[
        TrackStatus::Reading,
        TrackStatus::Completed,
        TrackStatus::OnHold,
        TrackStatus::Dropped,
        TrackStatus::Planning,
    ],
    score_scale: 10,
    supports_reading_dates: true,
    can_remove_from_service: true,
    color: 0x2E51A2,
};

const API_URL: &str = "https://api.myanimelist.net/v2";
const AUTHORIZE_URL: &str = "https://myanimelist.net/v1/oauth2/authorize";
const TOKEN_URL: &str = "https://myanimelist.net/v1/oauth2/token";
const BASE_URL: &str = "https://myanimelist.net";

const SEARCH_FIELDS: &str = "id,title,synopsis,num_chapters,main_picture,status,media_type";
const DETAIL_FIELDS: &str = "id,title,synopsis,num_chapters,main_picture,status,media_type,my_list_status{start_date,finish_date}";
const LIST_FIELDS: &str = "list_status{start_date,finish_date},num_chapters,synopsis,main_picture,status";

/// Native list statuses.
pub mod status {
    use crate::model::TrackStatus;

    pub const READING: &str = "reading";
    pub const COMPLETED: &str = "completed";
    pub const ON_HOLD: &str = "on_hold";
    pub const DROPPED: &str = "dropped";
    pub const PLAN_TO_READ: &str = "plan_to_read";

    pub const DEFAULT: TrackStatus = TrackStatus::Reading;

    pub fn to_native(status: TrackStatus) -> &'static str {
        match status {
            TrackStatus::Planning => PLAN_TO_READ,
            TrackStatus::Reading => READING,
            TrackStatus::Completed => COMPLETED,
            TrackStatus::OnHold => ON_HOLD,
            TrackStatus::Dropped => DROPPED,
        }
    }

    pub fn from_native(status: &str) -> TrackStatus {
        match status {
            PLAN_TO_READ => TrackStatus::Planning,
            READING => TrackStatus::Reading,
            COMPLETED => TrackStatus::Completed,
            ON_HOLD => TrackStatus::OnHold,
            DROPPED => TrackStatus::Dropped,
            other => {
                warn!("unknown myanimelist status {other}, using {DEFAULT}");
                DEFAULT
            }
        }
    }
}

/// 0-100 to the 0-10 list score, rounded to nearest.
pub fn score_to_native(score: f32) -> i64 {
    (score / 10.0).round().clamp(0.0, 10.0) as i64
}

pub fn score_from_native(score: i64) -> f32 {
    score.clamp(0, 10) as f32 * 10.0
}

fn date_to_native(epoch_millis: i64) -> Option<String> {
    if epoch_millis <= 0 {
        return None;
    }
    DateTime::from_timestamp_millis(epoch_millis).map(|date| date.format("%Y-%m-%d").to_string())
}

fn date_from_native(date: Option<&str>) -> i64 {
    date.and_then(|date| NaiveDate::parse_from_str(date, "%Y-%m-%d").ok())
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|date| date.and_utc().timestamp_millis())
        .unwrap_or(0)
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct MyListStatus {
    pub status: Option<String>,
    pub score: i64,
    pub num_chapters_read: i64,
    pub is_rereading: bool,
    pub start_date: Option<String>,
    pub finish_date: Option<String>,
}

impl MyListStatus {
    fn apply_to(&self, track: &mut Track) {
        track.status = match (self.is_rereading, self.status.as_deref()) {
            (true, _) => TrackStatus::Reading,
            (false, Some(native)) => status::from_native(native),
            (false, None) => status::DEFAULT,
        };
        track.score = score_from_native(self.score);
        track.last_chapter_read = self.num_chapters_read as f32;
        track.started_reading_date = date_from_native(self.start_date.as_deref());
        track.finished_reading_date = date_from_native(self.finish_date.as_deref());
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct MainPicture {
    pub medium: String,
    pub large: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct Manga {
    pub id: i64,
    pub title: String,
    pub synopsis: String,
    pub num_chapters: i32,
    pub main_picture: Option<MainPicture>,
    pub status: String,
    pub media_type: String,
    pub my_list_status: Option<MyListStatus>,
}

impl Manga {
    fn tracking_url(&self) -> String {
        format!("{BASE_URL}/manga/{}", self.id)
    }

    fn into_search(self, list_status: Option<&MyListStatus>) -> TrackSearch {
        let list_status = list_status.or(self.my_list_status.as_ref()).map(|s| {
            let mut track = Track::default();
            s.apply_to(&mut track);
            track.status
        });

        TrackSearch {
            tracker_id: ID,
            remote_id: self.id,
            library_id: None,
            tracking_url: self.tracking_url(),
            title: self.title,
            summary: self.synopsis,
            cover_url: self.main_picture.map(|p| p.large).unwrap_or_default(),
            publishing_status: self.status.replace('_', " "),
            total_chapters: self.num_chapters,
            list_status,
        }
    }

    fn apply_to(&self, track: &mut Track) {
        track.remote_id = self.id;
        track.tracking_url = self.tracking_url();
        if !self.title.is_empty() {
            track.title = self.title.clone();
        }
        if let Some(picture) = &self.main_picture {
            track.cover_url = picture.large.clone();
        }
        if self.num_chapters != 0 {
            track.total_chapters = self.num_chapters;
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Node<T> {
    pub node: T,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetMangaListResponse {
    pub data: Vec<Node<Manga>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListEntry {
    pub node: Manga,
    pub list_status: Option<MyListStatus>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct Paging {
    pub next: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetUserListResponse {
    pub data: Vec<ListEntry>,
    #[serde(default)]
    pub paging: Paging,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub name: String,
}

fn classify_oauth_error<RE, T>(e: RequestTokenError<RE, T>) -> Error
where
    RE: std::error::Error + 'static,
    T: ErrorResponse + 'static,
{
    match e {
        RequestTokenError::ServerResponse(res) => {
            warn!("myanimelist rejected token request: {res:?}");
            Error::AuthExpired
        }
        RequestTokenError::Request(e) => Error::Transient(format!("{e}")),
        RequestTokenError::Parse(e, _) => Error::RemoteProtocol(format!("{e}")),
        RequestTokenError::Other(e) => Error::RemoteProtocol(e),
    }
}

fn into_token(res: &BasicTokenResponse) -> Token {
    Token {
        token_type: "bearer".to_string(),
        expires_in: res
            .expires_in()
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default(),
        access_token: res.access_token().secret().to_owned(),
        refresh_token: res
            .refresh_token()
            .map(|t| t.secret().to_owned())
            .unwrap_or_default(),
    }
}

/// OAuth2 (PKCE) backend. The password given to `login` is the
/// authorization code, the username is the PKCE verifier when the
/// authorization was started by another process.
pub struct MyAnimeList {
    client_id: String,
    client_secret: Option<String>,
    redirect_url: Option<String>,
    api_url: String,
    authorize_url: String,
    token_url: String,
    timeout: Duration,
    api_client: reqwest::Client,
    vault: Vault,
    pending_verifier: Mutex<Option<String>>,
}

impl MyAnimeList {
    pub fn new(
        client_id: String,
        client_secret: Option<String>,
        redirect_url: Option<String>,
        store: Arc<dyn CredentialStore>,
        timeout: Duration,
    ) -> Result<Self, Error> {
        Ok(Self {
            client_id,
            client_secret,
            redirect_url,
            api_url: API_URL.to_string(),
            authorize_url: AUTHORIZE_URL.to_string(),
            token_url: TOKEN_URL.to_string(),
            timeout,
            api_client: http::client(timeout)?,
            vault: Vault::new(ID, store),
            pending_verifier: Mutex::new(None),
        })
    }

    pub fn with_endpoints(mut self, api_url: &str, authorize_url: &str, token_url: &str) -> Self {
        self.api_url = api_url.trim_end_matches('/').to_string();
        self.authorize_url = authorize_url.to_string();
        self.token_url = token_url.to_string();
        self
    }

    fn oauth_client(&self) -> Result<BasicClient, Error> {
        let authorize_url =
            AuthUrl::new(self.authorize_url.clone()).map_err(|e| Error::Validation(format!("{e}")))?;
        let token_url =
            TokenUrl::new(self.token_url.clone()).map_err(|e| Error::Validation(format!("{e}")))?;

        let mut client = BasicClient::new(
            ClientId::new(self.client_id.clone()),
            self.client_secret.clone().map(ClientSecret::new),
            authorize_url,
            Some(token_url),
        )
        .set_auth_type(AuthType::RequestBody);

        if let Some(redirect_url) = &self.redirect_url {
            let redirect_url = RedirectUrl::new(redirect_url.clone())
                .map_err(|e| Error::Validation(format!("{e}")))?;
            client = client.set_redirect_uri(redirect_url);
        }

        Ok(client)
    }

    /// Start an authorization, the verifier is kept for the following `login`.
    pub fn authorize_url(&self) -> Result<Session, Error> {
        let (pkce_code_challenge, pkce_code_verifier) = PkceCodeChallenge::new_random_plain();
        let (authorize_url, csrf_state) = self
            .oauth_client()?
            .authorize_url(CsrfToken::new_random)
            .set_pkce_challenge(pkce_code_challenge)
            .url();

        *self
            .pending_verifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(pkce_code_verifier.secret().clone());

        Ok(Session {
            authorize_url: authorize_url.to_string(),
            csrf_state,
            pkce_code_verifier: Some(pkce_code_verifier),
        })
    }

    async fn token(&self) -> Result<Token, Error> {
        let token = self.vault.token().await?.ok_or(Error::NoCredentials)?;
        match serde_json::from_str(&token) {
            Ok(token) => Ok(token),
            Err(e) => {
                error!("stored myanimelist token is unreadable: {e}");
                Err(self.vault.expire().await)
            }
        }
    }

    async fn refresh_token(&self, rejected: Token) -> Result<Token, Error> {
        let _gate = self.vault.exclusive().await;

        // another request may have refreshed while we waited
        let current = self.token().await?;
        if current.access_token != rejected.access_token {
            return Ok(current);
        }

        if current.refresh_token.is_empty() {
            return Err(self.vault.expire().await);
        }

        debug!("refreshing myanimelist token");
        let client = self.oauth_client()?;
        let refresh_token = RefreshToken::new(current.refresh_token.clone());
        let res = tokio::time::timeout(
            self.timeout,
            client
                .exchange_refresh_token(&refresh_token)
                .request_async(async_http_client),
        )
        .await?;

        match res {
            Ok(res) => {
                let token = into_token(&res);
                self.vault
                    .replace_token(&serde_json::to_string(&token)?)
                    .await?;
                Ok(token)
            }
            Err(e) => match classify_oauth_error(e) {
                Error::AuthExpired => Err(self.vault.expire().await),
                e => Err(e),
            },
        }
    }

    async fn checked(&self, res: Response, access_token: &str) -> Result<Response, Error> {
        match http::check(res) {
            Err(Error::AuthExpired) => Err(self
                .vault
                .expire_rejected(|stored| {
                    serde_json::from_str::<Token>(stored)
                        .map(|token| token.access_token == access_token)
                        .unwrap_or(true)
                })
                .await),
            res => res,
        }
    }

    /// Send an authenticated request, refreshing the token once on 401.
    async fn request<F>(&self, build: F) -> Result<Response, Error>
    where
        F: Fn(&reqwest::Client, &str) -> RequestBuilder + Send + Sync,
    {
        let token = self.token().await?;
        let res = http::send(build(&self.api_client, &token.access_token)).await?;
        if res.status() != StatusCode::UNAUTHORIZED {
            return self.checked(res, &token.access_token).await;
        }

        let token = self.refresh_token(token).await?;
        let res = http::send(build(&self.api_client, &token.access_token)).await?;
        self.checked(res, &token.access_token).await
    }

    async fn get_current_user(&self, access_token: &str) -> Result<User, Error> {
        let res = http::send(
            self.api_client
                .get(format!("{}/users/@me", self.api_url))
                .bearer_auth(access_token),
        )
        .await?;
        http::json(http::check(res)?).await
    }

    pub async fn get_manga_details(&self, id: i64) -> Result<Manga, Error> {
        let url = format!("{}/manga/{id}", self.api_url);
        let res = self
            .request(|client, token| {
                client
                    .get(&url)
                    .bearer_auth(token)
                    .query(&[("fields", DETAIL_FIELDS)])
            })
            .await?;
        http::json(res).await
    }

    async fn search_manga(&self, query: &str) -> Result<Vec<TrackSearch>, Error> {
        let url = format!("{}/manga", self.api_url);
        let res = self
            .request(|client, token| {
                client.get(&url).bearer_auth(token).query(&[
                    ("q", query),
                    ("limit", "20"),
                    ("nsfw", "true"),
                    ("fields", SEARCH_FIELDS),
                ])
            })
            .await?;
        let res: GetMangaListResponse = http::json(res).await?;

        Ok(res
            .data
            .into_iter()
            .map(|node| node.node.into_search(None))
            .collect())
    }

    /// Entries of the user's own list whose title contains `title`.
    async fn find_list_items(&self, title: &str) -> Result<Vec<TrackSearch>, Error> {
        let title = title.to_lowercase();
        let mut next = Some(format!(
            "{}/users/@me/mangalist?fields={LIST_FIELDS}&limit=1000&nsfw=true",
            self.api_url
        ));

        let mut items = vec![];
        while let Some(url) = next.take() {
            let res = self
                .request(|client, token| client.get(&url).bearer_auth(token))
                .await?;
            let res: GetUserListResponse = http::json(res).await?;

            items.extend(
                res.data
                    .into_iter()
                    .filter(|entry| entry.node.title.to_lowercase().contains(&title))
                    .map(|entry| entry.node.into_search(entry.list_status.as_ref())),
            );
            next = res.paging.next;
        }

        Ok(items)
    }

    fn entry_url(&self, track: &Track) -> Result<String, Error> {
        if track.remote_id <= 0 {
            return Err(Error::Validation(
                "track has no myanimelist id".to_string(),
            ));
        }
        Ok(format!("{}/manga/{}/my_list_status", self.api_url, track.remote_id))
    }
}

#[async_trait]
impl Tracker for MyAnimeList {
    fn descriptor(&self) -> &'static Descriptor {
        &DESCRIPTOR
    }

    fn display_score(&self, track: &Track) -> String {
        score_to_native(track.score).to_string()
    }

    async fn is_logged_in(&self) -> bool {
        self.vault.is_logged_in().await
    }

    async fn login(&self, username: &str, password: &str) -> Result<(), Error> {
        let _gate = self.vault.exclusive().await;

        let verifier = if username.is_empty() {
            self.pending_verifier
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .ok_or_else(|| Error::Validation("no authorization in progress".to_string()))?
        } else {
            username.to_string()
        };

        let result: Result<(), Error> = async {
            let client = self.oauth_client()?;
            let res = tokio::time::timeout(
                self.timeout,
                client
                    .exchange_code(AuthorizationCode::new(password.to_string()))
                    .set_pkce_verifier(PkceCodeVerifier::new(verifier))
                    .request_async(async_http_client),
            )
            .await?
            .map_err(classify_oauth_error)?;

            let token = into_token(&res);
            let user = self.get_current_user(&token.access_token).await?;
            self.vault
                .save(&user.name, &token.access_token, &serde_json::to_string(&token)?)
                .await?;
            info!("logged in to myanimelist as {}", user.name);
            Ok(())
        }
        .await;

        if let Err(e) = &result {
            error!("failed to login to myanimelist: {e}");
            if let Err(e) = self.vault.clear().await {
                error!("failed to clear myanimelist credentials: {e}");
            }
        }

        result
    }

    async fn logout(&self) -> Result<(), Error> {
        let _gate = self.vault.exclusive().await;
        self.vault.clear().await
    }

    async fn search(&self, query: &str) -> Result<Vec<TrackSearch>, Error> {
        match SearchQuery::parse(query) {
            SearchQuery::Id(id) => Ok(vec![self.get_manga_details(id).await?.into_search(None)]),
            SearchQuery::List(title) => self.find_list_items(title).await,
            SearchQuery::Text(text) => self.search_manga(text).await,
        }
    }

    async fn find_remote(&self, track: &Track) -> Result<Option<Track>, Error> {
        if track.remote_id <= 0 {
            return Err(Error::Validation(
                "track has no myanimelist id".to_string(),
            ));
        }

        let manga = match self.get_manga_details(track.remote_id).await {
            Ok(manga) => manga,
            Err(Error::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };

        let Some(list_status) = &manga.my_list_status else {
            return Ok(None);
        };

        let mut remote = track.clone();
        manga.apply_to(&mut remote);
        list_status.apply_to(&mut remote);
        Ok(Some(remote))
    }

    async fn push(&self, track: &Track) -> Result<Track, Error> {
        let url = self.entry_url(track)?;

        let mut params = vec![
            ("status", status::to_native(track.status).to_string()),
            ("is_rereading", "false".to_string()),
            ("score", score_to_native(track.score).to_string()),
            (
                "num_chapters_read",
                (track.last_chapter_read.floor() as i64).to_string(),
            ),
        ];
        if let Some(start_date) = date_to_native(track.started_reading_date) {
            params.push(("start_date", start_date));
        }
        if let Some(finish_date) = date_to_native(track.finished_reading_date) {
            params.push(("finish_date", finish_date));
        }

        debug!("update myanimelist entry {}", track.remote_id);
        let res = self
            .request(|client, token| client.put(&url).bearer_auth(token).form(&params))
            .await?;
        let list_status: MyListStatus = http::json(res).await?;

        let mut remote = track.clone();
        list_status.apply_to(&mut remote);
        // the remote only stores whole chapters
        if remote.last_chapter_read < track.last_chapter_read {
            remote.last_chapter_read = track.last_chapter_read;
        }
        Ok(remote)
    }

    async fn remove(&self, track: &Track) -> Result<(), Error> {
        let url = self.entry_url(track)?;
        match self
            .request(|client, token| client.delete(&url).bearer_auth(token))
            .await
        {
            Ok(_) | Err(Error::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
