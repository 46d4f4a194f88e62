use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;

use crate::{
    CredentialStore, Descriptor, Error, SearchQuery, Tracker, Vault, http,
    model::{Track, TrackSearch, TrackStatus},
};

pub const NAME: &str = "kavita";
pub const ID: i32 = 8;

pub static DESCRIPTOR: Descriptor = Descriptor {
    id: ID,
    name: NAME,
    statuses: &[
        TrackStatus::Planning,
        TrackStatus::Reading,
        TrackStatus::Completed,
    ],
    score_scale: 0,
    supports_reading_dates: false,
    can_remove_from_service: false,
    color: 0x4AC694,
};

const PLUGIN_NAME: &str = "Tanoshi";

pub mod status {
    use crate::model::TrackStatus;

    pub const UNREAD: i32 = 1;
    pub const READING: i32 = 2;
    pub const COMPLETED: i32 = 3;

    /// Kavita has no notion of paused or dropped series.
    pub fn to_native(status: TrackStatus) -> i32 {
        match status {
            TrackStatus::Planning => UNREAD,
            TrackStatus::Completed => COMPLETED,
            TrackStatus::Reading | TrackStatus::OnHold | TrackStatus::Dropped => READING,
        }
    }

    pub fn from_native(status: i32) -> TrackStatus {
        match status {
            READING => TrackStatus::Reading,
            COMPLETED => TrackStatus::Completed,
            _ => TrackStatus::Planning,
        }
    }
}

/// `https://host/api/Series/12` -> `https://host/api`
pub fn api_from_url(url: &str) -> Result<String, Error> {
    match url.split_once("/api/") {
        Some((base, _)) if !base.is_empty() => Ok(format!("{base}/api")),
        _ => Err(Error::Validation(format!("{url} is not a kavita api url"))),
    }
}

/// `https://host/api/Series/12` -> `12`
pub fn id_from_url(url: &str) -> Result<i64, Error> {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| Error::Validation(format!("{url} has no series id")))
}

fn parse_number(number: &str) -> f32 {
    number.replace(',', ".").trim().parse().unwrap_or(0.0)
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthenticationDto {
    pub token: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SeriesDto {
    pub id: i64,
    pub name: String,
    pub pages: i64,
    pub pages_read: i64,
    pub library_id: Option<i64>,
}

impl SeriesDto {
    fn status(&self) -> TrackStatus {
        if self.pages_read == 0 {
            TrackStatus::Planning
        } else if self.pages_read >= self.pages {
            TrackStatus::Completed
        } else {
            TrackStatus::Reading
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct ChapterDto {
    pub id: i64,
    pub number: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct VolumeDto {
    pub id: i64,
    pub number: i64,
    pub chapters: Vec<ChapterDto>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SearchSeriesDto {
    pub series_id: i64,
    pub name: String,
    pub library_id: Option<i64>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct SearchResultDto {
    pub series: Vec<SearchSeriesDto>,
}

/// Volumes made of a single unnumbered file count as one chapter each.
pub fn total_chapters(volumes: &[VolumeDto]) -> i32 {
    let mut volume_count = 0;
    let mut max_chapter = 0.0_f32;

    for volume in volumes.iter().filter(|v| !v.chapters.is_empty()) {
        let max = volume
            .chapters
            .iter()
            .map(|c| parse_number(&c.number))
            .fold(0.0_f32, f32::max);
        if max == 0.0 {
            volume_count += 1;
        } else if max > max_chapter {
            max_chapter = max;
        }
    }

    (max_chapter as i32).max(volume_count)
}

/// Self hosted Kavita server, logged in with the server url and an api key.
pub struct Kavita {
    api_client: reqwest::Client,
    vault: Vault,
}

impl Kavita {
    pub fn new(store: Arc<dyn CredentialStore>, timeout: Duration) -> Result<Self, Error> {
        Ok(Self {
            api_client: http::client(timeout)?,
            vault: Vault::new(ID, store),
        })
    }

    async fn authenticate(&self, api_url: &str, api_key: &str) -> Result<String, Error> {
        let res = http::send(
            self.api_client
                .post(format!("{api_url}/Plugin/authenticate"))
                .query(&[("apiKey", api_key), ("pluginName", PLUGIN_NAME)])
                .json(&serde_json::json!({})),
        )
        .await?;
        let auth: AuthenticationDto = http::json(http::check(res)?).await?;
        Ok(auth.token)
    }

    /// Authenticate again with the stored api key.
    async fn renew_token(&self, rejected: &str) -> Result<String, Error> {
        let _gate = self.vault.exclusive().await;

        if let Some(current) = self.vault.token().await? {
            if current != rejected {
                return Ok(current);
            }
        }

        let credentials = self.vault.credentials().await?.ok_or(Error::NoCredentials)?;
        match self
            .authenticate(&credentials.username, &credentials.secret)
            .await
        {
            Ok(token) => {
                self.vault.replace_token(&token).await?;
                Ok(token)
            }
            Err(Error::AuthExpired) => Err(self.vault.expire().await),
            Err(e) => Err(e),
        }
    }

    async fn api_url(&self) -> Result<String, Error> {
        self.vault
            .credentials()
            .await?
            .map(|c| c.username)
            .ok_or(Error::NoCredentials)
    }

    async fn request<F>(&self, build: F) -> Result<Response, Error>
    where
        F: Fn(&reqwest::Client, &str) -> RequestBuilder + Send + Sync,
    {
        let token = self.vault.token().await?.ok_or(Error::NoCredentials)?;
        let res = http::send(build(&self.api_client, &token)).await?;
        let (res, token) = if res.status() == StatusCode::UNAUTHORIZED {
            debug!("kavita token rejected, authenticating again");
            let token = self.renew_token(&token).await?;
            (http::send(build(&self.api_client, &token)).await?, token)
        } else {
            (res, token)
        };

        match http::check(res) {
            Err(Error::AuthExpired) => Err(self
                .vault
                .expire_rejected(|stored| stored == token)
                .await),
            res => res,
        }
    }

    async fn get_series(&self, api_url: &str, id: i64) -> Result<SeriesDto, Error> {
        let url = format!("{api_url}/Series/{id}");
        let res = self
            .request(|client, token| client.get(&url).bearer_auth(token))
            .await?;
        http::json(res).await
    }

    async fn get_total_chapters(&self, api_url: &str, id: i64) -> Result<i32, Error> {
        let url = format!("{api_url}/Series/volumes");
        let res = self
            .request(|client, token| {
                client
                    .get(&url)
                    .bearer_auth(token)
                    .query(&[("seriesId", id)])
            })
            .await?;
        let volumes: Vec<VolumeDto> = http::json(res).await?;
        Ok(total_chapters(&volumes))
    }

    async fn get_latest_chapter_read(&self, api_url: &str, id: i64) -> Result<f32, Error> {
        let url = format!("{api_url}/Tachiyomi/latest-chapter");
        let res = self
            .request(|client, token| {
                client
                    .get(&url)
                    .bearer_auth(token)
                    .query(&[("seriesId", id)])
            })
            .await?;
        if res.status() == StatusCode::NO_CONTENT {
            return Ok(0.0);
        }
        let chapter: ChapterDto = http::json(res).await?;
        Ok(parse_number(&chapter.number))
    }

    async fn fetch(&self, api_url: &str, id: i64, track: &Track) -> Result<Track, Error> {
        let series = self.get_series(api_url, id).await?;

        let mut remote = track.clone();
        remote.remote_id = series.id;
        remote.library_id = series.library_id;
        remote.title = series.name.clone();
        remote.tracking_url = format!("{api_url}/Series/{}", series.id);
        remote.cover_url = format!("{api_url}/image/series-cover?seriesId={}", series.id);
        remote.status = series.status();
        remote.total_chapters = self.get_total_chapters(api_url, id).await?;
        remote.last_chapter_read = self.get_latest_chapter_read(api_url, id).await?;
        Ok(remote)
    }

    /// Entries are addressed by their tracking url, the id is a fallback.
    async fn locate(&self, track: &Track) -> Result<(String, i64), Error> {
        if !track.tracking_url.is_empty() {
            return Ok((
                api_from_url(&track.tracking_url)?,
                id_from_url(&track.tracking_url)?,
            ));
        }
        if track.remote_id > 0 {
            return Ok((self.api_url().await?, track.remote_id));
        }
        Err(Error::Validation("track has no kavita series".to_string()))
    }

    fn search_result(api_url: &str, series: SearchSeriesDto) -> TrackSearch {
        TrackSearch {
            tracker_id: ID,
            remote_id: series.series_id,
            library_id: series.library_id,
            title: series.name,
            cover_url: format!(
                "{api_url}/image/series-cover?seriesId={}",
                series.series_id
            ),
            tracking_url: format!("{api_url}/Series/{}", series.series_id),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Tracker for Kavita {
    fn descriptor(&self) -> &'static Descriptor {
        &DESCRIPTOR
    }

    fn display_score(&self, _track: &Track) -> String {
        String::new()
    }

    async fn is_logged_in(&self) -> bool {
        self.vault.is_logged_in().await
    }

    /// `username` is the server url, `password` the api key.
    async fn login(&self, username: &str, password: &str) -> Result<(), Error> {
        let _gate = self.vault.exclusive().await;

        let api_url = match api_from_url(&format!("{}/", username.trim_end_matches('/'))) {
            Ok(api_url) => api_url,
            Err(_) => format!("{}/api", username.trim_end_matches('/')),
        };

        let result = match self.authenticate(&api_url, password).await {
            Ok(token) => self.vault.save(&api_url, password, &token).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            error!("failed to login to kavita at {api_url}: {e}");
            if let Err(e) = self.vault.clear().await {
                error!("failed to clear kavita credentials: {e}");
            }
        } else {
            info!("logged in to kavita at {api_url}");
        }

        result
    }

    async fn logout(&self) -> Result<(), Error> {
        let _gate = self.vault.exclusive().await;
        self.vault.clear().await
    }

    async fn search(&self, query: &str) -> Result<Vec<TrackSearch>, Error> {
        let api_url = self.api_url().await?;

        let text = match SearchQuery::parse(query) {
            SearchQuery::Id(id) => {
                let series = self.get_series(&api_url, id).await?;
                return Ok(vec![Self::search_result(
                    &api_url,
                    SearchSeriesDto {
                        series_id: series.id,
                        name: series.name,
                        library_id: series.library_id,
                    },
                )]);
            }
            SearchQuery::List(title) | SearchQuery::Text(title) => title,
        };

        let url = format!("{api_url}/Search/search");
        let res = self
            .request(|client, token| {
                client
                    .get(&url)
                    .bearer_auth(token)
                    .query(&[("queryString", text)])
            })
            .await?;
        let result: SearchResultDto = http::json(res).await?;

        Ok(result
            .series
            .into_iter()
            .map(|series| Self::search_result(&api_url, series))
            .collect())
    }

    async fn find_remote(&self, track: &Track) -> Result<Option<Track>, Error> {
        let (api_url, id) = self.locate(track).await?;
        match self.fetch(&api_url, id, track).await {
            Ok(remote) => Ok(Some(remote)),
            Err(Error::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn push(&self, track: &Track) -> Result<Track, Error> {
        let (api_url, id) = self.locate(track).await?;

        let url = format!("{api_url}/Tachiyomi/mark-chapter-until-as-read");
        let chapter_number = track.last_chapter_read.to_string();
        debug!("mark kavita series {id} read until {chapter_number}");
        self.request(|client, token| {
            client
                .post(&url)
                .bearer_auth(token)
                .query(&[("seriesId", id.to_string()), ("chapterNumber", chapter_number.clone())])
                .json(&serde_json::json!({}))
        })
        .await?;

        let mut remote = self.fetch(&api_url, id, track).await?;
        // the server derives status from pages, keep the user's choice
        remote.status = status::from_native(status::to_native(track.status));
        remote.score = track.score;
        remote.started_reading_date = track.started_reading_date;
        remote.finished_reading_date = track.finished_reading_date;
        Ok(remote)
    }
}
