use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct MyAnimeListConfig {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub redirect_url: Option<String>,
}

/// Kavita logins carry the server url, nothing to configure yet.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct KavitaConfig {}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Config {
    #[serde(skip)]
    pub(crate) path: PathBuf,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_create_database")]
    pub create_database: bool,
    /// Seconds before any tracker request is abandoned
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    /// Seconds between refreshes of every track, `0` disables them
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    #[serde(default)]
    pub myanimelist: Option<MyAnimeListConfig>,
    #[serde(default)]
    pub kavita: Option<KavitaConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: tanoshi_home().join("config.yml"),
            database_path: default_database_path(),
            create_database: default_create_database(),
            request_timeout: default_request_timeout(),
            refresh_interval: default_refresh_interval(),
            myanimelist: None,
            kavita: Some(KavitaConfig::default()),
        }
    }
}

fn tanoshi_home() -> PathBuf {
    match std::env::var("TANOSHI_HOME") {
        Ok(path) => PathBuf::from(path),
        Err(_) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tanoshi"),
    }
}

fn default_database_path() -> String {
    let path = tanoshi_home();
    if !path.exists() {
        let _ = std::fs::create_dir_all(&path);
    }
    path.join("tanoshi.db").display().to_string()
}

fn default_create_database() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    30
}

fn default_refresh_interval() -> u64 {
    3600
}

impl Config {
    pub fn open<P: AsRef<Path>>(path: Option<P>) -> Result<Config, anyhow::Error> {
        let config_path = match path {
            Some(p) => PathBuf::new().join(p),
            None => tanoshi_home().join("config.yml"),
        };

        match std::fs::File::open(&config_path) {
            Ok(file) => {
                info!("open config from {config_path:?}");
                let mut cfg: Self = serde_yml::from_reader(file)?;
                cfg.path = config_path;
                Ok(cfg)
            }
            Err(_) => {
                let cfg = Config {
                    path: config_path,
                    ..Default::default()
                };
                cfg.save()?;
                info!("write default config at {:?}", cfg.path);
                Ok(cfg)
            }
        }
    }

    pub fn save(&self) -> Result<(), anyhow::Error> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_yml::to_string(&self)?)?;

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        if self.request_timeout == 0 {
            return Duration::from_secs(default_request_timeout());
        }
        Duration::from_secs(self.request_timeout)
    }
}
