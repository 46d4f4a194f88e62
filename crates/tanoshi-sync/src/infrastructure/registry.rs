use std::{collections::BTreeMap, sync::Arc};

use tanoshi_tracker::{CredentialStore, Error, Kavita, MyAnimeList, Tracker};

use crate::infrastructure::config::Config;

/// The configured trackers, one instance per id.
#[derive(Clone, Default)]
pub struct TrackerRegistry {
    trackers: BTreeMap<i32, Arc<dyn Tracker>>,
}

impl TrackerRegistry {
    pub fn new(trackers: Vec<Arc<dyn Tracker>>) -> Self {
        let mut registry = BTreeMap::new();
        for tracker in trackers {
            if registry.contains_key(&tracker.id()) {
                warn!("tracker {} registered twice, keeping the first", tracker.name());
                continue;
            }
            registry.insert(tracker.id(), tracker);
        }

        Self {
            trackers: registry,
        }
    }

    pub fn from_config(config: &Config, store: Arc<dyn CredentialStore>) -> Result<Self, Error> {
        let mut trackers: Vec<Arc<dyn Tracker>> = vec![];

        if let Some(mal) = &config.myanimelist {
            trackers.push(Arc::new(MyAnimeList::new(
                mal.client_id.clone(),
                mal.client_secret.clone(),
                mal.redirect_url.clone(),
                store.clone(),
                config.request_timeout(),
            )?));
        }

        if config.kavita.is_some() {
            trackers.push(Arc::new(Kavita::new(store, config.request_timeout())?));
        }

        let registry = Self::new(trackers);
        info!(
            "trackers: {:?}",
            registry.trackers().map(|t| t.name()).collect::<Vec<_>>()
        );
        Ok(registry)
    }

    pub fn get(&self, id: i32) -> Option<Arc<dyn Tracker>> {
        self.trackers.get(&id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<dyn Tracker>> {
        self.trackers
            .values()
            .find(|t| t.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn trackers(&self) -> impl Iterator<Item = &Arc<dyn Tracker>> {
        self.trackers.values()
    }

    pub async fn has_logged_trackers(&self) -> bool {
        for tracker in self.trackers.values() {
            if tracker.is_logged_in().await {
                return true;
            }
        }
        false
    }

    pub async fn logged_trackers(&self) -> Vec<Arc<dyn Tracker>> {
        let mut logged = vec![];
        for tracker in self.trackers.values() {
            if tracker.is_logged_in().await {
                logged.push(tracker.clone());
            }
        }
        logged
    }
}
