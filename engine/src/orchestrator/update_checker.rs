use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::core::version::Version;
use crate::error::{EngineError, EngineResult};
use crate::logger;

/// Update information surfaced to the GUI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    pub current_version: String,
    pub latest_version: String,
    pub is_update_available: bool,
    pub release_notes: String,
    pub release_url: String,
    pub published_at: String,
}

/// Remote release API response structure.
#[derive(Debug, Deserialize)]
struct RemoteRelease {
    tag_name: String,
    body: Option<String>,
    published_at: String,
    html_url: String,
}

/// Periodic update checker driven by the orchestrator's polling thread.
pub struct UpdateChecker {
    cache_duration: Duration,
    cache_path: PathBuf,
    endpoint: String,
}

impl UpdateChecker {
    pub fn new(cache_path: PathBuf, endpoint: String) -> Self {
        Self {
            cache_duration: Duration::from_secs(24 * 60 * 60), // 24 hours
            cache_path,
            endpoint,
        }
    }

    /// Check for updates. `manual` bypasses the 24 h cache. Returns `None`
    /// when the cache says it is too soon to ask again.
    pub fn check_for_updates(&self, manual: bool) -> EngineResult<Option<UpdateInfo>> {
        let current_version = env!("CARGO_PKG_VERSION").to_string();

        if !manual && !self.should_check_update() {
            logger::log_debug(
                "skipping update check (cache not expired)",
                Some("updater"),
                None,
            );
            return Ok(None);
        }

        let latest_release = self.fetch_latest_release()?;

        // Remove 'v' prefix if present.
        let latest_version = latest_release.tag_name.trim_start_matches('v').to_string();
        let is_update_available =
            Version::parse(&latest_version)? > Version::parse(&current_version)?;

        self.update_last_check_time();

        let update_info = UpdateInfo {
            current_version,
            latest_version,
            is_update_available,
            release_notes: latest_release.body.unwrap_or_default(),
            release_url: latest_release.html_url,
            published_at: latest_release.published_at,
        };

        if is_update_available {
            logger::log_info(
                &format!(
                    "update available: {} -> {}",
                    update_info.current_version, update_info.latest_version
                ),
                Some("updater"),
            );
        } else {
            logger::log_info("no update available", Some("updater"));
        }

        Ok(Some(update_info))
    }

    fn fetch_latest_release(&self) -> EngineResult<RemoteRelease> {
        logger::log_debug(
            &format!("fetching release metadata from {}", self.endpoint),
            Some("updater"),
            None,
        );

        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("Floe/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| EngineError::network(e.to_string()))?;

        let response = client.get(&self.endpoint).send()?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(EngineError::Non200Response { status, body });
        }

        response
            .json::<RemoteRelease>()
            .map_err(|e| EngineError::Api(format!("bad release metadata: {}", e)))
    }

    fn should_check_update(&self) -> bool {
        match self.last_check_time() {
            Some(last) => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                Duration::from_secs(now.saturating_sub(last)) >= self.cache_duration
            }
            None => true, // never checked before
        }
    }

    fn last_check_time(&self) -> Option<u64> {
        std::fs::read_to_string(&self.cache_path)
            .ok()
            .and_then(|content| content.trim().parse().ok())
    }

    fn update_last_check_time(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if let Some(parent) = self.cache_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::write(&self.cache_path, now.to_string());
    }
}
