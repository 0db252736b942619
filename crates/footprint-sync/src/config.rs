use std::path::{Path, PathBuf};
use std::time::Duration;

use footprint_adapters::{ConnectorSettings, Credentials};
use footprint_storage::HttpClientConfig;

use crate::orchestrator::SyncOptions;

/// Process-wide settings, read once at start-up and handed to every
/// component that needs them.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// One `<source>.db` per source.
    pub data_dir: PathBuf,
    pub import_dir: PathBuf,
    pub publish_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub checkpoint_every: usize,
    pub max_pages: usize,
    pub credentials: Credentials,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup. Unparseable numbers
    /// fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let path = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(default))
        };
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default)
        };
        let secret = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            data_dir: path("FOOTPRINT_DATA_DIR", "./data"),
            import_dir: path("FOOTPRINT_IMPORT_DIR", "./imports"),
            publish_dir: path("FOOTPRINT_PUBLISH_DIR", "./publish"),
            user_agent: lookup("FOOTPRINT_USER_AGENT")
                .unwrap_or_else(|| format!("footprint/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: number("FOOTPRINT_HTTP_TIMEOUT_SECS", 30),
            checkpoint_every: number("FOOTPRINT_CHECKPOINT_EVERY", 100) as usize,
            max_pages: number("FOOTPRINT_MAX_PAGES", 10_000) as usize,
            credentials: Credentials {
                readwise_token: secret("READWISE_ACCESS_TOKEN"),
                foursquare_token: secret("FOURSQUARE_ACCESS_TOKEN"),
                foursquare_api_key: secret("FOURSQUARE_API_KEY"),
                github_token: secret("GITHUB_TOKEN"),
                github_username: secret("GITHUB_USERNAME"),
                hardcover_token: secret("HARDCOVER_ACCESS_TOKEN"),
            },
        }
    }

    /// Defaults with every directory placed under `root`.
    pub fn rooted(root: &Path) -> Self {
        Self {
            data_dir: root.join("data"),
            import_dir: root.join("imports"),
            publish_dir: root.join("publish"),
            ..Self::from_lookup(|_| None)
        }
    }

    pub fn connector_settings(&self) -> ConnectorSettings {
        ConnectorSettings {
            credentials: self.credentials.clone(),
            import_dir: self.import_dir.clone(),
            http: HttpClientConfig {
                timeout: Duration::from_secs(self.http_timeout_secs),
                user_agent: Some(self.user_agent.clone()),
                ..Default::default()
            },
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            checkpoint_every: self.checkpoint_every,
            max_pages: self.max_pages,
        }
    }
}
