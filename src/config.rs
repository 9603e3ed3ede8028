//! Application-level configuration: session timings from an optional JSON file,
//! deployment settings from the environment.
//!
//! The session cache always runs in-process. `CACHE_URL` is read so a deployment
//! that still sets it gets a warning instead of silently losing its setting.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_with::{DurationSeconds, serde_as};
use tracing::{info, warn};

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "LIVE_QUIZ_CONFIG_PATH";
const DEFAULT_PORT: u16 = 8080;
const DEV_TOKEN_SECRET: &str = "live-quiz-dev-secret";

/// Durations driving the session state machine and its I/O.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Countdown between `START_LQS` and the first question.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub starting: Duration,
    /// Time a question is shown before media or options.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub questioning: Duration,
    /// Time the final standings stay up before the session ends by itself.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub concluding: Duration,
    /// Soft deadline of every store and cache call.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub io_deadline: Duration,
    /// Lifetime of cached session snapshots.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub cache_ttl: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            starting: Duration::from_secs(3),
            questioning: Duration::from_secs(5),
            concluding: Duration::from_secs(30),
            io_deadline: Duration::from_secs(3),
            cache_ttl: Duration::from_secs(5 * 60 * 60),
        }
    }
}

/// Immutable runtime configuration shared across the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub timings: Timings,
    /// Capacity of each client's outbound queue.
    pub outbox_capacity: usize,
    /// HS256 secret used to verify bearer credentials.
    pub access_token_secret: String,
    /// Allowed CORS origin; permissive when absent.
    pub host_origin: Option<String>,
    pub port: u16,
    pub mongo_uri: Option<String>,
    pub mongo_db: Option<String>,
    pub quiz_source_url: Option<String>,
    pub quiz_fixtures_path: Option<PathBuf>,
    /// External cache address from `CACHE_URL`; recorded but not dialed.
    pub cache_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            timings: Timings::default(),
            outbox_capacity: 10,
            access_token_secret: DEV_TOKEN_SECRET.into(),
            host_origin: None,
            port: DEFAULT_PORT,
            mongo_uri: None,
            mongo_db: None,
            quiz_source_url: None,
            quiz_fixtures_path: None,
            cache_url: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    timings: Timings,
    outbox_capacity: Option<usize>,
}

impl AppConfig {
    /// Load the file configuration (falling back to defaults) then apply environment overrides.
    pub fn load() -> Self {
        let raw = load_file();
        let mut config = Self {
            timings: raw.timings,
            outbox_capacity: raw.outbox_capacity.filter(|c| *c > 0).unwrap_or(10),
            ..Self::default()
        };
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        self.apply_vars(|name| {
            env::var(name).ok().filter(|value| !value.trim().is_empty())
        });
    }

    /// Apply deployment settings read through `var`, which yields non-empty values only.
    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        self.port = var("PORT")
            .or_else(|| var("SERVER_PORT"))
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);

        match var("ACCESS_TOKEN_SECRET") {
            Some(secret) => self.access_token_secret = secret,
            None => warn!("ACCESS_TOKEN_SECRET not set; using the development secret"),
        }
        self.host_origin = var("HOST_ORIGIN");
        self.mongo_uri = var("MONGO_URI");
        self.mongo_db = var("MONGO_DB");
        self.quiz_source_url = var("QUIZ_SOURCE_URL");
        self.quiz_fixtures_path = var("QUIZ_FIXTURES_PATH").map(PathBuf::from);
        self.cache_url = var("CACHE_URL");
        if let Some(url) = &self.cache_url {
            warn!(%url, "CACHE_URL is set but the session cache runs in-process; ignoring it");
        }
    }
}

fn load_file() -> RawConfig {
    let path = resolve_config_path();
    match fs::read_to_string(&path) {
        Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
            Ok(raw) => {
                info!(path = %path.display(), timings = ?raw.timings, "loaded session timings from config");
                raw
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to parse config; falling back to defaults"
                );
                RawConfig::default()
            }
        },
        Err(err) if err.kind() == ErrorKind::NotFound => {
            info!(
                path = %path.display(),
                "config file not found; using built-in defaults"
            );
            RawConfig::default()
        }
        Err(err) => {
            warn!(
                path = %path.display(),
                error = %err,
                "failed to read config; falling back to defaults"
            );
            RawConfig::default()
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
