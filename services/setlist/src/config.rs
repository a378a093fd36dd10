//!
//! src/config.rs  Andrew Belles  Oct 17th, 2026
//!
//! Loads every knob the recorder needs from the environment (and .env)
//! into typed configuration with sane defaults
//!

use url::Url;
use std::time;
use crate::errors::SetListError;
use crate::types::UserId;

/// Constants for HTTP Config
pub const HTTP_CONNECT_TIMEOUT: u64 = 2000;
pub const HTTP_POOL_MAX_IDLE: usize = 16;
pub const HTTP_POOL_IDLE_TIMEOUT: u64 = 90000;
pub const HTTP_MAX_REDIRECTS: u8 = 4;

pub const RETRY_MAX_ATTEMPTS: u8 = 3;
pub const RETRY_BASE_BACKOFF: u64 = 250;
pub const RETRY_JITTER: bool = true;
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Constants for the recording cycle
pub const RECORD_WINDOW_MS: u64 = 10_000;
pub const IDLE_WINDOW_MS: u64 = 20_000;
pub const SHUTDOWN_GRACE_MS: u64 = 2_000;
pub const MIN_SCORE: u8 = 40;
pub const NEARBY_RADIUS_M: f64 = 500.0;

/// Constants for the set store
pub const DB_URL: &str = "sqlite:./data/setlist.db";
pub const WATCH_INTERVAL_MS: u64 = 1_000;

/// Where configuration values come from; the process environment in
/// production, a map in tests
pub type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Wrapper over lookup to return a missing variable error
fn env_check(lookup: Lookup, s: &str) -> Result<String, SetListError> {
    match lookup(s) {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(SetListError::Config(format!("{s} was not set"))),
    }
}

fn env_or<T: std::str::FromStr>(lookup: Lookup, s: &str, default: T) -> T {
    match lookup(s) {
        Some(v) => v.trim().parse::<T>().unwrap_or(default),
        None => default
    }
}

/// Ensures that url is https
fn ensure_https(url: &Url) -> Result<(), String> {
    if url.scheme() == "https" {
        Ok(())
    } else {
        Err(format!("URL must be https: {url}"))
    }
}

/// Identity of the person running this client, injected everywhere
/// a write is attributed to someone
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub user_id: UserId
}

fn build_identity(lookup: Lookup) -> IdentityConfig {
    let user_id = match lookup("SETLIST_USER_ID") {
        Some(v) if !v.trim().is_empty() => UserId(v.trim().to_string()),
        _ => UserId::generate()
    };
    IdentityConfig { user_id }
}

///
/// Configuration for the ACRCloud identify endpoint
///
#[derive(Debug, Clone)]
pub struct AcrCloudConfig {
    pub host: String,
    pub access_key: String,
    pub access_secret: String,
    pub base_url: Url,              // https://{host}/
    pub data_type: String,          // always "audio" for us
    pub signature_version: String   // "1"
}

fn build_acrcloud(lookup: Lookup) -> Result<Option<AcrCloudConfig>, SetListError> {
    // credentials are only needed by commands that identify audio
    if lookup("ACR_ACCESS_KEY").is_none_or(|v| v.trim().is_empty()) {
        return Ok(None);
    }

    let access_key    = env_check(lookup, "ACR_ACCESS_KEY")?;
    let access_secret = env_check(lookup, "ACR_ACCESS_SECRET")?;
    let host          = env_check(lookup, "ACR_HOST")?;

    let base_url = lookup("ACR_BASE_URL")
        .unwrap_or_else(|| format!("https://{host}/"));

    let mut base_url = Url::parse(&base_url)
        .map_err(|e| SetListError::Config(
            format!("ACR_BASE_URL invalid {e}")
        ))?;

    ensure_https(&base_url).map_err(SetListError::Config)?;

    // ensure trailing slash
    if !base_url.path().ends_with('/') {
        let mut path = base_url.path().to_string();
        path.push('/');
        base_url.set_path(&path);
    }

    Ok(Some( AcrCloudConfig {
        host,
        access_key,
        access_secret,
        base_url,
        data_type: "audio".to_string(),
        signature_version: "1".to_string()
    }))
}

///
/// Configuration for Http timeouts, retries, etc.
///
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u8,
    pub base_backoff: time::Duration,
    pub jitter: bool,
    pub retryable_statuses: Vec<u16>
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS,
            base_backoff: time::Duration::from_millis(RETRY_BASE_BACKOFF),
            jitter: RETRY_JITTER,
            retryable_statuses: RETRYABLE_STATUSES.to_vec()
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Option<time::Duration>,  // None keeps the transport default
    pub connect_timeout: time::Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: time::Duration,
    pub max_redirects: u8,
    pub retry: RetryConfig
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            connect_timeout: time::Duration::from_millis(HTTP_CONNECT_TIMEOUT),
            pool_max_idle_per_host: HTTP_POOL_MAX_IDLE,
            pool_idle_timeout: time::Duration::from_millis(HTTP_POOL_IDLE_TIMEOUT),
            max_redirects: HTTP_MAX_REDIRECTS,
            retry: RetryConfig::default()
        }
    }
}

///
/// Configuration for the sqlite document store
///
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub db_url: String,
    pub watch_interval: time::Duration  // re-read of subscribed sets
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_url: DB_URL.to_string(),
            watch_interval: time::Duration::from_millis(WATCH_INTERVAL_MS)
        }
    }
}

fn build_persistence(lookup: Lookup) -> PersistenceConfig {
    let db_url = match lookup("SETLIST_DB_URL") {
        Some(url) if !url.trim().is_empty() => url,
        _ => DB_URL.to_string()
    };
    let watch_ms = env_or(lookup, "SETLIST_WATCH_MS", WATCH_INTERVAL_MS);
    PersistenceConfig { db_url, watch_interval: time::Duration::from_millis(watch_ms) }
}

///
/// Configuration for the capture device and the record/idle cycle
///

// Values the recognition service recommends for ambient capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_rate: u32
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self { sample_rate: 44_100, channels: 2, bit_rate: 256_000 }
    }
}

#[derive(Debug, Clone)]
pub struct RecordingConfig {
    pub record_window: time::Duration,
    pub idle_window: time::Duration,
    pub shutdown_grace: time::Duration,  // time given to in-flight identifications
    pub min_score: u8,
    pub capture: CaptureConfig
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            record_window: time::Duration::from_millis(RECORD_WINDOW_MS),
            idle_window: time::Duration::from_millis(IDLE_WINDOW_MS),
            shutdown_grace: time::Duration::from_millis(SHUTDOWN_GRACE_MS),
            min_score: MIN_SCORE,
            capture: CaptureConfig::default()
        }
    }
}

fn build_recording(lookup: Lookup) -> RecordingConfig {
    let record_ms = env_or(lookup, "RECORD_WINDOW_MS", RECORD_WINDOW_MS);
    let idle_ms   = env_or(lookup, "IDLE_WINDOW_MS", IDLE_WINDOW_MS);
    let min_score = env_or(lookup, "MIN_SCORE", MIN_SCORE).min(100);

    RecordingConfig {
        record_window: time::Duration::from_millis(record_ms),
        idle_window: time::Duration::from_millis(idle_ms),
        min_score,
        ..RecordingConfig::default()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProximityConfig {
    pub radius_m: f64
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self { radius_m: NEARBY_RADIUS_M }
    }
}

///
/// Configuration for Logger
///

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub filter_directives: String,
    pub format: LogFormat,
    pub with_ansi: bool,
    pub include_file_line: bool,
    pub include_target: bool
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter_directives: "info,setlist=debug,reqwest=warn,sqlx=warn".to_string(),
            format: LogFormat::Json,
            with_ansi: true,
            include_file_line: true,
            include_target: true
        }
    }
}

fn build_logging(lookup: Lookup) -> LoggingConfig {
    let format = match lookup("LOG_FORMAT").as_deref() {
        Some("pretty") => LogFormat::Pretty,
        _ => LogFormat::Json
    };
    LoggingConfig { format, ..LoggingConfig::default() }
}

///
/// AppConfig which holds everything the recorder, store and clients need
///
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub identity: IdentityConfig,
    pub acrcloud: Option<AcrCloudConfig>,
    pub http: HttpConfig,
    pub persistence: PersistenceConfig,
    pub recording: RecordingConfig,
    pub proximity: ProximityConfig,
    pub logging: LoggingConfig
}

impl AppConfig {
    pub fn require_acrcloud(&self) -> Result<&AcrCloudConfig, SetListError> {
        self.acrcloud.as_ref().ok_or_else(|| SetListError::Config(
            "ACR_ACCESS_KEY was not set".to_string()
        ))
    }
}

pub fn build_config(lookup: Lookup) -> Result<AppConfig, SetListError> {
    let identity    = build_identity(lookup);
    let acrcloud    = build_acrcloud(lookup)?;
    let http        = HttpConfig::default();
    let persistence = build_persistence(lookup);
    let recording   = build_recording(lookup);
    let proximity   = ProximityConfig {
        radius_m: env_or(lookup, "NEARBY_RADIUS_M", NEARBY_RADIUS_M)
    };
    let logging     = build_logging(lookup);

    Ok( AppConfig {
        identity, acrcloud, http, persistence, recording, proximity, logging
    } )
}

///
/// Return all environment variables to caller at program start.
///
pub fn load_config() -> Result<AppConfig, SetListError> {
    dotenvy::dotenv().ok();
    build_config(&env_lookup)
}
