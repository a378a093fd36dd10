//!
//! src/errors.rs  Andrew Belles  Oct 17th, 2026
//!
//! Defines enums and methods of error conversion
//! for errors the recorder, store and clients use
//!
//!

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SetListError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("network failure: {0}")]
    Network(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("data invariant violated: {0}")]
    DataInvariant(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("db error: {0}")]
    Db(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error)
}

impl SetListError {
    /// Only losing the capture device ends a recording run, everything
    /// else is absorbed per chunk
    pub fn is_fatal(&self) -> bool {
        matches!(self, SetListError::DeviceUnavailable(_))
    }
}

impl From<reqwest::Error> for SetListError {
    fn from(e: reqwest::Error) -> Self { SetListError::Network(e.to_string()) }
}

impl From<serde_json::Error> for SetListError {
    fn from(e: serde_json::Error) -> Self { SetListError::Parse(e.to_string()) }
}

impl From<sqlx::Error> for SetListError {
    fn from(e: sqlx::Error) -> Self { SetListError::Db(e.to_string()) }
}
