//!
//! src/lib.rs  Andrew Belles  Oct 17th, 2026
//!
//! Live set recorder: chunked ambient recording, ACRCloud recognition,
//! and personal or shared set lists built from the matches
//!

pub mod config;
pub mod errors;
pub mod logging;
pub mod types;

pub mod capture;
pub mod fetch;
pub mod platform;

pub mod merge;
pub mod persistent;
pub mod proximity;

pub mod recorder;
pub mod session;

pub use errors::SetListError;
