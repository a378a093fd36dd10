//!
//! src/platform.rs  Andrew Belles  Oct 17th, 2026
//!
//! Host capabilities the recorder consumes but does not own:
//! permission prompts and one-shot geolocation
//!

use async_trait::async_trait;

use crate::errors::SetListError;
use crate::types::Coordinates;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
    Undetermined
}

#[async_trait]
pub trait Permissions: Send + Sync {
    async fn request_microphone(&self) -> PermissionStatus;
    async fn request_location(&self) -> PermissionStatus;
}

/// Fails with PermissionDenied unless the microphone was granted
pub async fn require_microphone(perms: &dyn Permissions) -> Result<(), SetListError> {
    match perms.request_microphone().await {
        PermissionStatus::Granted => Ok(()),
        status => Err(SetListError::PermissionDenied(
            format!("microphone permission {status:?}")
        ))
    }
}

#[async_trait]
pub trait Locator: Send + Sync {
    async fn current_position(&self) -> Result<Coordinates, SetListError>;
}

/// Resolves a position, asking for location permission first
pub async fn locate(perms: &dyn Permissions, locator: &dyn Locator) ->
    Result<Coordinates, SetListError> {
    match perms.request_location().await {
        PermissionStatus::Granted => locator.current_position().await,
        status => Err(SetListError::PermissionDenied(
            format!("location permission {status:?}")
        ))
    }
}

/// Grants decided up front, e.g. from command line flags
#[derive(Debug, Clone, Copy)]
pub struct StaticPermissions {
    pub microphone: PermissionStatus,
    pub location: PermissionStatus
}

impl StaticPermissions {
    pub fn granted() -> Self {
        Self {
            microphone: PermissionStatus::Granted,
            location: PermissionStatus::Granted
        }
    }
}

#[async_trait]
impl Permissions for StaticPermissions {
    async fn request_microphone(&self) -> PermissionStatus { self.microphone }
    async fn request_location(&self) -> PermissionStatus { self.location }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedLocator(pub Coordinates);

#[async_trait]
impl Locator for FixedLocator {
    async fn current_position(&self) -> Result<Coordinates, SetListError> {
        Ok(self.0)
    }
}
