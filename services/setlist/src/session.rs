//!
//! src/session.rs  Andrew Belles  Oct 17th, 2026
//!
//! One recording session against one set: resolve or create the set,
//! drive the recorder, and tear everything down exactly once
//!

use std::sync::Arc;

use chrono::Local;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::capture::AudioSource;
use crate::config::RecordingConfig;
use crate::errors::SetListError;
use crate::fetch::Recognizer;
use crate::merge::{BufferedMatch, MergePipeline};
use crate::persistent::{Persistent, SetList, SetSubscription};
use crate::platform::{require_microphone, Permissions};
use crate::recorder::{Recorder, RecorderState, RecorderSummary};
use crate::types::{Coordinates, SetId, UserId};

#[derive(Debug, Clone)]
pub enum SetTarget {
    Personal { name: Option<String>, venue: Option<String> },
    Global { name: Option<String>, venue: Option<String>, coordinates: Coordinates },
    Join(SetId)
}

/// Everything a session borrows from the host
#[derive(Clone)]
pub struct SessionDeps {
    pub store: Arc<Persistent>,
    pub permissions: Arc<dyn Permissions>,
    pub source: Arc<dyn AudioSource>,
    pub recognizer: Arc<dyn Recognizer>
}

pub fn default_set_name() -> String {
    format!("Recording Session {}", Local::now().format("%Y-%m-%d %H:%M"))
}

pub struct RecordingSession {
    store: Arc<Persistent>,
    set: SetList,
    owns_global: bool,
    pipeline: Arc<MergePipeline>,
    subscription: Option<SetSubscription>,
    state: watch::Receiver<RecorderState>,
    shutdown: CancellationToken,
    finished: CancellationToken,
    run: Option<JoinHandle<Result<RecorderSummary, SetListError>>>,
    summary: Option<RecorderSummary>
}

impl RecordingSession {
    pub async fn start(
        deps: SessionDeps,
        cfg: &RecordingConfig,
        user: UserId,
        target: SetTarget
    ) -> Result<Self, SetListError> {
        // no set is created for a client that cannot record
        require_microphone(deps.permissions.as_ref()).await?;

        let store = deps.store.clone();
        let set_id = match target {
            SetTarget::Personal { name, venue } => {
                let name = name.unwrap_or_else(default_set_name);
                store.create_personal(&user, &name, venue.as_deref()).await?
            }
            SetTarget::Global { name, venue, coordinates } => {
                let name = name.unwrap_or_else(default_set_name);
                store.create_global(&user, &name, venue.as_deref(), coordinates).await?
            }
            SetTarget::Join(set_id) => {
                let set = store.get_set(&set_id).await?;
                if !set.is_global() {
                    return Err(SetListError::NotFound(format!("global set {set_id}")));
                }
                store.join(&set_id).await?;
                set_id
            }
        };

        let set = store.get_set(&set_id).await?;
        let owns_global = set.is_global() && set.owner_id == user;
        let subscription = if set.is_global() {
            Some(store.subscribe(&set_id).await?)
        } else {
            None
        };

        let pipeline = Arc::new(MergePipeline::new(
            store.clone(), set_id.clone(), user.clone(), cfg.min_score
        ));
        let recorder = Recorder::new(
            cfg, deps.permissions, deps.source, deps.recognizer, pipeline.clone()
        );
        let state = recorder.state();
        let shutdown = recorder.shutdown();
        let finished = CancellationToken::new();

        let done = finished.clone();
        let run = tokio::spawn(async move {
            let res = recorder.run().await;
            if let Err(e) = &res {
                error!(error = ?e, "recording loop ended");
            }
            done.cancel();
            res
        });

        info!(
            set = %set_id, user = %user, global = set.is_global(),
            owner = owns_global, "session.start"
        );

        Ok( Self {
            store,
            set,
            owns_global,
            pipeline,
            subscription,
            state,
            shutdown,
            finished,
            run: Some(run),
            summary: None
        })
    }

    pub fn set(&self) -> &SetList {
        &self.set
    }

    pub fn set_id(&self) -> &SetId {
        &self.set.id
    }

    pub fn state(&self) -> watch::Receiver<RecorderState> {
        self.state.clone()
    }

    /// Live feed of the set, present for global sets until stop
    pub fn subscription(&mut self) -> Option<&mut SetSubscription> {
        self.subscription.as_mut()
    }

    pub async fn matches(&self) -> Vec<BufferedMatch> {
        self.pipeline.snapshot().await
    }

    pub fn summary(&self) -> Option<RecorderSummary> {
        self.summary
    }

    /// Resolves once the loop has ended, whether stopped or failed. The
    /// future does not borrow the session.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + use<> {
        let finished = self.finished.clone();
        async move { finished.cancelled().await }
    }

    /// Tears the session down. Only the first call has any effect and
    /// returns true. When the loop ended on a fatal error the teardown
    /// still runs and that error is returned.
    pub async fn stop(&mut self) -> Result<bool, SetListError> {
        let Some(run) = self.run.take() else {
            return Ok(false);
        };

        self.shutdown.cancel();
        let mut fatal = None;
        match run.await {
            Ok(Ok(summary)) => self.summary = Some(summary),
            Ok(Err(e)) => {
                warn!(error = ?e, set = %self.set.id, "session.stop after failure");
                fatal = Some(e);
            }
            Err(e) => error!(error = ?e, set = %self.set.id, "recording task panicked")
        }

        let report = self.pipeline.flush().await;

        let deactivated = if self.owns_global {
            self.store.deactivate(&self.set.id).await
        } else {
            Ok(())
        };

        if let Some(sub) = self.subscription.take() {
            sub.release();
        }
        let kept = self.pipeline.snapshot().await.len();
        self.pipeline.clear().await;

        info!(
            set = %self.set.id, matches = kept, persisted = report.persisted,
            failed = report.failed, "session.stop"
        );
        if let Some(e) = fatal {
            if let Err(d) = deactivated {
                warn!(error = ?d, set = %self.set.id, "deactivate after failure");
            }
            return Err(e);
        }
        deactivated?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    use crate::capture::{AudioClip, CaptureHandle, ClipDirSource};
    use crate::config::CaptureConfig;
    use crate::fetch::{AcrStatus, Recognition};
    use crate::persistent::{SetEvent, SetScope};
    use crate::platform::{PermissionStatus, StaticPermissions};

    /// Always hears the same song
    struct OneSong {
        title: &'static str,
        score: f64
    }

    #[async_trait]
    impl Recognizer for OneSong {
        async fn identify(&self, _: &AudioClip) -> Result<Recognition, SetListError> {
            Ok( Recognition {
                status: AcrStatus { msg: "Success".into(), code: 0 },
                music: vec![json!({
                    "title": self.title,
                    "artists": [{ "name": "The Band" }],
                    "score": self.score
                })],
                recognized_at: Utc::now()
            })
        }
    }

    struct Unplugged;

    #[async_trait]
    impl AudioSource for Unplugged {
        async fn begin(&self, _: &CaptureConfig) -> Result<Box<dyn CaptureHandle>, SetListError> {
            Err(SetListError::DeviceUnavailable("no input device".into()))
        }
    }

    fn fast() -> RecordingConfig {
        RecordingConfig {
            record_window: Duration::from_millis(20),
            idle_window: Duration::from_millis(20),
            shutdown_grace: Duration::from_millis(500),
            ..RecordingConfig::default()
        }
    }

    async fn deps(dir: &tempfile::TempDir, permissions: StaticPermissions) ->
        Result<SessionDeps, SetListError> {
        std::fs::write(dir.path().join("chunk.wav"), b"RIFF....WAVE")?;
        Ok( SessionDeps {
            store: Arc::new(Persistent::init("sqlite::memory:").await?),
            permissions: Arc::new(permissions),
            source: Arc::new(ClipDirSource::open(dir.path())?),
            recognizer: Arc::new(OneSong { title: "Song A", score: 85.0 })
        })
    }

    #[tokio::test]
    async fn personal_session_records_and_stops_once() -> Result<(), SetListError> {
        let dir = tempfile::tempdir()?;
        let deps = deps(&dir, StaticPermissions::granted()).await?;
        let store = deps.store.clone();
        let user = UserId("user_a".into());

        let mut session = RecordingSession::start(
            deps, &fast(), user.clone(),
            SetTarget::Personal { name: None, venue: Some("Basement".into()) }
        ).await?;
        assert_eq!(session.set().scope, SetScope::Personal);
        assert!(session.set().name.starts_with("Recording Session "));
        assert!(session.subscription().is_none());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(session.stop().await?);
        assert!(!session.stop().await?, "second stop is a no-op");
        assert!(session.summary().is_some_and(|s| s.chunks_captured >= 1));
        assert!(session.matches().await.is_empty());

        let tracks = store.list_tracks(session.set_id()).await?;
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].confidence_score, 85);
        assert_eq!(tracks[0].contributed_by, user);
        Ok(())
    }

    #[tokio::test]
    async fn owner_stop_deactivates_global_set() -> Result<(), SetListError> {
        let dir = tempfile::tempdir()?;
        let deps = deps(&dir, StaticPermissions::granted()).await?;
        let store = deps.store.clone();
        let here = Coordinates::new(40.0, -74.0)?;

        let mut owner = RecordingSession::start(
            deps.clone(), &fast(), UserId("owner".into()),
            SetTarget::Global { name: Some("Fest".into()), venue: None, coordinates: here }
        ).await?;
        let set_id = owner.set_id().clone();
        assert_eq!(store.watchers(&set_id), 1);

        let mut guest = RecordingSession::start(
            deps, &fast(), UserId("guest".into()), SetTarget::Join(set_id.clone())
        ).await?;
        assert_eq!(store.get_set(&set_id).await?.contributor_count(), Some(2));

        let seen = tokio::time::timeout(Duration::from_secs(5), async {
            let sub = owner.subscription().expect("global sets are watched");
            loop {
                match sub.recv().await {
                    Some(SetEvent::TrackAdded(id)) => break Some(id),
                    Some(_) => continue,
                    None => break None
                }
            }
        }).await;
        assert!(matches!(seen, Ok(Some(_))));

        guest.stop().await?;
        assert!(store.get_set(&set_id).await?.is_active(), "guests never deactivate");

        owner.stop().await?;
        assert!(!store.get_set(&set_id).await?.is_active());
        assert_eq!(store.watchers(&set_id), 0);
        assert_eq!(store.list_tracks(&set_id).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn denied_microphone_creates_nothing() -> Result<(), SetListError> {
        let dir = tempfile::tempdir()?;
        let deps = deps(&dir, StaticPermissions {
            microphone: PermissionStatus::Denied,
            location: PermissionStatus::Granted
        }).await?;
        let store = deps.store.clone();

        let res = RecordingSession::start(
            deps, &fast(), UserId("user_a".into()),
            SetTarget::Personal { name: None, venue: None }
        ).await;
        assert!(matches!(res, Err(SetListError::PermissionDenied(_))));
        assert!(store.list_all_sets().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn joining_missing_set_is_not_found() -> Result<(), SetListError> {
        let dir = tempfile::tempdir()?;
        let deps = deps(&dir, StaticPermissions::granted()).await?;
        let res = RecordingSession::start(
            deps, &fast(), UserId("user_a".into()), SetTarget::Join(SetId("nope".into()))
        ).await;
        assert!(matches!(res, Err(SetListError::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn closed_resolves_when_device_is_lost() -> Result<(), SetListError> {
        let dir = tempfile::tempdir()?;
        let mut deps = deps(&dir, StaticPermissions::granted()).await?;
        deps.source = Arc::new(Unplugged);

        let mut session = RecordingSession::start(
            deps, &fast(), UserId("user_a".into()),
            SetTarget::Personal { name: Some("Broken".into()), venue: None }
        ).await?;

        tokio::time::timeout(Duration::from_secs(5), session.closed()).await
            .expect("loop ends on its own");
        assert!(matches!(*session.state().borrow(), RecorderState::Failed(_)));
        assert!(matches!(session.stop().await, Err(SetListError::DeviceUnavailable(_))));
        assert!(!session.stop().await?, "the failure is reported once");
        assert!(session.summary().is_none());
        assert!(session.matches().await.is_empty());
        Ok(())
    }
}
