//!
//! src/merge.rs  Andrew Belles  Oct 17th, 2026
//!
//! Folds recognition results into the in-session match buffer and
//! pushes every new or improved match through to the store
//!

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::errors::SetListError;
use crate::fetch::{Candidate, Recognition};
use crate::persistent::{MatchWrite, Persistent};
use crate::types::{SetId, TrackId, UserId};

/// Case-insensitive identity of a song within one set
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchKey {
    pub title: String,
    pub artist: String
}

impl MatchKey {
    pub fn of(title: &str, artist: &str) -> Self {
        Self {
            title: title.trim().to_lowercase(),
            artist: artist.trim().to_lowercase()
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferedMatch {
    pub local_id: u64,
    pub key: MatchKey,
    pub candidate: Candidate,
    pub recognized_at: DateTime<Utc>,
    pub track_id: Option<TrackId>
}

/// Matches recognized this session, in first-seen order
#[derive(Debug, Default)]
pub struct MatchBuffer {
    entries: Vec<BufferedMatch>,
    next_id: u64
}

impl MatchBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[BufferedMatch] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, local_id: u64) -> Option<&BufferedMatch> {
        self.entries.iter().find(|e| e.local_id == local_id)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Attach the store's id to a buffered entry. Entries cleared in the
    /// meantime are ignored.
    pub fn attach(&mut self, local_id: u64, track_id: TrackId) -> bool {
        match self.entries.iter_mut().find(|e| e.local_id == local_id) {
            Some(entry) => {
                entry.track_id = Some(track_id);
                true
            }
            None => false
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    NoMatch,
    Invalid(String),
    BelowThreshold { score: u8 },
    Added { local_id: u64 },
    Upgraded { local_id: u64, from: u8, to: u8 },
    Unchanged { local_id: u64 }
}

impl MergeOutcome {
    /// Buffer entry that changed and must be written through
    pub fn changed(&self) -> Option<u64> {
        match self {
            MergeOutcome::Added { local_id } | MergeOutcome::Upgraded { local_id, .. } => {
                Some(*local_id)
            }
            _ => None
        }
    }
}

///
/// Pure merge step. Content keyed, so any arrival order of the same
/// results ends with the same entries holding their maximum scores.
///
pub fn merge(buffer: &mut MatchBuffer, recognition: &Recognition, min_score: u8) -> MergeOutcome {
    let candidate = match recognition.primary() {
        Ok(Some(c)) => c,
        Ok(None) => return MergeOutcome::NoMatch,
        Err(e) => return MergeOutcome::Invalid(e.to_string())
    };

    if candidate.score < min_score {
        return MergeOutcome::BelowThreshold { score: candidate.score };
    }

    let key = MatchKey::of(&candidate.title, candidate.primary_artist());
    if let Some(entry) = buffer.entries.iter_mut().find(|e| e.key == key) {
        if candidate.score > entry.candidate.score {
            let from = entry.candidate.score;
            let to = candidate.score;
            entry.candidate = candidate;
            entry.recognized_at = recognition.recognized_at;
            return MergeOutcome::Upgraded { local_id: entry.local_id, from, to };
        }
        return MergeOutcome::Unchanged { local_id: entry.local_id };
    }

    let local_id = buffer.next_id;
    buffer.next_id += 1;
    buffer.entries.push(BufferedMatch {
        local_id,
        key,
        candidate,
        recognized_at: recognition.recognized_at,
        track_id: None
    });
    MergeOutcome::Added { local_id }
}

type PersistResult = (u64, Result<(TrackId, MatchWrite), SetListError>);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub persisted: usize,
    pub failed: usize
}

///
/// Buffer plus the write-through to one set. Shared between the
/// identification tasks of a recording run.
///
pub struct MergePipeline {
    buffer: Mutex<MatchBuffer>,
    store: Arc<Persistent>,
    set_id: SetId,
    user: UserId,
    min_score: u8,
    tasks: Mutex<JoinSet<PersistResult>>
}

impl MergePipeline {
    pub fn new(store: Arc<Persistent>, set_id: SetId, user: UserId, min_score: u8) -> Self {
        Self {
            buffer: Mutex::new(MatchBuffer::new()),
            store,
            set_id,
            user,
            min_score,
            tasks: Mutex::new(JoinSet::new())
        }
    }

    pub fn set_id(&self) -> &SetId {
        &self.set_id
    }

    /// Merge one result and, if it changed the buffer, persist it in the background
    pub async fn ingest(&self, recognition: &Recognition) -> MergeOutcome {
        let (outcome, candidate, recognized_at) = {
            let mut buffer = self.buffer.lock().await;
            let outcome = merge(&mut buffer, recognition, self.min_score);
            let changed = outcome.changed()
                .and_then(|id| buffer.get(id))
                .map(|e| (e.candidate.clone(), e.recognized_at));
            match changed {
                Some((c, at)) => (outcome, Some(c), at),
                None => (outcome, None, recognition.recognized_at)
            }
        };

        match &outcome {
            MergeOutcome::Invalid(reason) => {
                warn!(set = %self.set_id, reason = %reason, "merge.invalid");
            }
            MergeOutcome::BelowThreshold { score } => {
                debug!(set = %self.set_id, score, min = self.min_score, "merge.below_threshold");
            }
            MergeOutcome::Upgraded { from, to, .. } => {
                info!(set = %self.set_id, from, to, "merge.upgrade");
            }
            _ => {}
        }

        if let (Some(local_id), Some(candidate)) = (outcome.changed(), candidate) {
            let store = self.store.clone();
            let set_id = self.set_id.clone();
            let user = self.user.clone();
            info!(set = %set_id, title = %candidate.title, score = candidate.score, "merge.persist");
            self.tasks.lock().await.spawn(async move {
                let res = store.record_match(&set_id, &user, &candidate, recognized_at).await;
                (local_id, res)
            });
        }

        self.reconcile().await;
        outcome
    }

    async fn settle(&self, joined: Result<PersistResult, tokio::task::JoinError>, report: &mut FlushReport) {
        match joined {
            Ok((local_id, Ok((track_id, write)))) => {
                debug!(local_id, track = %track_id, ?write, "merge.persisted");
                self.buffer.lock().await.attach(local_id, track_id);
                report.persisted += 1;
            }
            Ok((local_id, Err(e))) => {
                warn!(local_id, error = ?e, set = %self.set_id, "merge.persist failed");
                report.failed += 1;
            }
            Err(e) => {
                warn!(error = ?e, set = %self.set_id, "merge.persist task aborted");
                report.failed += 1;
            }
        }
    }

    /// Collect persistence tasks that already finished, without waiting
    pub async fn reconcile(&self) -> FlushReport {
        let mut report = FlushReport::default();
        loop {
            let joined = {
                let mut tasks = self.tasks.lock().await;
                match tasks.try_join_next() {
                    Some(joined) => joined,
                    None => break
                }
            };
            self.settle(joined, &mut report).await;
        }
        report
    }

    /// Wait for every outstanding persistence task
    pub async fn flush(&self) -> FlushReport {
        let mut report = FlushReport::default();
        loop {
            let joined = {
                let mut tasks = self.tasks.lock().await;
                match tasks.join_next().await {
                    Some(joined) => joined,
                    None => break
                }
            };
            self.settle(joined, &mut report).await;
        }
        if report.persisted + report.failed > 0 {
            info!(set = %self.set_id, persisted = report.persisted, failed = report.failed, "merge.flush");
        }
        report
    }

    pub async fn snapshot(&self) -> Vec<BufferedMatch> {
        self.buffer.lock().await.entries().to_vec()
    }

    pub async fn clear(&self) {
        self.buffer.lock().await.clear();
    }
}
