//!
//! src/persistent.rs  Andrew Belles  Oct 17th, 2026
//!
//! Document store for sets and their tracks. Personal and global sets
//! are two logical collections of one sqlite table, each set owning an
//! ordered track sub-collection. Every counter moves in the same
//! transaction as the child write that caused it.
//!

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions, sqlite::SqliteRow, Pool, Row, Sqlite};
use tokio::{sync::broadcast, time::MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::SetListError;
use crate::fetch::Candidate;
use crate::merge::MatchKey;
use crate::types::{Coordinates, SetId, TrackId, UserId, Vote};

pub const DEFAULT_DESCRIPTION: &str = "Live music identification session";
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(1);
const FEED_CAPACITY: usize = 64;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub enum SetScope {
    Personal,
    Global {
        coordinates: Option<Coordinates>,
        is_active: bool,
        contributor_count: i64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetList {
    pub id: SetId,
    pub name: String,
    pub venue: Option<String>,
    pub description: Option<String>,
    pub owner_id: UserId,
    pub track_count: i64,
    pub scope: SetScope,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>
}

impl SetList {
    pub fn is_global(&self) -> bool {
        matches!(self.scope, SetScope::Global { .. })
    }

    pub fn coordinates(&self) -> Option<Coordinates> {
        match self.scope {
            SetScope::Global { coordinates, .. } => coordinates,
            SetScope::Personal => None
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.scope, SetScope::Global { is_active: true, .. })
    }

    pub fn contributor_count(&self) -> Option<i64> {
        match self.scope {
            SetScope::Global { contributor_count, .. } => Some(contributor_count),
            SetScope::Personal => None
        }
    }
}

#[derive(Debug, Clone)]
pub struct Track {
    pub id: TrackId,
    pub set_id: SetId,
    pub title: String,
    pub artist_names: Vec<String>,
    pub album: Option<String>,
    pub release_date: Option<String>,
    pub confidence_score: u8,
    pub recognized_at: DateTime<Utc>,
    pub like_count: i64,
    pub dislike_count: i64,
    pub voters: BTreeMap<UserId, Vote>,
    pub raw_payload: serde_json::Value,
    pub contributed_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>
}

impl Track {
    pub fn primary_artist(&self) -> &str {
        self.artist_names
            .first()
            .map(String::as_str)
            .unwrap_or("unknown")
    }
}

/// What record_match did with a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchWrite {
    Inserted,
    Upgraded,
    Kept
}

/// Change notifications for one set document
#[derive(Debug, Clone)]
pub enum SetEvent {
    Updated(SetList),
    TrackAdded(TrackId),
    TrackUpgraded { track_id: TrackId, score: u8 },
    Deleted
}

/// Parts of a set row another process can move
type Fingerprint = (i64, i64, Option<i64>, bool);

fn fingerprint(set: &SetList) -> Fingerprint {
    (set.updated_at.timestamp_millis(), set.track_count, set.contributor_count(), set.is_active())
}

#[derive(Debug)]
struct Feed {
    tx: broadcast::Sender<SetEvent>,
    seen: Fingerprint,
    generation: u64,
    deleted: bool
}

#[derive(Debug, Default)]
struct Feeds {
    feeds: Mutex<HashMap<SetId, Feed>>,
    generations: AtomicU64
}

impl Feeds {
    fn lock(&self) -> MutexGuard<'_, HashMap<SetId, Feed>> {
        self.feeds.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Returns the generation to watch when this opened a new feed
    fn subscribe(&self, set: &SetList) -> (broadcast::Receiver<SetEvent>, Option<u64>) {
        let mut feeds = self.lock();
        if let Some(feed) = feeds.get(&set.id) {
            return (feed.tx.subscribe(), None);
        }
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = broadcast::channel(FEED_CAPACITY);
        feeds.insert(set.id.clone(), Feed {
            tx, seen: fingerprint(set), generation, deleted: false
        });
        (rx, Some(generation))
    }

    fn is_watched(&self, set_id: &SetId) -> bool {
        self.lock().get(set_id).is_some_and(|f| f.tx.receiver_count() > 0)
    }

    fn is_current(&self, set_id: &SetId, generation: u64) -> bool {
        self.lock().get(set_id)
            .is_some_and(|f| f.generation == generation && f.tx.receiver_count() > 0)
    }

    fn send(&self, set_id: &SetId, event: SetEvent) {
        if let Some(feed) = self.lock().get(set_id) {
            let _ = feed.tx.send(event);
        }
    }

    /// Sends Updated only when the row moved since the last one seen
    fn observe(&self, set: SetList) {
        let mut feeds = self.lock();
        let Some(feed) = feeds.get_mut(&set.id) else {
            return;
        };
        let next = fingerprint(&set);
        if feed.seen != next {
            feed.seen = next;
            let _ = feed.tx.send(SetEvent::Updated(set));
        }
    }

    fn deleted(&self, set_id: &SetId) {
        if let Some(feed) = self.lock().get_mut(set_id) {
            if !feed.deleted {
                feed.deleted = true;
                let _ = feed.tx.send(SetEvent::Deleted);
            }
        }
    }

    fn prune(&self, set_id: &SetId) {
        let mut feeds = self.lock();
        if feeds.get(set_id).is_some_and(|f| f.tx.receiver_count() == 0) {
            feeds.remove(set_id);
        }
    }

    fn watchers(&self, set_id: &SetId) -> usize {
        self.lock().get(set_id).map_or(0, |f| f.tx.receiver_count())
    }
}

///
/// Polls one set row so writes from other processes sharing the database
/// reach local subscribers. Ends when the feed is released or replaced.
///
async fn watch_set(
    pool: Pool<Sqlite>,
    feeds: Arc<Feeds>,
    set_id: SetId,
    generation: u64,
    every: Duration
) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick.tick().await;

    loop {
        tick.tick().await;
        if !feeds.is_current(&set_id, generation) {
            break;
        }
        match fetch_set(&pool, &set_id).await {
            Ok(Some(set)) => feeds.observe(set),
            Ok(None) => {
                feeds.deleted(&set_id);
                break;
            }
            Err(e) => warn!(error = ?e, set = %set_id, "set.watch failed")
        }
    }
    debug!(set = %set_id, generation, "set.watch.end");
}

///
/// Live view of one set. Must be released when its consumer goes away;
/// dropping it releases as well.
///
pub struct SetSubscription {
    set_id: SetId,
    rx: Option<broadcast::Receiver<SetEvent>>,
    feeds: Arc<Feeds>
}

impl SetSubscription {
    pub fn set_id(&self) -> &SetId {
        &self.set_id
    }

    /// Next event for the set, None once released or the store is gone
    pub async fn recv(&mut self) -> Option<SetEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(set = %self.set_id, skipped, "subscription.lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None
            }
        }
    }

    pub fn release(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if self.rx.take().is_some() {
            self.feeds.prune(&self.set_id);
            debug!(set = %self.set_id, "subscription.release");
        }
    }
}

impl Drop for SetSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

fn now() -> i64 {
    Utc::now().timestamp_millis()
}

fn to_time(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

fn set_from_row(r: &SqliteRow) -> SetList {
    let scope = if r.get::<i64, _>("is_global") == 1 {
        let latitude: Option<f64> = r.get("latitude");
        let longitude: Option<f64> = r.get("longitude");
        SetScope::Global {
            coordinates: latitude.zip(longitude)
                .map(|(latitude, longitude)| Coordinates { latitude, longitude }),
            is_active: r.get::<Option<i64>, _>("is_active") == Some(1),
            contributor_count: r.get::<Option<i64>, _>("contributor_count").unwrap_or(1)
        }
    } else {
        SetScope::Personal
    };

    SetList {
        id: SetId(r.get("id")),
        name: r.get("name"),
        venue: r.get("venue"),
        description: r.get("description"),
        owner_id: UserId(r.get("owner_id")),
        track_count: r.get("track_count"),
        scope,
        created_at: to_time(r.get("created_at")),
        updated_at: to_time(r.get("updated_at"))
    }
}

fn track_from_row(r: &SqliteRow) -> Track {
    let artist_names = r.try_get::<String, _>("artist_names").ok()
        .and_then(|s| serde_json::from_str::<Vec<String>>(&s).ok())
        .unwrap_or_default();
    let raw_payload = r.try_get::<String, _>("raw_payload").ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(serde_json::Value::Null);

    Track {
        id: TrackId(r.get("id")),
        set_id: SetId(r.get("set_id")),
        title: r.get("title"),
        artist_names,
        album: r.get("album"),
        release_date: r.get("release_date"),
        confidence_score: r.get::<i64, _>("score").clamp(0, 100) as u8,
        recognized_at: to_time(r.get("recognized_at")),
        like_count: r.get("like_count"),
        dislike_count: r.get("dislike_count"),
        voters: BTreeMap::new(),
        raw_payload,
        contributed_by: UserId(r.get("contributed_by")),
        created_at: to_time(r.get("created_at")),
        updated_at: to_time(r.get("updated_at"))
    }
}

/// Counter deltas (likes, dislikes) for moving a voter from one vote to another
pub fn vote_delta(prior: Option<Vote>, next: Option<Vote>) -> (i64, i64) {
    let weight = |v: Option<Vote>| match v {
        Some(Vote::Like) => (1, 0),
        Some(Vote::Dislike) => (0, 1),
        None => (0, 0)
    };
    let (pl, pd) = weight(prior);
    let (nl, nd) = weight(next);
    (nl - pl, nd - pd)
}

const SET_COLUMNS: &str = "id, is_global, name, venue, description, owner_id, latitude, \
    longitude, is_active, contributor_count, track_count, created_at, updated_at";

const TRACK_COLUMNS: &str = "id, set_id, title, artist_names, album, release_date, score, \
    recognized_at, like_count, dislike_count, raw_payload, contributed_by, created_at, updated_at";

async fn fetch_set(pool: &Pool<Sqlite>, set_id: &SetId) ->
    Result<Option<SetList>, SetListError> {
    let row = sqlx::query(&format!("SELECT {SET_COLUMNS} FROM sets WHERE id = ?1;"))
        .bind(set_id.as_str())
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(set_from_row))
}

pub struct Persistent {
    pool: Pool<Sqlite>,
    feeds: Arc<Feeds>,
    watch_every: Duration
}

impl Persistent {

    async fn ensure_schema(pool: &Pool<Sqlite>) -> Result<(), SetListError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS sets (
              id                TEXT PRIMARY KEY,
              is_global         INTEGER NOT NULL CHECK (is_global IN (0, 1)),
              name              TEXT NOT NULL,
              venue             TEXT,
              description       TEXT,
              owner_id          TEXT NOT NULL,
              latitude          REAL,
              longitude         REAL,
              is_active         INTEGER,
              contributor_count INTEGER,
              track_count       INTEGER NOT NULL DEFAULT 0,
              created_at        INTEGER NOT NULL,
              updated_at        INTEGER NOT NULL
            );
            "
        ).execute(pool).await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS tracks (
              id              TEXT PRIMARY KEY,
              set_id          TEXT NOT NULL,
              title           TEXT NOT NULL,
              title_key       TEXT NOT NULL,
              artist_names    TEXT NOT NULL,
              artist_key      TEXT NOT NULL,
              album           TEXT,
              release_date    TEXT,
              score           INTEGER NOT NULL,
              recognized_at   INTEGER NOT NULL,
              like_count      INTEGER NOT NULL DEFAULT 0,
              dislike_count   INTEGER NOT NULL DEFAULT 0,
              raw_payload     TEXT NOT NULL,
              contributed_by  TEXT NOT NULL,
              created_at      INTEGER NOT NULL,
              updated_at      INTEGER NOT NULL,
              UNIQUE (set_id, title_key, artist_key),
              FOREIGN KEY(set_id) REFERENCES sets(id) ON DELETE CASCADE
            );
            "
        ).execute(pool).await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS track_votes (
              track_id    TEXT NOT NULL,
              user_id     TEXT NOT NULL,
              vote        TEXT NOT NULL CHECK (vote IN ('like','dislike')),
              updated_at  INTEGER NOT NULL,
              PRIMARY KEY (track_id, user_id),
              FOREIGN KEY(track_id) REFERENCES tracks(id) ON DELETE CASCADE
            );
            "
        ).execute(pool).await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sets_owner ON sets(owner_id);")
            .execute(pool).await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sets_active ON sets(is_global, is_active);"
        ).execute(pool).await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tracks_set ON tracks(set_id, created_at);"
        ).execute(pool).await?;

        Ok(())
    }

    pub async fn init(database_url: &str) -> Result<Self, SetListError> {
        let is_memory = database_url == "sqlite::memory:";

        let mut opts = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        // WAL is file-only; don't set it for in-memory
        if !is_memory {
            opts = opts.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                       .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        }

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(if is_memory {1} else {8})
            .connect_with(opts)
            .await?;

        // Always create schema right away
        Self::ensure_schema(&pool).await?;

        Ok(Self {
            pool,
            feeds: Arc::new(Feeds::default()),
            watch_every: DEFAULT_WATCH_INTERVAL
        })
    }

    /// How often subscribed sets are re-read for writes made elsewhere
    pub fn with_watch_interval(mut self, every: Duration) -> Self {
        self.watch_every = every.max(Duration::from_millis(10));
        self
    }

    ///
    /// Set lifecycle
    ///

    async fn insert_set(
        &self,
        owner: &UserId,
        name: &str,
        venue: Option<&str>,
        coordinates: Option<Coordinates>,
        is_global: bool
    ) -> Result<SetId, SetListError> {
        let id = Uuid::new_v4().to_string();
        let now = now();
        sqlx::query(
            r"
            INSERT INTO sets (
                id, is_global, name, venue, description, owner_id, latitude,
                longitude, is_active, contributor_count, track_count,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?11);
            "
        )
        .bind(&id)
        .bind(i64::from(is_global))
        .bind(name)
        .bind(venue)
        .bind(DEFAULT_DESCRIPTION)
        .bind(owner.as_str())
        .bind(coordinates.map(|c| c.latitude))
        .bind(coordinates.map(|c| c.longitude))
        .bind(is_global.then_some(1_i64))
        .bind(is_global.then_some(1_i64))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(SetId(id))
    }

    pub async fn create_personal(&self, owner: &UserId, name: &str, venue: Option<&str>) ->
        Result<SetId, SetListError> {
        let id = self.insert_set(owner, name, venue, None, false).await?;
        info!(set = %id, owner = %owner, "set.create.personal");
        Ok(id)
    }

    pub async fn create_global(
        &self,
        owner: &UserId,
        name: &str,
        venue: Option<&str>,
        coordinates: Coordinates
    ) -> Result<SetId, SetListError> {
        let id = self.insert_set(owner, name, venue, Some(coordinates), true).await?;
        info!(
            set = %id, owner = %owner,
            lat = coordinates.latitude, lon = coordinates.longitude,
            "set.create.global"
        );
        Ok(id)
    }

    pub async fn find_set(&self, set_id: &SetId) -> Result<Option<SetList>, SetListError> {
        fetch_set(&self.pool, set_id).await
    }

    pub async fn get_set(&self, set_id: &SetId) -> Result<SetList, SetListError> {
        self.find_set(set_id).await?
            .ok_or_else(|| SetListError::NotFound(format!("set {set_id}")))
    }

    pub async fn list_sets_by_owner(&self, owner: &UserId) ->
        Result<Vec<SetList>, SetListError> {
        let rows = sqlx::query(&format!(
            "SELECT {SET_COLUMNS} FROM sets WHERE owner_id = ?1 \
             ORDER BY created_at DESC, rowid DESC;"
        ))
        .bind(owner.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(set_from_row).collect())
    }

    /// Both collections, newest first
    pub async fn list_all_sets(&self) -> Result<Vec<SetList>, SetListError> {
        let rows = sqlx::query(&format!(
            "SELECT {SET_COLUMNS} FROM sets ORDER BY created_at DESC, rowid DESC;"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(set_from_row).collect())
    }

    pub async fn active_global_sets(&self) -> Result<Vec<SetList>, SetListError> {
        let rows = sqlx::query(&format!(
            "SELECT {SET_COLUMNS} FROM sets WHERE is_global = 1 AND is_active = 1;"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(set_from_row).collect())
    }

    /// Atomically counts one more contributor on a global set
    pub async fn join(&self, set_id: &SetId) -> Result<(), SetListError> {
        let updated = sqlx::query(
            r"
            UPDATE sets
               SET contributor_count = COALESCE(contributor_count, 1) + 1,
                   updated_at = ?1
             WHERE id = ?2 AND is_global = 1;
            "
        )
        .bind(now())
        .bind(set_id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(SetListError::NotFound(format!("global set {set_id}")));
        }
        info!(set = %set_id, "set.join");
        self.publish_set(set_id).await;
        Ok(())
    }

    pub async fn deactivate(&self, set_id: &SetId) -> Result<(), SetListError> {
        let updated = sqlx::query(
            "UPDATE sets SET is_active = 0, updated_at = ?1 WHERE id = ?2 AND is_global = 1;"
        )
        .bind(now())
        .bind(set_id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(SetListError::NotFound(format!("global set {set_id}")));
        }
        info!(set = %set_id, "set.deactivate");
        self.publish_set(set_id).await;
        Ok(())
    }

    /// Removes the set, its tracks and their votes in one transaction
    pub async fn delete_set(&self, set_id: &SetId) -> Result<(), SetListError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM track_votes WHERE track_id IN (SELECT id FROM tracks WHERE set_id = ?1);"
        )
        .bind(set_id.as_str())
        .execute(&mut *tx)
        .await?;

        let tracks = sqlx::query("DELETE FROM tracks WHERE set_id = ?1;")
            .bind(set_id.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let removed = sqlx::query("DELETE FROM sets WHERE id = ?1;")
            .bind(set_id.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if removed == 0 {
            tx.rollback().await?;
            return Err(SetListError::NotFound(format!("set {set_id}")));
        }

        tx.commit().await?;
        info!(set = %set_id, tracks, "set.delete");
        self.feeds.deleted(set_id);
        Ok(())
    }

    ///
    /// Tracks
    ///

    /// Conditional write of one recognized track. Inserts when the
    /// (title, primary artist) key is new to the set, otherwise replaces the
    /// stored score and payload only if the candidate's score is strictly
    /// higher. One upsert statement, so concurrent contributors cannot lose
    /// a higher score.
    pub async fn record_match(
        &self,
        set_id: &SetId,
        contributor: &UserId,
        candidate: &Candidate,
        recognized_at: DateTime<Utc>
    ) -> Result<(TrackId, MatchWrite), SetListError> {
        let key = MatchKey::of(&candidate.title, candidate.primary_artist());
        let payload = serde_json::to_string(&candidate.payload)?;
        let artists = serde_json::to_string(&candidate.artist_names)?;
        let now = now();

        let fresh_id = Uuid::new_v4().to_string();
        let mut tx = self.pool.begin().await?;

        // the upsert is the first statement so the transaction starts as a
        // writer and waits on busy_timeout instead of failing an upgrade
        let written: Option<String> = sqlx::query_scalar(
            r"
            INSERT INTO tracks (
                id, set_id, title, title_key, artist_names, artist_key, album,
                release_date, score, recognized_at, like_count, dislike_count,
                raw_payload, contributed_by, created_at, updated_at
            )
            SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, 0, ?11, ?12, ?13, ?13
             WHERE EXISTS (SELECT 1 FROM sets WHERE id = ?2)
            ON CONFLICT(set_id, title_key, artist_key) DO UPDATE SET
                score = excluded.score,
                raw_payload = excluded.raw_payload,
                album = COALESCE(excluded.album, tracks.album),
                release_date = COALESCE(excluded.release_date, tracks.release_date),
                recognized_at = excluded.recognized_at,
                updated_at = excluded.updated_at
             WHERE excluded.score > tracks.score
            RETURNING id;
            "
        )
        .bind(&fresh_id)
        .bind(set_id.as_str())
        .bind(&candidate.title)
        .bind(&key.title)
        .bind(&artists)
        .bind(&key.artist)
        .bind(candidate.album.as_deref())
        .bind(candidate.release_date.as_deref())
        .bind(i64::from(candidate.score))
        .bind(recognized_at.timestamp_millis())
        .bind(&payload)
        .bind(contributor.as_str())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let (track_id, write) = match written {
            Some(id) if id == fresh_id => {
                sqlx::query(
                    "UPDATE sets SET track_count = track_count + 1, updated_at = ?1 WHERE id = ?2;"
                )
                .bind(now)
                .bind(set_id.as_str())
                .execute(&mut *tx)
                .await?;
                (id, MatchWrite::Inserted)
            }
            Some(id) => {
                sqlx::query("UPDATE sets SET updated_at = ?1 WHERE id = ?2;")
                    .bind(now)
                    .bind(set_id.as_str())
                    .execute(&mut *tx)
                    .await?;
                (id, MatchWrite::Upgraded)
            }
            None => {
                // either the stored score is at least as high or the set is gone
                let kept: Option<String> = sqlx::query_scalar(
                    "SELECT id FROM tracks WHERE set_id = ?1 AND title_key = ?2 AND artist_key = ?3;"
                )
                .bind(set_id.as_str())
                .bind(&key.title)
                .bind(&key.artist)
                .fetch_optional(&mut *tx)
                .await?;
                match kept {
                    Some(id) => (id, MatchWrite::Kept),
                    None => {
                        tx.rollback().await?;
                        return Err(SetListError::NotFound(format!("set {set_id}")));
                    }
                }
            }
        };

        tx.commit().await?;

        let track_id = TrackId(track_id);
        debug!(
            set = %set_id, track = %track_id, title = %candidate.title,
            score = candidate.score, write = ?write, "track.record"
        );

        match write {
            MatchWrite::Inserted => {
                self.feeds.send(set_id, SetEvent::TrackAdded(track_id.clone()));
                self.publish_set(set_id).await;
            }
            MatchWrite::Upgraded => {
                self.feeds.send(set_id, SetEvent::TrackUpgraded {
                    track_id: track_id.clone(),
                    score: candidate.score
                });
            }
            MatchWrite::Kept => {}
        }
        Ok((track_id, write))
    }

    async fn voters_for_set(&self, set_id: &SetId) ->
        Result<HashMap<String, BTreeMap<UserId, Vote>>, SetListError> {
        let rows = sqlx::query(
            r"
            SELECT v.track_id, v.user_id, v.vote
              FROM track_votes v
              JOIN tracks t ON t.id = v.track_id
             WHERE t.set_id = ?1;
            "
        )
        .bind(set_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut voters: HashMap<String, BTreeMap<UserId, Vote>> = HashMap::new();
        for r in rows {
            let Some(vote) = Vote::parse(&r.get::<String, _>("vote")) else {
                continue;
            };
            voters.entry(r.get("track_id"))
                .or_default()
                .insert(UserId(r.get("user_id")), vote);
        }
        Ok(voters)
    }

    /// Tracks of a set in insertion order
    pub async fn list_tracks(&self, set_id: &SetId) -> Result<Vec<Track>, SetListError> {
        let rows = sqlx::query(&format!(
            "SELECT {TRACK_COLUMNS} FROM tracks WHERE set_id = ?1 \
             ORDER BY created_at ASC, rowid ASC;"
        ))
        .bind(set_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut voters = self.voters_for_set(set_id).await?;
        Ok(rows.iter()
            .map(|r| {
                let mut track = track_from_row(r);
                track.voters = voters.remove(track.id.as_str()).unwrap_or_default();
                track
            })
            .collect())
    }

    pub async fn get_track(&self, set_id: &SetId, track_id: &TrackId) ->
        Result<Track, SetListError> {
        let row = sqlx::query(&format!(
            "SELECT {TRACK_COLUMNS} FROM tracks WHERE set_id = ?1 AND id = ?2;"
        ))
        .bind(set_id.as_str())
        .bind(track_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SetListError::NotFound(format!("track {track_id} in set {set_id}")))?;

        let mut track = track_from_row(&row);
        let votes = sqlx::query("SELECT user_id, vote FROM track_votes WHERE track_id = ?1;")
            .bind(track_id.as_str())
            .fetch_all(&self.pool)
            .await?;
        track.voters = votes.iter()
            .filter_map(|r| Vote::parse(&r.get::<String, _>("vote"))
                .map(|v| (UserId(r.get("user_id")), v)))
            .collect();
        Ok(track)
    }

    /// Moves a user's vote on a track to `next`, adjusting the counters by
    /// atomic deltas in the same transaction as the voter map
    pub async fn vote(
        &self,
        set_id: &SetId,
        track_id: &TrackId,
        user: &UserId,
        next: Option<Vote>
    ) -> Result<Track, SetListError> {
        let now = now();
        let mut tx = self.pool.begin().await?;

        // touch the track first so the transaction holds the write lock
        // before it reads the prior vote
        let touched = sqlx::query("UPDATE tracks SET updated_at = ?1 WHERE id = ?2 AND set_id = ?3;")
            .bind(now)
            .bind(track_id.as_str())
            .bind(set_id.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if touched == 0 {
            tx.rollback().await?;
            return Err(SetListError::NotFound(format!("track {track_id} in set {set_id}")));
        }

        let prior: Option<String> = sqlx::query_scalar(
            "SELECT vote FROM track_votes WHERE track_id = ?1 AND user_id = ?2;"
        )
        .bind(track_id.as_str())
        .bind(user.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        let prior = prior.as_deref().and_then(Vote::parse);

        let (likes, dislikes) = vote_delta(prior, next);

        sqlx::query(
            r"
            UPDATE tracks
               SET like_count = MAX(0, like_count + ?1),
                   dislike_count = MAX(0, dislike_count + ?2),
                   updated_at = ?3
             WHERE id = ?4;
            "
        )
        .bind(likes)
        .bind(dislikes)
        .bind(now)
        .bind(track_id.as_str())
        .execute(&mut *tx)
        .await?;

        match next {
            Some(vote) => {
                sqlx::query(
                    r"
                    INSERT INTO track_votes (track_id, user_id, vote, updated_at)
                    VALUES (?1, ?2, ?3, ?4)
                    ON CONFLICT(track_id, user_id) DO UPDATE SET
                        vote = excluded.vote, updated_at = excluded.updated_at;
                    "
                )
                .bind(track_id.as_str())
                .bind(user.as_str())
                .bind(vote.as_str())
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM track_votes WHERE track_id = ?1 AND user_id = ?2;")
                    .bind(track_id.as_str())
                    .bind(user.as_str())
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        debug!(track = %track_id, user = %user, ?prior, ?next, "track.vote");
        self.get_track(set_id, track_id).await
    }

    ///
    /// Live subscriptions
    ///

    pub async fn subscribe(&self, set_id: &SetId) -> Result<SetSubscription, SetListError> {
        // refuse to watch a document that does not exist
        let set = self.get_set(set_id).await?;
        let (rx, opened) = self.feeds.subscribe(&set);
        if let Some(generation) = opened {
            tokio::spawn(watch_set(
                self.pool.clone(), self.feeds.clone(), set_id.clone(), generation, self.watch_every
            ));
        }
        debug!(set = %set_id, "subscription.open");
        Ok( SetSubscription {
            set_id: set_id.clone(),
            rx: Some(rx),
            feeds: self.feeds.clone()
        })
    }

    /// Number of open subscriptions on a set
    pub fn watchers(&self, set_id: &SetId) -> usize {
        self.feeds.watchers(set_id)
    }

    async fn publish_set(&self, set_id: &SetId) {
        if !self.feeds.is_watched(set_id) {
            return;
        }
        match self.find_set(set_id).await {
            Ok(Some(set)) => self.feeds.observe(set),
            Ok(None) => self.feeds.deleted(set_id),
            Err(e) => warn!(error = ?e, set = %set_id, "publish_set failed")
        }
    }
}
