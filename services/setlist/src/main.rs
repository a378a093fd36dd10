//!
//! src/main.rs  Andrew Belles  Oct 17th, 2026
//!
//! Command line front end for the recorder and the set store
//!
//!

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use setlist::capture::{AudioClip, ClipDirSource};
use setlist::config::{self, AppConfig};
use setlist::errors::SetListError;
use setlist::fetch::{AcrCloudClient, Recognizer};
use setlist::logging;
use setlist::persistent::{Persistent, SetEvent, SetList, SetSubscription, Track};
use setlist::platform::{locate, FixedLocator, StaticPermissions};
use setlist::proximity::find_nearby;
use setlist::session::{RecordingSession, SessionDeps, SetTarget};
use setlist::types::{Coordinates, SetId, TrackId, Vote};

#[derive(Parser, Debug)]
#[command(name = "setlist")]
#[command(about = "Record a live set and build its track list")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record until Ctrl-C, replaying clips from a directory as the microphone
    Record {
        #[arg(long, env = "SETLIST_CLIP_DIR")]
        clips: PathBuf,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        venue: Option<String>,
        /// Share the set with listeners nearby
        #[arg(long, requires_all = ["lat", "lon"], conflicts_with = "join")]
        global: bool,
        #[arg(long, allow_hyphen_values = true)]
        lat: Option<f64>,
        #[arg(long, allow_hyphen_values = true)]
        lon: Option<f64>,
        /// Contribute to an existing global set
        #[arg(long)]
        join: Option<String>,
        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        seconds: Option<u64>
    },
    /// Identify a single audio file
    Identify { file: PathBuf },
    /// Active global sets around a position
    Nearby {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
        #[arg(long)]
        radius: Option<f64>
    },
    /// List sets, newest first
    Sets {
        /// Only sets created by this user
        #[arg(long)]
        mine: bool
    },
    Tracks { set_id: String },
    Delete { set_id: String },
    Vote {
        set_id: String,
        track_id: String,
        #[arg(value_enum)]
        vote: VoteArg
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum VoteArg {
    Like,
    Dislike,
    Clear
}

impl VoteArg {
    fn as_vote(self) -> Option<Vote> {
        match self {
            VoteArg::Like => Some(Vote::Like),
            VoteArg::Dislike => Some(Vote::Dislike),
            VoteArg::Clear => None
        }
    }
}

/// sqlite creates the file but not its directory
fn ensure_db_dir(db_url: &str) -> Result<(), SetListError> {
    let path = db_url.trim_start_matches("sqlite:").trim_start_matches("//");
    if path.starts_with(':') || path.is_empty() {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

async fn open_store(cfg: &AppConfig) -> Result<Arc<Persistent>, SetListError> {
    ensure_db_dir(&cfg.persistence.db_url)?;
    let store = Persistent::init(&cfg.persistence.db_url).await?
        .with_watch_interval(cfg.persistence.watch_interval);
    Ok(Arc::new(store))
}

fn recognizer(cfg: &AppConfig) -> Result<AcrCloudClient, SetListError> {
    AcrCloudClient::new(&cfg.http, cfg.require_acrcloud()?)
}

fn print_set(set: &SetList) {
    let kind = if set.is_global() {
        if set.is_active() { "global" } else { "global/closed" }
    } else {
        "personal"
    };
    println!(
        "{}  {:<14} {:>3} tracks  {}  {}",
        set.id, kind, set.track_count,
        set.created_at.format("%Y-%m-%d %H:%M"), set.name
    );
}

fn print_track(track: &Track) {
    println!(
        "{}  {:>3}  {} - {}  (+{} / -{})",
        track.id, track.confidence_score, track.primary_artist(), track.title,
        track.like_count, track.dislike_count
    );
}

/// Next change on a watched set; never resolves for unwatched ones
async fn next_event(sub: Option<&mut SetSubscription>) -> Option<SetEvent> {
    match sub {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await
    }
}

fn print_event(event: &SetEvent) {
    match event {
        SetEvent::Updated(set) => println!(
            "set {}: {} tracks, {} contributors{}",
            set.id, set.track_count, set.contributor_count().unwrap_or(1),
            if set.is_active() { "" } else { ", closed" }
        ),
        SetEvent::TrackAdded(id) => println!("track added {id}"),
        SetEvent::TrackUpgraded { track_id, score } => {
            println!("track {track_id} upgraded to {score}");
        }
        SetEvent::Deleted => println!("set deleted")
    }
}

async fn record(
    cfg: &AppConfig,
    clips: PathBuf,
    target: SetTarget,
    seconds: Option<u64>
) -> Result<(), SetListError> {
    let store = open_store(cfg).await?;
    let deps = SessionDeps {
        store: store.clone(),
        permissions: Arc::new(StaticPermissions::granted()),
        source: Arc::new(ClipDirSource::open(&clips)?),
        recognizer: Arc::new(recognizer(cfg)?)
    };

    let mut session = RecordingSession::start(
        deps, &cfg.recording, cfg.identity.user_id.clone(), target
    ).await?;
    println!("recording into {} ({})", session.set_id(), session.set().name);

    let limit = async {
        match seconds {
            Some(s) => tokio::time::sleep(Duration::from_secs(s)).await,
            None => std::future::pending::<()>().await
        }
    };
    tokio::pin!(limit);
    let closed = session.closed();
    tokio::pin!(closed);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            r = &mut ctrl_c => {
                if let Err(e) = r {
                    warn!(error = ?e, "ctrl_c handler failed");
                }
                warn!(msg = "stopping recorder", "record.signal");
                break;
            }
            () = &mut closed => {
                warn!("record.loop.ended");
                break;
            }
            () = &mut limit => {
                info!("record.time_limit");
                break;
            }
            Some(event) = next_event(session.subscription()) => print_event(&event)
        }
    }

    let stopped = session.stop().await;
    if let Some(summary) = session.summary() {
        println!(
            "captured {} chunks, {} capture failures, {} identification failures",
            summary.chunks_captured, summary.chunks_failed, summary.identifications_failed
        );
    }
    for track in store.list_tracks(session.set_id()).await? {
        print_track(&track);
    }
    stopped?;
    Ok(())
}

async fn identify(cfg: &AppConfig, file: &Path) -> Result<(), SetListError> {
    let client = recognizer(cfg)?;
    let clip = AudioClip {
        bytes: tokio::fs::read(file).await?,
        file_name: file.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("sample")
            .to_string(),
        mime: "application/octet-stream".to_string(),
        captured_at: Utc::now()
    };

    let recognition = client.identify(&clip).await?;
    match recognition.primary() {
        Ok(Some(c)) => println!("{} - {}  (score {})", c.primary_artist(), c.title, c.score),
        Ok(None) => println!("no match: {}", recognition.status.msg),
        Err(e) => println!("unusable match: {e}")
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), SetListError> {
    let cli  = Cli::parse();
    let cfgs = config::load_config()?;
    let _guard = logging::init_logging(&cfgs.logging)?;

    tracing::info!(
        service = "setlist",
        version = %env!("CARGO_PKG_VERSION"),
        user = %cfgs.identity.user_id,
        "starting"
    );

    match cli.command {
        Command::Record { clips, name, venue, global, lat, lon, join, seconds } => {
            let target = match (join, global, lat.zip(lon)) {
                (Some(id), _, _) => SetTarget::Join(SetId(id)),
                (None, true, Some((lat, lon))) => {
                    let perms = StaticPermissions::granted();
                    let coordinates = locate(
                        &perms, &FixedLocator(Coordinates::new(lat, lon)?)
                    ).await?;
                    SetTarget::Global { name, venue, coordinates }
                }
                _ => SetTarget::Personal { name, venue }
            };
            record(&cfgs, clips, target, seconds).await?;
        }
        Command::Identify { file } => identify(&cfgs, &file).await?,
        Command::Nearby { lat, lon, radius } => {
            let store = open_store(&cfgs).await?;
            let radius = radius.unwrap_or(cfgs.proximity.radius_m);
            for nearby in find_nearby(&store, lat, lon, radius).await? {
                println!(
                    "{:>6.0} m  {}  {} contributors  {}",
                    nearby.distance_m, nearby.set.id,
                    nearby.set.contributor_count().unwrap_or(1), nearby.set.name
                );
            }
        }
        Command::Sets { mine } => {
            let store = open_store(&cfgs).await?;
            let sets = if mine {
                store.list_sets_by_owner(&cfgs.identity.user_id).await?
            } else {
                store.list_all_sets().await?
            };
            sets.iter().for_each(print_set);
        }
        Command::Tracks { set_id } => {
            let store = open_store(&cfgs).await?;
            let set = store.get_set(&SetId(set_id)).await?;
            print_set(&set);
            for track in store.list_tracks(&set.id).await? {
                print_track(&track);
            }
        }
        Command::Delete { set_id } => {
            let store = open_store(&cfgs).await?;
            store.delete_set(&SetId(set_id.clone())).await?;
            println!("deleted {set_id}");
        }
        Command::Vote { set_id, track_id, vote } => {
            let store = open_store(&cfgs).await?;
            let track = store.vote(
                &SetId(set_id), &TrackId(track_id), &cfgs.identity.user_id, vote.as_vote()
            ).await?;
            print_track(&track);
        }
    }

    Ok(())
}
