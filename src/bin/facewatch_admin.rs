//! facewatch-admin - manage cameras, identities and detection history

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use facewatch::config::FacewatchConfig;
use facewatch::{
    now_s, CameraId, ExtractorRegistry, Frame, IdentityCategory, IdentityId, SqliteStore, Store,
};

const SECS_PER_DAY: i64 = 60 * 60 * 24;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the facewatch database. Overrides FACEWATCH_DB_PATH and the config file.
    #[arg(long)]
    db_path: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage cameras.
    #[command(subcommand)]
    Camera(CameraCommand),
    /// Manage known identities.
    #[command(subcommand)]
    Identity(IdentityCommand),
    /// Print detections from the last N days, newest first.
    History {
        #[arg(long, default_value_t = 7)]
        days: u32,
        #[arg(long)]
        camera: Option<CameraId>,
    },
    /// Print detection counts for the last N days.
    Stats {
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Delete detections older than N days.
    Prune {
        #[arg(long)]
        days: u32,
    },
}

#[derive(Subcommand, Debug)]
enum CameraCommand {
    Add {
        name: String,
        /// Source URI (rtsp://, http://, /dev/videoN, usb:N, stub://name).
        source_uri: String,
    },
    List,
    Update {
        id: CameraId,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        source_uri: Option<String>,
    },
    Remove {
        id: CameraId,
    },
}

#[derive(Subcommand, Debug)]
enum IdentityCommand {
    Add {
        name: String,
        /// trusted|flagged (whitelist|blacklist accepted).
        #[arg(long, default_value = "trusted")]
        category: String,
    },
    List,
    Category {
        id: IdentityId,
        category: String,
    },
    /// Enrol the largest face found in an image.
    Features {
        id: IdentityId,
        #[arg(long)]
        image: PathBuf,
    },
    ClearFeatures {
        id: IdentityId,
    },
    Remove {
        id: IdentityId,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let cfg = FacewatchConfig::load()?;
    let db_path = args.db_path.clone().unwrap_or_else(|| cfg.db_path.clone());
    let mut store = SqliteStore::open(&db_path)?;

    match args.command {
        Command::Camera(cmd) => camera(&mut store, cmd),
        Command::Identity(cmd) => identity(&mut store, &cfg, cmd),
        Command::History { days, camera } => {
            let events = store.detection_history(since_days(days), camera)?;
            if events.is_empty() {
                println!("no detections");
            }
            for ev in events {
                println!(
                    "{}\tcamera={}\t{}\t{}",
                    ev.timestamp,
                    ev.camera_id,
                    ev.classification.as_str(),
                    ev.display_name.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
        Command::Stats { days } => {
            let stats = store.detection_stats(since_days(days))?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Command::Prune { days } => {
            let pruned = store.prune_detections(since_days(days))?;
            println!("pruned {} detections", pruned);
            Ok(())
        }
    }
}

fn camera(store: &mut SqliteStore, cmd: CameraCommand) -> Result<()> {
    match cmd {
        CameraCommand::Add { name, source_uri } => {
            let id = store.add_camera(&name, &source_uri)?;
            println!("camera {} added", id);
        }
        CameraCommand::List => {
            for cam in store.list_cameras()? {
                println!(
                    "{}\t{}\t{}\t{}",
                    cam.id,
                    cam.name,
                    cam.status.as_str(),
                    cam.source_uri
                );
            }
        }
        CameraCommand::Update {
            id,
            name,
            source_uri,
        } => {
            if name.is_none() && source_uri.is_none() {
                return Err(anyhow!("nothing to update: pass --name and/or --source-uri"));
            }
            store.update_camera(id, name.as_deref(), source_uri.as_deref())?;
            println!("camera {} updated", id);
        }
        CameraCommand::Remove { id } => {
            store.delete_camera(id)?;
            println!("camera {} removed", id);
        }
    }
    Ok(())
}

fn identity(store: &mut SqliteStore, cfg: &FacewatchConfig, cmd: IdentityCommand) -> Result<()> {
    match cmd {
        IdentityCommand::Add { name, category } => {
            let id = store.add_identity(&name, IdentityCategory::parse(&category)?)?;
            println!("identity {} added", id);
        }
        IdentityCommand::List => {
            for ident in store.list_identities()? {
                println!(
                    "{}\t{}\t{}\tfeatures={}",
                    ident.id,
                    ident.name,
                    ident.category.as_str(),
                    ident.has_features
                );
            }
        }
        IdentityCommand::Category { id, category } => {
            store.set_identity_category(id, IdentityCategory::parse(&category)?)?;
            println!("identity {} updated", id);
        }
        IdentityCommand::Features { id, image } => {
            let rgb = image::open(&image)
                .with_context(|| format!("failed to read image {}", image.display()))?
                .to_rgb8();
            let (width, height) = rgb.dimensions();
            let frame = Frame::from_rgb(rgb.into_raw(), width, height, 0)?;

            let registry = ExtractorRegistry::with_builtin(cfg.zernike_settings())?;
            let extractor = registry.select(&cfg.matching.extractor)?;
            let features = extractor
                .extract_largest(&frame)?
                .ok_or_else(|| anyhow!("no face found in {}", image.display()))?;
            store.set_identity_features(id, &features)?;
            println!(
                "identity {} enrolled ({} {} values)",
                id,
                features.len(),
                extractor.name()
            );
        }
        IdentityCommand::ClearFeatures { id } => {
            store.clear_identity_features(id)?;
            println!("identity {} features cleared", id);
        }
        IdentityCommand::Remove { id } => {
            store.delete_identity(id)?;
            println!("identity {} removed", id);
        }
    }
    Ok(())
}

fn since_days(days: u32) -> i64 {
    now_s() - days as i64 * SECS_PER_DAY
}
