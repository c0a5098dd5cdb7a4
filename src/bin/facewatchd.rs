//! facewatchd - multi-camera face watch daemon
//!
//! This daemon:
//! 1. Opens the identity/camera/detection store
//! 2. Starts a capture session and a pipeline task for each camera
//! 3. Logs Unknown/Suspicious alerts as they arrive
//! 4. Prunes detection history past the retention window
//! 5. Reloads the gallery when identity data changes in the database

use anyhow::{anyhow, Result};
use clap::Parser;
use crossbeam_channel::{select, tick};
use std::sync::Arc;
use std::time::Duration;

use facewatch::config::FacewatchConfig;
use facewatch::{
    now_s, shared, unix_seconds, CameraId, CaptureManager, ExtractorRegistry, MatchingEngine,
    Monitor, SqliteStore, Store, UriSourceFactory,
};

const PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 10);
const HEALTH_INTERVAL: Duration = Duration::from_secs(30);
const GALLERY_CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Monitor only these camera ids (repeatable). Defaults to every registered camera.
    #[arg(long = "camera", value_name = "ID")]
    cameras: Vec<CameraId>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let cfg = FacewatchConfig::load()?;

    let store = SqliteStore::open(&cfg.db_path)?;
    let camera_ids = if args.cameras.is_empty() {
        store.list_cameras()?.into_iter().map(|c| c.id).collect()
    } else {
        args.cameras.clone()
    };
    let store = shared(store);

    let registry = ExtractorRegistry::with_builtin(cfg.zernike_settings())?;
    let extractor = registry.select(&cfg.matching.extractor)?;
    let engine = Arc::new(MatchingEngine::new(extractor, cfg.matching.threshold)?);
    let capture = Arc::new(CaptureManager::new(
        Arc::new(UriSourceFactory::new()),
        cfg.capture.clone(),
    ));
    let (monitor, alerts) = Monitor::new(
        Arc::clone(&capture),
        engine,
        Arc::clone(&store),
        cfg.monitor_settings(),
    );

    log::info!("facewatchd running. writing to {}", cfg.db_path);
    log::info!(
        "extractor={} threshold={} cooldown={:?}",
        cfg.matching.extractor,
        cfg.matching.threshold,
        cfg.pipeline.cooldown
    );

    let gallery_size = monitor.reload_gallery()?;
    log::info!("gallery loaded: {} identities with features", gallery_size);

    for camera_id in &camera_ids {
        if let Err(e) = monitor.start_monitoring(*camera_id) {
            log::error!("camera {}: failed to start monitoring: {:#}", camera_id, e);
        }
    }
    if monitor.monitored_cameras().is_empty() {
        log::warn!("no cameras are being monitored; register one with facewatch-admin");
    }

    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    prune_history(&store, &cfg);
    let prune_tick = tick(PRUNE_INTERVAL);
    let health_tick = tick(HEALTH_INTERVAL);
    let gallery_tick = tick(GALLERY_CHECK_INTERVAL);
    loop {
        select! {
            recv(alerts) -> alert => {
                let Ok(alert) = alert else { break };
                log::info!(
                    "alert: camera={} {} {} at {}",
                    alert.camera_id,
                    alert.classification.as_str(),
                    alert.display_name,
                    unix_seconds(alert.timestamp)
                );
            }
            recv(prune_tick) -> _ => prune_history(&store, &cfg),
            // Picks up identities enrolled or edited by facewatch-admin.
            recv(gallery_tick) -> _ => {
                if let Err(e) = monitor.refresh_gallery() {
                    log::warn!("gallery refresh failed: {:#}", e);
                }
            }
            recv(health_tick) -> _ => {
                for camera_id in capture.session_ids() {
                    if let Ok(info) = capture.describe(camera_id) {
                        log::info!(
                            "camera {} status={} frames={} errors={}",
                            camera_id,
                            info.status.as_str(),
                            info.frames_captured,
                            info.error_count
                        );
                    }
                }
            }
            recv(shutdown_rx) -> _ => break,
        }
    }

    log::info!("shutdown signal received, stopping cameras...");
    monitor.shutdown();
    Ok(())
}

fn prune_history(store: &facewatch::SharedStore, cfg: &FacewatchConfig) {
    let cutoff = cfg.retention_cutoff(now_s());
    let result = store
        .lock()
        .map_err(|_| anyhow!("store lock poisoned"))
        .and_then(|mut store| store.prune_detections(cutoff));
    match result {
        Ok(0) => {}
        Ok(pruned) => log::info!("retention: pruned {} detections", pruned),
        Err(e) => log::warn!("retention prune failed: {:#}", e),
    }
}
