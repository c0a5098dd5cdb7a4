use anyhow::Result;

use facewatch::{
    now_s, CameraStatus, Classification, FeatureVector, IdentityCategory, NewDetection,
    SqliteStore, Store,
};

fn detection(camera_id: i64, identity_id: Option<i64>, name: &str, ts: i64) -> NewDetection {
    NewDetection {
        camera_id,
        classification: match identity_id {
            Some(_) => Classification::Known,
            None => Classification::Unknown,
        },
        identity_id,
        display_name: Some(name.to_string()),
        timestamp: ts,
    }
}

#[test]
fn data_survives_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("facewatch.db");
    let path = path.to_string_lossy().to_string();

    let (alice, camera) = {
        let mut store = SqliteStore::open(&path)?;
        let alice = store.add_identity("Alice", IdentityCategory::Trusted)?;
        store.set_identity_features(alice, &FeatureVector::new(vec![0.25, 0.5, 1.0])?)?;
        let camera = store.add_camera("Front door", "rtsp://10.0.0.5/stream")?;
        store.set_camera_status(camera, CameraStatus::Active)?;
        store.log_detection(&detection(camera, Some(alice), "Alice", now_s()))?;
        (alice, camera)
    };

    let store = SqliteStore::open(&path)?;
    let known = store.identities_with_features()?;
    assert_eq!(known.len(), 1);
    assert_eq!(known[0].id, alice);
    assert_eq!(
        known[0].features.as_ref().map(|f| f.as_slice().to_vec()),
        Some(vec![0.25, 0.5, 1.0])
    );
    let cam = store.camera_by_id(camera)?.expect("camera");
    assert_eq!(cam.status, CameraStatus::Active);
    assert_eq!(cam.source_uri, "rtsp://10.0.0.5/stream");
    assert_eq!(store.detection_history(0, Some(camera))?.len(), 1);
    Ok(())
}

#[test]
fn deletes_cascade_and_unlink() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("facewatch.db");
    let mut store = SqliteStore::open(&path.to_string_lossy())?;

    let bob = store.add_identity("Bob", IdentityCategory::Flagged)?;
    let lobby = store.add_camera("Lobby", "stub://lobby")?;
    let dock = store.add_camera("Dock", "stub://dock")?;
    let now = now_s();
    store.log_detection(&detection(lobby, Some(bob), "Bob", now))?;
    store.log_detection(&detection(dock, Some(bob), "Bob", now))?;
    store.log_detection(&detection(dock, None, "Unknown", now))?;

    store.delete_identity(bob)?;
    let history = store.detection_history(0, None)?;
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|ev| ev.identity_id.is_none()));
    assert!(history
        .iter()
        .any(|ev| ev.display_name.as_deref() == Some("Bob")));

    store.delete_camera(dock)?;
    let history = store.detection_history(0, None)?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].camera_id, lobby);
    assert!(store.camera_by_id(dock)?.is_none());
    Ok(())
}

#[test]
fn prune_and_window_queries() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("facewatch.db");
    let mut store = SqliteStore::open(&path.to_string_lossy())?;

    let camera = store.add_camera("Lobby", "stub://lobby")?;
    let now = now_s();
    store.log_detection(&detection(camera, None, "Unknown", now - 10 * 86_400))?;
    store.log_detection(&detection(camera, None, "Unknown", now - 60))?;
    store.log_detection(&detection(camera, None, "Unknown", now))?;

    let recent = store.detection_history(now - 86_400, None)?;
    assert_eq!(recent.len(), 2);
    assert!(recent[0].timestamp >= recent[1].timestamp);

    let stats = store.detection_stats(now - 86_400)?;
    assert_eq!(stats.total, 2);
    assert_eq!(stats.unknown, 2);

    assert_eq!(store.prune_detections(now - 86_400)?, 1);
    assert_eq!(store.prune_detections(now - 86_400)?, 0);
    assert_eq!(store.detection_history(0, None)?.len(), 2);
    Ok(())
}

#[test]
fn unique_names_and_sources() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("facewatch.db");
    let mut store = SqliteStore::open(&path.to_string_lossy())?;

    store.add_identity("Alice", IdentityCategory::Trusted)?;
    assert!(store.add_identity("Alice", IdentityCategory::Flagged).is_err());
    store.add_camera("Lobby", "stub://lobby")?;
    assert!(store.add_camera("Lobby 2", "stub://lobby").is_err());
    assert!(store.add_camera("  ", "stub://other").is_err());
    Ok(())
}

#[test]
fn gallery_version_sees_other_connections() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("facewatch.db");
    let path = path.to_string_lossy().to_string();
    let daemon = SqliteStore::open(&path)?;
    let mut admin = SqliteStore::open(&path)?;

    let before = daemon.gallery_version()?;
    assert_eq!(daemon.gallery_version()?, before);

    let carol = admin.add_identity("Carol", IdentityCategory::Trusted)?;
    let after_add = daemon.gallery_version()?;
    assert_ne!(after_add, before);

    admin.set_identity_features(carol, &FeatureVector::new(vec![0.5, 0.5])?)?;
    assert_ne!(daemon.gallery_version()?, after_add);
    assert_eq!(daemon.identities_with_features()?.len(), 1);
    Ok(())
}
