use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{anyhow, Result};

use facewatch::{CaptureError, CaptureManager, CaptureSettings, SessionStatus, UriSourceFactory};

fn manager() -> CaptureManager {
    CaptureManager::new(
        Arc::new(UriSourceFactory::new()),
        CaptureSettings {
            retry_backoff: Duration::from_millis(2),
            ..CaptureSettings::default()
        },
    )
}

fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn cameras_run_independently() -> Result<()> {
    let capture = manager();
    capture.add_session(1, "stub://steady?fps=100")?;
    capture.add_session(2, "stub://flaky?fps=100&fail_after=2")?;
    capture.start(1)?;
    capture.start(2)?;

    assert!(wait_for(Duration::from_secs(5), || {
        capture.get_status(2).ok() == Some(SessionStatus::Failed)
    }));
    assert!(capture.get_frame(2)?.is_none());
    let flaky = capture.describe(2)?;
    assert_eq!(flaky.frames_captured, 2);
    assert_eq!(flaky.error_count, 5);

    assert_eq!(capture.get_status(1)?, SessionStatus::Active);
    assert!(wait_for(Duration::from_secs(5), || {
        capture.get_frame(1).ok().flatten().is_some()
    }));
    let before = capture.get_frame(1)?.ok_or_else(|| anyhow!("no frame"))?;
    assert!(wait_for(Duration::from_secs(5), || {
        capture
            .get_frame(1)
            .ok()
            .flatten()
            .map_or(false, |f| f.sequence > before.sequence)
    }));

    capture.stop_all();
    assert_eq!(capture.get_status(1)?, SessionStatus::Inactive);
    assert_eq!(capture.get_status(2)?, SessionStatus::Inactive);
    Ok(())
}

#[test]
fn restart_never_serves_previous_frames() -> Result<()> {
    let capture = manager();
    capture.add_session(7, "stub://porch?fps=200")?;
    capture.start(7)?;
    assert!(wait_for(Duration::from_secs(5), || {
        capture.get_frame(7).ok().flatten().is_some()
    }));

    capture.stop(7)?;
    assert!(capture.get_frame(7)?.is_none());

    let restarted = SystemTime::now();
    capture.start(7)?;
    assert!(wait_for(Duration::from_secs(5), || {
        capture.get_frame(7).ok().flatten().is_some()
    }));
    let frame = capture.get_frame(7)?.ok_or_else(|| anyhow!("no frame"))?;
    assert!(frame.captured_at >= restarted);
    capture.stop(7)?;
    Ok(())
}

#[test]
fn offline_camera_reports_open_error() -> Result<()> {
    let capture = manager();
    capture.add_session(3, "stub://gate?offline=1")?;
    match capture.start(3) {
        Err(CaptureError::OpenError { camera_id, .. }) => assert_eq!(camera_id, 3),
        other => return Err(anyhow!("expected OpenError, got {:?}", other)),
    }
    assert_eq!(capture.get_status(3)?, SessionStatus::Inactive);

    capture.update_session(3, Some("stub://gate"), Some("Gate"))?;
    capture.start(3)?;
    assert_eq!(capture.get_status(3)?, SessionStatus::Active);
    assert_eq!(capture.describe(3)?.name.as_deref(), Some("Gate"));
    capture.remove_session(3)?;
    assert!(matches!(capture.get_status(3), Err(CaptureError::NotFound(3))));
    Ok(())
}
