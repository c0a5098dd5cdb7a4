//! Per-camera monitoring: capture session + match → classify → log task.
//!
//! `start_monitoring` registers and starts the capture session, reloads the
//! gallery and spawns one pipeline thread for the camera. The thread polls the
//! capture manager for the latest frame and processes each new frame fully
//! before looking at the next one. Each thread owns its `DetectionPipeline`,
//! so the camera's dedup history lives and dies with the task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::capture::{CaptureError, CaptureManager, SessionStatus};
use crate::frame::Frame;
use crate::gallery::MatchingEngine;
use crate::pipeline::{Alert, DetectionPipeline, DEFAULT_COOLDOWN};
use crate::storage::{CameraStatus, SharedStore};
use crate::{lock, CameraId};

#[derive(Clone, Debug)]
pub struct MonitorSettings {
    /// Sleep between polls when no new frame is available.
    pub poll_interval: Duration,
    pub cooldown: Duration,
    /// How long `stop_monitoring` waits for the pipeline thread.
    pub stop_timeout: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            cooldown: DEFAULT_COOLDOWN,
            stop_timeout: Duration::from_secs(2),
        }
    }
}

struct PipelineTask {
    shutdown: Sender<()>,
    done: Receiver<()>,
    join: JoinHandle<()>,
}

enum TaskSlot {
    /// Reserved by a `start_monitoring` call that is still opening the source.
    Starting,
    Running(PipelineTask),
}

pub struct Monitor {
    capture: Arc<CaptureManager>,
    engine: Arc<MatchingEngine>,
    store: SharedStore,
    alerts: Sender<Alert>,
    settings: MonitorSettings,
    tasks: Mutex<HashMap<CameraId, TaskSlot>>,
    /// Store version the current gallery was loaded at.
    gallery_version: Mutex<Option<i64>>,
}

impl Monitor {
    /// Build a monitor and the receiving end of its alert stream.
    pub fn new(
        capture: Arc<CaptureManager>,
        engine: Arc<MatchingEngine>,
        store: SharedStore,
        settings: MonitorSettings,
    ) -> (Self, Receiver<Alert>) {
        let (alerts, alert_rx) = crossbeam_channel::unbounded();
        let monitor = Self {
            capture,
            engine,
            store,
            alerts,
            settings,
            tasks: Mutex::new(HashMap::new()),
            gallery_version: Mutex::new(None),
        };
        (monitor, alert_rx)
    }

    pub fn capture(&self) -> &Arc<CaptureManager> {
        &self.capture
    }

    pub fn engine(&self) -> &Arc<MatchingEngine> {
        &self.engine
    }

    /// Reload the gallery from the store. The previous gallery stays in use on
    /// error.
    pub fn reload_gallery(&self) -> Result<usize> {
        let store = lock(&self.store);
        let version = store.gallery_version().ok();
        let count = self.engine.load_gallery(&*store)?;
        *lock(&self.gallery_version) = version;
        Ok(count)
    }

    /// Reload the gallery if identity data changed since the last load.
    /// Returns whether a reload happened.
    pub fn refresh_gallery(&self) -> Result<bool> {
        let current = lock(&self.store)
            .gallery_version()
            .context("read gallery version")?;
        if *lock(&self.gallery_version) == Some(current) {
            return Ok(false);
        }
        let count = self.reload_gallery()?;
        log::info!("identity data changed; gallery reloaded with {} faces", count);
        Ok(true)
    }

    pub fn is_monitoring(&self, camera_id: CameraId) -> bool {
        matches!(lock(&self.tasks).get(&camera_id), Some(TaskSlot::Running(_)))
    }

    /// Monitored cameras, ascending.
    pub fn monitored_cameras(&self) -> Vec<CameraId> {
        let mut ids: Vec<CameraId> = lock(&self.tasks)
            .iter()
            .filter(|(_, slot)| matches!(slot, TaskSlot::Running(_)))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Start capture and the pipeline task for a registered camera. For a
    /// camera that is already monitored, a Failed capture session is started
    /// again; otherwise the call does nothing.
    pub fn start_monitoring(&self, camera_id: CameraId) -> Result<()> {
        {
            let mut tasks = lock(&self.tasks);
            let running = tasks
                .get(&camera_id)
                .map(|slot| matches!(slot, TaskSlot::Running(_)));
            match running {
                Some(true) => {
                    drop(tasks);
                    return self.restart_failed_capture(camera_id);
                }
                Some(false) => return Ok(()),
                None => {
                    tasks.insert(camera_id, TaskSlot::Starting);
                }
            }
        }

        let task = match self.launch(camera_id) {
            Ok(task) => task,
            Err(e) => {
                let mut tasks = lock(&self.tasks);
                if matches!(tasks.get(&camera_id), Some(TaskSlot::Starting)) {
                    tasks.remove(&camera_id);
                }
                return Err(e);
            }
        };

        let mut tasks = lock(&self.tasks);
        if matches!(tasks.get(&camera_id), Some(TaskSlot::Starting)) {
            tasks.insert(camera_id, TaskSlot::Running(task));
            return Ok(());
        }
        drop(tasks);
        // stop_monitoring ran while the source was opening.
        self.finish(camera_id, task)?;
        Err(anyhow!("camera {}: monitoring stopped while starting", camera_id))
    }

    fn restart_failed_capture(&self, camera_id: CameraId) -> Result<()> {
        if self.capture.get_status(camera_id)? != SessionStatus::Failed {
            return Ok(());
        }
        log::info!("camera {}: restarting failed capture", camera_id);
        self.capture.start(camera_id)?;
        Ok(())
    }

    /// Open capture and spawn the pipeline thread. Runs without the task lock.
    fn launch(&self, camera_id: CameraId) -> Result<PipelineTask> {
        let camera = lock(&self.store)
            .camera_by_id(camera_id)
            .with_context(|| format!("look up camera {}", camera_id))?
            .ok_or_else(|| anyhow!("camera {} not found", camera_id))?;

        if self.capture.contains(camera_id) {
            self.capture.update_session(
                camera_id,
                Some(camera.source_uri.as_str()),
                Some(camera.name.as_str()),
            )?;
        } else {
            self.capture.add_session(camera_id, &camera.source_uri)?;
            self.capture
                .update_session(camera_id, None, Some(camera.name.as_str()))?;
        }
        self.capture.start(camera_id)?;

        if let Err(e) = self.reload_gallery() {
            log::warn!("camera {}: monitoring with previous gallery: {:#}", camera_id, e);
        }
        self.set_status(camera_id, CameraStatus::Active);

        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let capture = Arc::clone(&self.capture);
        let engine = Arc::clone(&self.engine);
        let store = Arc::clone(&self.store);
        let pipeline = DetectionPipeline::new(
            Arc::clone(&self.store),
            self.settings.cooldown,
            Some(self.alerts.clone()),
        );
        let poll_interval = self.settings.poll_interval;

        let spawned = std::thread::Builder::new()
            .name(format!("monitor-{}", camera_id))
            .spawn(move || {
                pipeline_loop(
                    camera_id,
                    &capture,
                    &engine,
                    &store,
                    pipeline,
                    &shutdown_rx,
                    poll_interval,
                );
                let _ = done_tx.send(());
            });
        let join = match spawned {
            Ok(join) => join,
            Err(e) => {
                let _ = self.capture.stop(camera_id);
                self.set_status(camera_id, CameraStatus::Inactive);
                return Err(anyhow!("spawn pipeline thread for camera {}: {}", camera_id, e));
            }
        };

        log::info!(
            "camera {} ({}): monitoring started on {}",
            camera_id,
            camera.name,
            camera.source_uri
        );
        Ok(PipelineTask {
            shutdown: shutdown_tx,
            done: done_rx,
            join,
        })
    }

    /// Stop the pipeline task and the capture session, drop the camera's
    /// dedup history and mark the camera inactive. Idempotent.
    pub fn stop_monitoring(&self, camera_id: CameraId) -> Result<()> {
        let slot = lock(&self.tasks).remove(&camera_id);
        match slot {
            Some(TaskSlot::Running(task)) => self.finish(camera_id, task),
            // The starting call sees its slot gone and tears down.
            Some(TaskSlot::Starting) => Ok(()),
            None => match self.capture.stop(camera_id) {
                Ok(()) | Err(CaptureError::NotFound(_)) => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }

    fn finish(&self, camera_id: CameraId, task: PipelineTask) -> Result<()> {
        let _ = task.shutdown.send(());

        match self.capture.stop(camera_id) {
            Ok(()) | Err(CaptureError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        match task.done.recv_timeout(self.settings.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if task.join.join().is_err() {
                    log::error!("camera {}: pipeline thread panicked", camera_id);
                }
            }
            Err(RecvTimeoutError::Timeout) => log::warn!(
                "camera {}: pipeline thread did not stop within {:?}; detaching",
                camera_id,
                self.settings.stop_timeout
            ),
        }
        self.set_status(camera_id, CameraStatus::Inactive);
        log::info!("camera {}: monitoring stopped", camera_id);
        Ok(())
    }

    /// Stop every monitored camera and every capture session.
    pub fn shutdown(&self) {
        let camera_ids: Vec<CameraId> = lock(&self.tasks).keys().copied().collect();
        for camera_id in camera_ids {
            if let Err(e) = self.stop_monitoring(camera_id) {
                log::warn!("camera {}: stop failed during shutdown: {:#}", camera_id, e);
            }
        }
        self.capture.stop_all();
    }

    fn set_status(&self, camera_id: CameraId, status: CameraStatus) {
        record_status(&self.store, camera_id, status);
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn record_status(store: &SharedStore, camera_id: CameraId, status: CameraStatus) {
    if let Err(e) = lock(store).set_camera_status(camera_id, status) {
        log::warn!(
            "camera {}: failed to record status {}: {:#}",
            camera_id,
            status.as_str(),
            e
        );
    }
}

fn pipeline_loop(
    camera_id: CameraId,
    capture: &CaptureManager,
    engine: &MatchingEngine,
    store: &SharedStore,
    mut pipeline: DetectionPipeline,
    shutdown: &Receiver<()>,
    poll_interval: Duration,
) {
    let mut last: Option<Arc<Frame>> = None;
    let mut capture_failed = false;
    loop {
        match shutdown.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        let frame = match capture.get_frame(camera_id) {
            Ok(frame) => frame,
            Err(e) => {
                log::debug!("camera {}: no frame: {}", camera_id, e);
                None
            }
        };
        let fresh = frame.filter(|frame| {
            last.as_ref()
                .map_or(true, |previous| !Arc::ptr_eq(previous, frame))
        });

        match fresh {
            Some(frame) => {
                let results = engine.match_frame(&frame);
                if !results.is_empty() {
                    pipeline.process(camera_id, &results, SystemTime::now());
                }
                last = Some(frame);
            }
            None => {
                // Mirror capture failure and recovery into the camera record.
                match capture.get_status(camera_id) {
                    Ok(SessionStatus::Failed) if !capture_failed => {
                        capture_failed = true;
                        log::warn!("camera {}: capture failed; waiting for restart", camera_id);
                        record_status(store, camera_id, CameraStatus::Inactive);
                    }
                    Ok(SessionStatus::Active) if capture_failed => {
                        capture_failed = false;
                        record_status(store, camera_id, CameraStatus::Active);
                    }
                    _ => {}
                }
                match shutdown.recv_timeout(poll_interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }
        }
    }
    log::debug!(
        "camera {}: pipeline task exiting ({} dedup entries dropped)",
        camera_id,
        pipeline.dedup().len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crate::capture::CaptureSettings;
    use crate::extract::{FeatureVector, StubExtractor, StubFace};
    use crate::frame::FaceRegion;
    use crate::gallery::IdentityCategory;
    use crate::ingest::{FrameSource, SourceFactory, UriSourceFactory};
    use crate::pipeline::Classification;
    use crate::storage::{InMemoryStore, Store};

    struct Harness {
        monitor: Monitor,
        alerts: Receiver<Alert>,
        store: Arc<Mutex<InMemoryStore>>,
        camera: CameraId,
    }

    /// Opens sources after a delay.
    struct SlowFactory {
        delay: Duration,
        inner: UriSourceFactory,
    }

    impl SourceFactory for SlowFactory {
        fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>> {
            std::thread::sleep(self.delay);
            self.inner.open(uri)
        }
    }

    fn harness(faces: Vec<StubFace>) -> Result<Harness> {
        harness_with(faces, "stub://c1?fps=100", Arc::new(UriSourceFactory::new()))
    }

    fn harness_with(
        faces: Vec<StubFace>,
        uri: &str,
        factory: Arc<dyn SourceFactory>,
    ) -> Result<Harness> {
        let mut store = InMemoryStore::new();
        let camera = store.add_camera("C1", uri)?;
        let alice = store.add_identity("Alice", IdentityCategory::Trusted)?;
        store.set_identity_features(alice, &FeatureVector::new(vec![0.0, 0.0])?)?;
        let bob = store.add_identity("Bob", IdentityCategory::Flagged)?;
        store.set_identity_features(bob, &FeatureVector::new(vec![1.0, 1.0])?)?;
        let store = Arc::new(Mutex::new(store));

        let capture = Arc::new(CaptureManager::new(
            factory,
            CaptureSettings {
                retry_backoff: Duration::from_millis(2),
                ..CaptureSettings::default()
            },
        ));
        let engine = Arc::new(MatchingEngine::new(
            Arc::new(StubExtractor::with_faces(faces)),
            0.06,
        )?);
        let shared: SharedStore = store.clone();
        let (monitor, alerts) = Monitor::new(
            capture,
            engine,
            shared,
            MonitorSettings {
                poll_interval: Duration::from_millis(2),
                ..MonitorSettings::default()
            },
        );
        Ok(Harness {
            monitor,
            alerts,
            store,
            camera,
        })
    }

    fn bob_face() -> Result<StubFace> {
        Ok(StubFace::new(
            FaceRegion::new(10, 10, 40, 40),
            Some(FeatureVector::new(vec![1.0, 1.0])?),
        ))
    }

    fn detections(h: &Harness) -> usize {
        lock(&h.store).detections().len()
    }

    fn stored_status(h: &Harness) -> Option<CameraStatus> {
        lock(&h.store)
            .camera_by_id(h.camera)
            .ok()
            .flatten()
            .map(|c| c.status)
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
    fn unknown_camera_is_rejected() -> Result<()> {
        let h = harness(vec![])?;
        assert!(h.monitor.start_monitoring(42).is_err());
        assert!(h.monitor.monitored_cameras().is_empty());
        Ok(())
    }

    #[test]
    fn suspicious_face_is_logged_once_and_alerted() -> Result<()> {
        let h = harness(vec![bob_face()?])?;
        h.monitor.start_monitoring(h.camera)?;
        h.monitor.start_monitoring(h.camera)?;
        assert_eq!(h.monitor.monitored_cameras(), vec![h.camera]);
        assert_eq!(h.monitor.engine().gallery().len(), 2);

        let alert = h.alerts.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(alert.display_name, "Bob");
        assert_eq!(alert.classification, Classification::Suspicious);

        // Many frames go by inside the cooldown window.
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(detections(&h), 1);
        assert!(h.alerts.try_recv().is_err());
        assert_eq!(
            lock(&h.store).camera_by_id(h.camera)?.map(|c| c.status),
            Some(CameraStatus::Active)
        );
        Ok(())
    }

    #[test]
    fn stop_resets_dedup_for_the_camera() -> Result<()> {
        let h = harness(vec![bob_face()?])?;
        h.monitor.start_monitoring(h.camera)?;
        h.alerts.recv_timeout(Duration::from_secs(5))?;

        h.monitor.stop_monitoring(h.camera)?;
        h.monitor.stop_monitoring(h.camera)?;
        assert!(!h.monitor.is_monitoring(h.camera));
        assert_eq!(
            h.monitor.capture().get_status(h.camera).ok(),
            Some(SessionStatus::Inactive)
        );
        assert_eq!(
            lock(&h.store).camera_by_id(h.camera)?.map(|c| c.status),
            Some(CameraStatus::Inactive)
        );

        h.monitor.start_monitoring(h.camera)?;
        h.alerts.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(detections(&h), 2);
        h.monitor.shutdown();
        assert!(h.monitor.monitored_cameras().is_empty());
        Ok(())
    }

    #[test]
    fn start_monitoring_restarts_failed_capture() -> Result<()> {
        let h = harness_with(
            vec![],
            "stub://c1?fps=200&fail_after=3",
            Arc::new(UriSourceFactory::new()),
        )?;
        h.monitor.start_monitoring(h.camera)?;
        let capture = h.monitor.capture();
        assert!(wait_for(Duration::from_secs(5), || {
            capture.get_status(h.camera).ok() == Some(SessionStatus::Failed)
        }));
        assert!(wait_for(Duration::from_secs(5), || {
            stored_status(&h) == Some(CameraStatus::Inactive)
        }));
        assert!(h.monitor.is_monitoring(h.camera));

        h.monitor.start_monitoring(h.camera)?;
        assert!(wait_for(Duration::from_secs(5), || {
            capture
                .describe(h.camera)
                .map_or(false, |info| info.frames_captured >= 6)
        }));
        assert_eq!(h.monitor.monitored_cameras(), vec![h.camera]);
        h.monitor.stop_monitoring(h.camera)?;
        assert_eq!(stored_status(&h), Some(CameraStatus::Inactive));
        Ok(())
    }

    #[test]
    fn refresh_gallery_follows_identity_changes() -> Result<()> {
        let h = harness(vec![])?;
        h.monitor.start_monitoring(h.camera)?;
        assert_eq!(h.monitor.engine().gallery().len(), 2);
        assert!(!h.monitor.refresh_gallery()?);

        {
            let mut store = lock(&h.store);
            let carol = store.add_identity("Carol", IdentityCategory::Trusted)?;
            store.set_identity_features(carol, &FeatureVector::new(vec![5.0, 5.0])?)?;
        }
        assert!(h.monitor.refresh_gallery()?);
        assert_eq!(h.monitor.engine().gallery().len(), 3);
        assert!(!h.monitor.refresh_gallery()?);

        let bob = lock(&h.store)
            .list_identities()?
            .into_iter()
            .find(|i| i.name == "Bob")
            .map(|i| i.id)
            .ok_or_else(|| anyhow!("bob missing"))?;
        lock(&h.store).clear_identity_features(bob)?;
        assert!(h.monitor.refresh_gallery()?);
        assert!(!h.monitor.engine().gallery().contains(bob));
        Ok(())
    }

    #[test]
    fn slow_open_does_not_block_other_cameras() -> Result<()> {
        let h = harness_with(
            vec![],
            "stub://c1?fps=100",
            Arc::new(SlowFactory {
                delay: Duration::from_millis(400),
                inner: UriSourceFactory::new(),
            }),
        )?;
        let other = lock(&h.store).add_camera("C2", "stub://c2?fps=100")?;

        std::thread::scope(|scope| -> Result<()> {
            let starting = scope.spawn(|| h.monitor.start_monitoring(h.camera));
            std::thread::sleep(Duration::from_millis(100));

            let begun = Instant::now();
            assert!(!h.monitor.is_monitoring(h.camera));
            h.monitor.stop_monitoring(other)?;
            assert!(begun.elapsed() < Duration::from_millis(200));

            starting
                .join()
                .map_err(|_| anyhow!("start thread panicked"))??;
            Ok(())
        })?;
        assert!(h.monitor.is_monitoring(h.camera));
        Ok(())
    }

    #[test]
    fn stop_during_open_tears_the_camera_down() -> Result<()> {
        let h = harness_with(
            vec![],
            "stub://c1?fps=100",
            Arc::new(SlowFactory {
                delay: Duration::from_millis(300),
                inner: UriSourceFactory::new(),
            }),
        )?;

        let started = std::thread::scope(|scope| -> Result<Result<()>> {
            let starting = scope.spawn(|| h.monitor.start_monitoring(h.camera));
            std::thread::sleep(Duration::from_millis(100));
            h.monitor.stop_monitoring(h.camera)?;
            starting.join().map_err(|_| anyhow!("start thread panicked"))
        })?;
        assert!(started.is_err());
        assert!(!h.monitor.is_monitoring(h.camera));
        assert_eq!(
            h.monitor.capture().get_status(h.camera).ok(),
            Some(SessionStatus::Inactive)
        );
        assert_eq!(stored_status(&h), Some(CameraStatus::Inactive));
        Ok(())
    }
}
