//! Capture manager: camera session lifecycle and latest-frame handoff.
//!
//! Each session owns its record, its frame slot and at most one acquisition
//! thread. The thread is the only writer of the slot; readers get an
//! `Arc<Frame>` they can keep for as long as they like.
//!
//! Every `start` tags the session with a fresh generation number and `stop`
//! retires it. The acquisition thread only publishes frames (and only marks the
//! session Failed) while its own generation is still current, so a thread
//! that outlives a bounded `stop` can never leak a stale frame into the next
//! session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::Serialize;
use thiserror::Error;

use crate::frame::Frame;
use crate::ingest::{FrameSource, SourceFactory};
use crate::{lock, CameraId};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("camera {0} is not registered")]
    NotFound(CameraId),
    #[error("camera {0} is already registered")]
    AlreadyExists(CameraId),
    #[error("camera {camera_id}: cannot open {uri}: {reason}")]
    OpenError {
        camera_id: CameraId,
        uri: String,
        reason: String,
    },
    #[error("failed to spawn acquisition thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Inactive,
    Active,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Inactive => "inactive",
            SessionStatus::Active => "active",
            SessionStatus::Failed => "failed",
        }
    }
}

#[derive(Clone, Debug)]
pub struct CaptureSettings {
    /// Consecutive read failures before a session is marked Failed.
    pub max_consecutive_errors: u32,
    /// Pause after a failed read.
    pub retry_backoff: Duration,
    /// How long `stop` waits for the acquisition thread.
    pub stop_timeout: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 5,
            retry_backoff: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(2),
        }
    }
}

/// Snapshot of one session for callers and logs.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionInfo {
    pub camera_id: CameraId,
    pub name: Option<String>,
    pub source_uri: String,
    pub status: SessionStatus,
    pub error_count: u64,
    pub has_frame: bool,
    pub frames_captured: u64,
}

struct SessionRecord {
    name: Option<String>,
    source_uri: String,
}

/// Everything the frame lock guards.
struct SessionState {
    generation: u64,
    status: SessionStatus,
    frame: Option<Arc<Frame>>,
}

struct AcquisitionWorker {
    shutdown: Sender<()>,
    done: Receiver<()>,
    join: JoinHandle<()>,
}

struct CameraSession {
    id: CameraId,
    record: Mutex<SessionRecord>,
    state: RwLock<SessionState>,
    next_generation: AtomicU64,
    error_count: AtomicU64,
    frames_captured: AtomicU64,
    worker: Mutex<Option<AcquisitionWorker>>,
    /// Serializes start/stop/update on this session.
    control: Mutex<()>,
}

impl CameraSession {
    fn new(id: CameraId, source_uri: String) -> Self {
        Self {
            id,
            record: Mutex::new(SessionRecord {
                name: None,
                source_uri,
            }),
            state: RwLock::new(SessionState {
                generation: 0,
                status: SessionStatus::Inactive,
                frame: None,
            }),
            next_generation: AtomicU64::new(1),
            error_count: AtomicU64::new(0),
            frames_captured: AtomicU64::new(0),
            worker: Mutex::new(None),
            control: Mutex::new(()),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Retire the current generation and move to `status` with no frame.
    /// Returns the new generation.
    fn reset(&self, status: SessionStatus) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let mut state = self.write_state();
        state.generation = generation;
        state.status = status;
        state.frame = None;
        self.error_count.store(0, Ordering::SeqCst);
        generation
    }

    fn publish(&self, generation: u64, frame: Frame) -> bool {
        let frame = Arc::new(frame);
        let mut state = self.write_state();
        if state.generation != generation {
            return false;
        }
        state.frame = Some(frame);
        true
    }

    fn mark_failed(&self, generation: u64) -> bool {
        let mut state = self.write_state();
        if state.generation != generation {
            return false;
        }
        state.frame = None;
        state.status = SessionStatus::Failed;
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        self.read_state().generation == generation
    }

    fn info(&self) -> SessionInfo {
        let (name, source_uri) = {
            let record = lock(&self.record);
            (record.name.clone(), record.source_uri.clone())
        };
        let state = self.read_state();
        SessionInfo {
            camera_id: self.id,
            name,
            source_uri,
            status: state.status,
            error_count: self.error_count.load(Ordering::SeqCst),
            has_frame: state.frame.is_some(),
            frames_captured: self.frames_captured.load(Ordering::SeqCst),
        }
    }
}

pub struct CaptureManager {
    sessions: Mutex<HashMap<CameraId, Arc<CameraSession>>>,
    factory: Arc<dyn SourceFactory>,
    settings: CaptureSettings,
}

impl CaptureManager {
    pub fn new(factory: Arc<dyn SourceFactory>, settings: CaptureSettings) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            factory,
            settings,
        }
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    fn session(&self, id: CameraId) -> Result<Arc<CameraSession>, CaptureError> {
        lock(&self.sessions)
            .get(&id)
            .cloned()
            .ok_or(CaptureError::NotFound(id))
    }

    /// Register a session. Nothing is opened until `start`.
    pub fn add_session(&self, id: CameraId, source_uri: &str) -> Result<(), CaptureError> {
        let mut sessions = lock(&self.sessions);
        if sessions.contains_key(&id) {
            return Err(CaptureError::AlreadyExists(id));
        }
        sessions.insert(id, Arc::new(CameraSession::new(id, source_uri.to_string())));
        log::debug!("camera {}: session registered for {}", id, source_uri);
        Ok(())
    }

    pub fn contains(&self, id: CameraId) -> bool {
        lock(&self.sessions).contains_key(&id)
    }

    /// Open the source and spawn the acquisition thread. Starting an Active
    /// session is a no-op. On `OpenError` nothing is spawned and the session is
    /// left Inactive.
    pub fn start(&self, id: CameraId) -> Result<(), CaptureError> {
        let session = self.session(id)?;
        let _control = lock(&session.control);

        if session.read_state().status == SessionStatus::Active && lock(&session.worker).is_some()
        {
            return Ok(());
        }
        // A Failed session still holds its exited worker.
        self.join_worker(&session);

        let uri = lock(&session.record).source_uri.clone();
        let source = match self.factory.open(&uri) {
            Ok(source) => source,
            Err(e) => {
                session.reset(SessionStatus::Inactive);
                return Err(CaptureError::OpenError {
                    camera_id: id,
                    uri,
                    reason: format!("{:#}", e),
                });
            }
        };

        let generation = session.reset(SessionStatus::Active);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let worker_session = Arc::clone(&session);
        let settings = self.settings.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("capture-{}", id))
            .spawn(move || {
                acquisition_loop(
                    &worker_session,
                    source,
                    generation,
                    &shutdown_rx,
                    &settings,
                );
                let _ = done_tx.send(());
            });
        let join = match spawned {
            Ok(join) => join,
            Err(e) => {
                session.reset(SessionStatus::Inactive);
                return Err(CaptureError::Spawn(e));
            }
        };

        *lock(&session.worker) = Some(AcquisitionWorker {
            shutdown: shutdown_tx,
            done: done_rx,
            join,
        });
        log::info!("camera {}: capture started ({})", id, uri);
        Ok(())
    }

    /// Stop the acquisition thread, clear the frame and mark the session
    /// Inactive. Safe to call on a stopped or Failed session.
    pub fn stop(&self, id: CameraId) -> Result<(), CaptureError> {
        let session = self.session(id)?;
        self.stop_session(&session);
        Ok(())
    }

    fn stop_session(&self, session: &CameraSession) {
        let _control = lock(&session.control);
        let was_running = self.join_worker(session);
        session.reset(SessionStatus::Inactive);
        if was_running {
            log::info!("camera {}: capture stopped", session.id);
        }
    }

    /// Signal the worker, wait up to `stop_timeout`, then join it. A worker
    /// that does not finish in time is detached; its generation is retired by
    /// the caller so it can no longer publish. Returns whether a worker existed.
    fn join_worker(&self, session: &CameraSession) -> bool {
        let Some(worker) = lock(&session.worker).take() else {
            return false;
        };
        let _ = worker.shutdown.send(());
        match worker.done.recv_timeout(self.settings.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.join.join().is_err() {
                    log::error!("camera {}: acquisition thread panicked", session.id);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "camera {}: acquisition thread did not stop within {:?}; detaching",
                    session.id,
                    self.settings.stop_timeout
                );
            }
        }
        true
    }

    /// Stop if needed, then forget the session.
    pub fn remove_session(&self, id: CameraId) -> Result<(), CaptureError> {
        let session = lock(&self.sessions)
            .remove(&id)
            .ok_or(CaptureError::NotFound(id))?;
        self.stop_session(&session);
        log::debug!("camera {}: session removed", id);
        Ok(())
    }

    /// Update the record. An Active session whose URI changed is restarted on
    /// the new URI.
    pub fn update_session(
        &self,
        id: CameraId,
        new_uri: Option<&str>,
        new_name: Option<&str>,
    ) -> Result<(), CaptureError> {
        let session = self.session(id)?;
        let uri_changed = {
            let mut record = lock(&session.record);
            if let Some(name) = new_name {
                record.name = Some(name.to_string());
            }
            match new_uri {
                Some(uri) if uri != record.source_uri => {
                    record.source_uri = uri.to_string();
                    true
                }
                _ => false,
            }
        };
        if uri_changed && session.read_state().status == SessionStatus::Active {
            log::info!("camera {}: source changed, restarting capture", id);
            self.stop_session(&session);
            self.start(id)?;
        }
        Ok(())
    }

    /// Latest frame, or `None` before the first successful read.
    pub fn get_frame(&self, id: CameraId) -> Result<Option<Arc<Frame>>, CaptureError> {
        let session = self.session(id)?;
        let frame = session.read_state().frame.clone();
        Ok(frame)
    }

    pub fn get_status(&self, id: CameraId) -> Result<SessionStatus, CaptureError> {
        let session = self.session(id)?;
        let status = session.read_state().status;
        Ok(status)
    }

    pub fn describe(&self, id: CameraId) -> Result<SessionInfo, CaptureError> {
        Ok(self.session(id)?.info())
    }

    /// Registered ids, ascending.
    pub fn session_ids(&self) -> Vec<CameraId> {
        let mut ids: Vec<CameraId> = lock(&self.sessions).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn stop_all(&self) {
        let sessions: Vec<Arc<CameraSession>> = lock(&self.sessions).values().cloned().collect();
        for session in sessions {
            self.stop_session(&session);
        }
    }
}

impl Drop for CaptureManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn acquisition_loop(
    session: &CameraSession,
    mut source: Box<dyn FrameSource>,
    generation: u64,
    shutdown: &Receiver<()>,
    settings: &CaptureSettings,
) {
    let id = session.id;
    let mut consecutive_errors: u32 = 0;
    let mut exhausted = false;

    loop {
        match shutdown.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        match source.read_frame() {
            Ok(frame) => {
                consecutive_errors = 0;
                if session.publish(generation, frame) {
                    session.error_count.store(0, Ordering::SeqCst);
                    session.frames_captured.fetch_add(1, Ordering::Relaxed);
                } else {
                    break;
                }
            }
            Err(e) => {
                consecutive_errors += 1;
                if session.is_current(generation) {
                    session
                        .error_count
                        .store(consecutive_errors as u64, Ordering::SeqCst);
                }
                log::warn!(
                    "camera {}: read failed ({}/{}): {:#}",
                    id,
                    consecutive_errors,
                    settings.max_consecutive_errors,
                    e
                );
                if consecutive_errors >= settings.max_consecutive_errors {
                    exhausted = true;
                    break;
                }
                match shutdown.recv_timeout(settings.retry_backoff) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }
        }
    }

    let description = source.describe();
    source.release();
    drop(source);

    if exhausted && session.mark_failed(generation) {
        log::error!(
            "camera {}: {} consecutive read failures on {}; session failed",
            id,
            consecutive_errors,
            description
        );
    }
}
