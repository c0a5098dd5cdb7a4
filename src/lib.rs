//! Face Watch Kernel
//!
//! This crate implements the core of a multi-camera face watch system: it keeps
//! the latest frame of every connected camera, matches the faces it sees against
//! a gallery of known identities, and records alerts without flooding the log
//! when the same person stays in front of the same camera.
//!
//! # Architecture
//!
//! The kernel is built from three pieces that own all of the concurrency and
//! decision logic:
//!
//! 1. **Capture** (`capture`): one acquisition thread per camera session, a
//!    per-session latest-frame slot, and a bounded consecutive-error budget.
//! 2. **Matching** (`gallery`): an atomically published gallery snapshot and a
//!    nearest-neighbour Euclidean match with an exclusive distance threshold.
//! 3. **Pipeline** (`pipeline`): Known/Unknown/Suspicious classification and a
//!    per-(camera, identity) cooldown that admits one event per window.
//!
//! `monitor` wires the three together with one polling task per camera.
//!
//! # Module Structure
//!
//! - `frame`: owned RGB frames and face regions
//! - `ingest`: frame sources (synthetic, RTSP, USB/V4L2)
//! - `extract`: feature extraction backends (Zernike moments, stub)
//! - `storage`: persistence collaborator (SQLite, in-memory)
//! - `config`: layered daemon configuration

use anyhow::Result;
use rusqlite::{Connection, OpenFlags};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod capture;
pub mod config;
pub mod extract;
pub mod frame;
pub mod gallery;
pub mod ingest;
pub mod monitor;
pub mod pipeline;
pub mod storage;

pub use capture::{CaptureError, CaptureManager, CaptureSettings, SessionInfo, SessionStatus};
pub use extract::{
    largest_region, ExtractorRegistry, FeatureExtractor, FeatureVector, StubExtractor, StubFace,
    ZernikeExtractor, ZernikeSettings, MAX_FEATURE_LEN,
};
pub use frame::{FaceRegion, Frame};
pub use gallery::{
    Gallery, GalleryEntry, IdentityCategory, KnownIdentity, MatchResult, MatchingEngine,
    DEFAULT_MATCH_THRESHOLD, UNKNOWN_NAME,
};
pub use ingest::{FrameSource, SourceFactory, SyntheticConfig, SyntheticSource, UriSourceFactory};
pub use monitor::{Monitor, MonitorSettings};
pub use pipeline::{
    Alert, Classification, DedupState, DetectionEvent, DetectionPipeline, DEFAULT_COOLDOWN,
};
pub use storage::{
    shared, CameraRecord, CameraStatus, DetectionStats, IdentityRecord, InMemoryStore,
    NewDetection, SharedStore, SqliteStore, Store,
};

/// Identifier of a registered camera (the `cameras` row id).
pub type CameraId = i64;

/// Identifier of a known identity (the `identities` row id).
pub type IdentityId = i64;

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

/// Seconds since the Unix epoch for `at`. Times before the epoch clamp to 0.
pub fn unix_seconds(at: SystemTime) -> i64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub fn now_s() -> i64 {
    unix_seconds(SystemTime::now())
}

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
