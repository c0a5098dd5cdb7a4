//! Persistence collaborator.
//!
//! `Store` is the narrow interface the kernel consumes (identities with
//! features, identity/camera lookup, detection logging) plus the record
//! management the admin tool needs. `SqliteStore` is the durable
//! implementation; `InMemoryStore` mirrors its semantics for tests.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::extract::FeatureVector;
use crate::gallery::{IdentityCategory, KnownIdentity};
use crate::pipeline::{Classification, DetectionEvent};
use crate::{now_s, CameraId, IdentityId};

/// Number of names reported in `DetectionStats::top_names`.
pub const TOP_NAMES: usize = 5;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IdentityRecord {
    pub id: IdentityId,
    pub name: String,
    pub category: IdentityCategory,
    pub has_features: bool,
    pub created_at: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraStatus {
    Active,
    Inactive,
}

impl CameraStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraStatus::Active => "active",
            CameraStatus::Inactive => "inactive",
        }
    }

    fn from_stored(value: &str) -> Self {
        if value.eq_ignore_ascii_case("active") {
            CameraStatus::Active
        } else {
            CameraStatus::Inactive
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CameraRecord {
    pub id: CameraId,
    pub name: String,
    pub source_uri: String,
    pub status: CameraStatus,
    pub created_at: i64,
}

/// A detection admitted by the pipeline, ready to be written.
#[derive(Clone, Debug, PartialEq)]
pub struct NewDetection {
    pub camera_id: CameraId,
    pub classification: Classification,
    pub identity_id: Option<IdentityId>,
    pub display_name: Option<String>,
    /// Unix seconds.
    pub timestamp: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DetectionStats {
    pub total: u64,
    pub known: u64,
    pub unknown: u64,
    pub suspicious: u64,
    /// Most frequent non-Known names, highest count first.
    pub top_names: Vec<(String, u64)>,
}

impl DetectionStats {
    fn add(&mut self, classification: Classification, count: u64) {
        self.total += count;
        match classification {
            Classification::Known => self.known += count,
            Classification::Unknown => self.unknown += count,
            Classification::Suspicious => self.suspicious += count,
        }
    }
}

pub trait Store: Send {
    // --- consumed by the kernel -------------------------------------------

    /// Every identity that currently has a feature vector, in id order.
    /// Rows whose stored vector cannot be decoded are skipped with a warning.
    fn identities_with_features(&self) -> Result<Vec<KnownIdentity>>;

    fn identity_by_id(&self, id: IdentityId) -> Result<Option<IdentityRecord>>;

    fn camera_by_id(&self, id: CameraId) -> Result<Option<CameraRecord>>;

    /// Opaque value that changes whenever identity data may have changed,
    /// including writes made by another process sharing the database. Compare
    /// successive values to decide whether the gallery needs a reload.
    fn gallery_version(&self) -> Result<i64>;

    /// Persist one admitted detection and return its event id.
    fn log_detection(&mut self, detection: &NewDetection) -> Result<i64>;

    // --- identities ---------------------------------------------------------

    fn add_identity(&mut self, name: &str, category: IdentityCategory) -> Result<IdentityId>;

    fn list_identities(&self) -> Result<Vec<IdentityRecord>>;

    fn set_identity_category(&mut self, id: IdentityId, category: IdentityCategory)
        -> Result<()>;

    /// Replace the identity's vector. Only the latest vector is kept.
    fn set_identity_features(&mut self, id: IdentityId, features: &FeatureVector) -> Result<()>;

    fn clear_identity_features(&mut self, id: IdentityId) -> Result<()>;

    /// Delete an identity. Its past detections keep their name but lose the link.
    fn delete_identity(&mut self, id: IdentityId) -> Result<()>;

    // --- cameras ------------------------------------------------------------

    fn add_camera(&mut self, name: &str, source_uri: &str) -> Result<CameraId>;

    fn list_cameras(&self) -> Result<Vec<CameraRecord>>;

    fn update_camera(
        &mut self,
        id: CameraId,
        name: Option<&str>,
        source_uri: Option<&str>,
    ) -> Result<()>;

    fn set_camera_status(&mut self, id: CameraId, status: CameraStatus) -> Result<()>;

    /// Delete a camera together with its detection history.
    fn delete_camera(&mut self, id: CameraId) -> Result<()>;

    // --- detection history ---------------------------------------------------

    /// Events at or after `since` (unix seconds), newest first.
    fn detection_history(
        &self,
        since: i64,
        camera_id: Option<CameraId>,
    ) -> Result<Vec<DetectionEvent>>;

    fn detection_stats(&self, since: i64) -> Result<DetectionStats>;

    /// Bulk-delete events older than `before` (unix seconds). Returns the count.
    fn prune_detections(&mut self, before: i64) -> Result<usize>;
}

/// Store shared between the pipeline threads and the monitor.
pub type SharedStore = Arc<Mutex<dyn Store>>;

pub fn shared<S: Store + 'static>(store: S) -> SharedStore {
    Arc::new(Mutex::new(store))
}

fn validate_name(kind: &str, name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("{} name must not be empty", kind));
    }
    Ok(name.to_string())
}

// ----------------------------------------------------------------------------
// SQLite
// ----------------------------------------------------------------------------

pub struct SqliteStore {
    conn: Connection,
    /// Identity writes made through this connection. `PRAGMA data_version`
    /// only moves for commits from other connections.
    identity_writes: i64,
}

impl SqliteStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = crate::open_db_connection(db_path)
            .with_context(|| format!("open database {}", db_path))?;
        let mut store = Self {
            conn,
            identity_writes: 0,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS identities (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL UNIQUE,
              category TEXT NOT NULL,
              features BLOB,
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cameras (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL,
              source_uri TEXT NOT NULL UNIQUE,
              status TEXT NOT NULL DEFAULT 'inactive',
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              camera_id INTEGER NOT NULL REFERENCES cameras(id) ON DELETE CASCADE,
              identity_id INTEGER REFERENCES identities(id) ON DELETE SET NULL,
              display_name TEXT,
              classification TEXT NOT NULL,
              created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_detections_created ON detections(created_at);
            CREATE INDEX IF NOT EXISTS idx_detections_camera ON detections(camera_id, created_at);
            "#,
        )?;
        Ok(())
    }

    fn expect_one(changed: usize, what: &str, id: i64) -> Result<()> {
        if changed == 0 {
            return Err(anyhow!("{} {} not found", what, id));
        }
        Ok(())
    }
}

impl Store for SqliteStore {
    fn identities_with_features(&self) -> Result<Vec<KnownIdentity>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, category, features FROM identities \
             WHERE features IS NOT NULL ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let id: IdentityId = row.get(0)?;
            let name: String = row.get(1)?;
            let category: String = row.get(2)?;
            let blob: Vec<u8> = row.get(3)?;
            match FeatureVector::from_bytes(&blob) {
                Ok(features) => out.push(KnownIdentity {
                    id,
                    name,
                    category: IdentityCategory::from_stored(&category),
                    features: Some(features),
                }),
                Err(e) => log::warn!("skipping features of identity {}: {}", id, e),
            }
        }
        Ok(out)
    }

    fn identity_by_id(&self, id: IdentityId) -> Result<Option<IdentityRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT id, name, category, features IS NOT NULL, created_at \
                 FROM identities WHERE id = ?1",
                params![id],
                |row| {
                    Ok(IdentityRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        category: IdentityCategory::from_stored(&row.get::<_, String>(2)?),
                        has_features: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn camera_by_id(&self, id: CameraId) -> Result<Option<CameraRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT id, name, source_uri, status, created_at FROM cameras WHERE id = ?1",
                params![id],
                |row| {
                    Ok(CameraRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        source_uri: row.get(2)?,
                        status: CameraStatus::from_stored(&row.get::<_, String>(3)?),
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn gallery_version(&self) -> Result<i64> {
        let data_version: i64 = self
            .conn
            .query_row("PRAGMA data_version", [], |row| row.get(0))?;
        Ok(data_version + self.identity_writes)
    }

    fn log_detection(&mut self, detection: &NewDetection) -> Result<i64> {
        self.conn
            .execute(
                r#"
                INSERT INTO detections(camera_id, identity_id, display_name, classification, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    detection.camera_id,
                    detection.identity_id,
                    detection.display_name,
                    detection.classification.as_str(),
                    detection.timestamp
                ],
            )
            .with_context(|| format!("log detection for camera {}", detection.camera_id))?;
        Ok(self.conn.last_insert_rowid())
    }

    fn add_identity(&mut self, name: &str, category: IdentityCategory) -> Result<IdentityId> {
        let name = validate_name("identity", name)?;
        self.conn
            .execute(
                "INSERT INTO identities(name, category, created_at) VALUES (?1, ?2, ?3)",
                params![name, category.as_str(), now_s()],
            )
            .with_context(|| format!("add identity '{}'", name))?;
        self.identity_writes += 1;
        Ok(self.conn.last_insert_rowid())
    }

    fn list_identities(&self) -> Result<Vec<IdentityRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, category, features IS NOT NULL, created_at \
             FROM identities ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let category: String = row.get(2)?;
            out.push(IdentityRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                category: IdentityCategory::from_stored(&category),
                has_features: row.get(3)?,
                created_at: row.get(4)?,
            });
        }
        Ok(out)
    }

    fn set_identity_category(
        &mut self,
        id: IdentityId,
        category: IdentityCategory,
    ) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE identities SET category = ?1 WHERE id = ?2",
            params![category.as_str(), id],
        )?;
        self.identity_writes += 1;
        Self::expect_one(changed, "identity", id)
    }

    fn set_identity_features(&mut self, id: IdentityId, features: &FeatureVector) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE identities SET features = ?1 WHERE id = ?2",
            params![features.to_bytes(), id],
        )?;
        self.identity_writes += 1;
        Self::expect_one(changed, "identity", id)
    }

    fn clear_identity_features(&mut self, id: IdentityId) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE identities SET features = NULL WHERE id = ?1",
            params![id],
        )?;
        self.identity_writes += 1;
        Self::expect_one(changed, "identity", id)
    }

    fn delete_identity(&mut self, id: IdentityId) -> Result<()> {
        let changed = self
            .conn
            .execute("DELETE FROM identities WHERE id = ?1", params![id])?;
        self.identity_writes += 1;
        Self::expect_one(changed, "identity", id)
    }

    fn add_camera(&mut self, name: &str, source_uri: &str) -> Result<CameraId> {
        let name = validate_name("camera", name)?;
        let source_uri = source_uri.trim();
        if source_uri.is_empty() {
            return Err(anyhow!("camera source URI must not be empty"));
        }
        self.conn
            .execute(
                "INSERT INTO cameras(name, source_uri, status, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![name, source_uri, CameraStatus::Inactive.as_str(), now_s()],
            )
            .with_context(|| format!("add camera '{}' ({})", name, source_uri))?;
        Ok(self.conn.last_insert_rowid())
    }

    fn list_cameras(&self) -> Result<Vec<CameraRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, source_uri, status, created_at FROM cameras ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let status: String = row.get(3)?;
            out.push(CameraRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                source_uri: row.get(2)?,
                status: CameraStatus::from_stored(&status),
                created_at: row.get(4)?,
            });
        }
        Ok(out)
    }

    fn update_camera(
        &mut self,
        id: CameraId,
        name: Option<&str>,
        source_uri: Option<&str>,
    ) -> Result<()> {
        let name = name.map(|n| validate_name("camera", n)).transpose()?;
        let changed = self
            .conn
            .execute(
                "UPDATE cameras SET name = COALESCE(?1, name), \
                 source_uri = COALESCE(?2, source_uri) WHERE id = ?3",
                params![name, source_uri.map(str::trim), id],
            )
            .with_context(|| format!("update camera {}", id))?;
        Self::expect_one(changed, "camera", id)
    }

    fn set_camera_status(&mut self, id: CameraId, status: CameraStatus) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE cameras SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Self::expect_one(changed, "camera", id)
    }

    fn delete_camera(&mut self, id: CameraId) -> Result<()> {
        let changed = self
            .conn
            .execute("DELETE FROM cameras WHERE id = ?1", params![id])?;
        Self::expect_one(changed, "camera", id)
    }

    fn detection_history(
        &self,
        since: i64,
        camera_id: Option<CameraId>,
    ) -> Result<Vec<DetectionEvent>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, camera_id, identity_id, display_name, classification, created_at
            FROM detections
            WHERE created_at >= ?1 AND (?2 IS NULL OR camera_id = ?2)
            ORDER BY created_at DESC, id DESC
            "#,
        )?;
        let mut rows = stmt.query(params![since, camera_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let classification: String = row.get(4)?;
            out.push(DetectionEvent {
                event_id: row.get(0)?,
                camera_id: row.get(1)?,
                identity_id: row.get(2)?,
                display_name: row.get(3)?,
                classification: Classification::parse(&classification)?,
                timestamp: row.get(5)?,
            });
        }
        Ok(out)
    }

    fn detection_stats(&self, since: i64) -> Result<DetectionStats> {
        let mut stats = DetectionStats::default();
        {
            let mut stmt = self.conn.prepare(
                "SELECT classification, COUNT(*) FROM detections \
                 WHERE created_at >= ?1 GROUP BY classification",
            )?;
            let mut rows = stmt.query(params![since])?;
            while let Some(row) = rows.next()? {
                let classification = Classification::parse(&row.get::<_, String>(0)?)?;
                let count: i64 = row.get(1)?;
                stats.add(classification, count as u64);
            }
        }

        let mut stmt = self.conn.prepare(
            r#"
            SELECT display_name, COUNT(*) AS hits FROM detections
            WHERE created_at >= ?1 AND classification != 'known' AND display_name IS NOT NULL
            GROUP BY display_name
            ORDER BY hits DESC, display_name ASC
            LIMIT ?2
            "#,
        )?;
        let mut rows = stmt.query(params![since, TOP_NAMES as i64])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            let hits: i64 = row.get(1)?;
            stats.top_names.push((name, hits as u64));
        }
        Ok(stats)
    }

    fn prune_detections(&mut self, before: i64) -> Result<usize> {
        let removed = self
            .conn
            .execute("DELETE FROM detections WHERE created_at < ?1", params![before])?;
        Ok(removed)
    }
}

// ----------------------------------------------------------------------------
// In-memory
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct InMemoryIdentity {
    record: IdentityRecord,
    features: Option<FeatureVector>,
}

/// In-memory store with the same constraints as the SQLite schema (unique
/// names and URIs, cascade on camera delete, unlink on identity delete).
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    identities: Vec<InMemoryIdentity>,
    cameras: Vec<CameraRecord>,
    detections: Vec<DetectionEvent>,
    next_id: i64,
    /// When set, `log_detection` fails.
    fail_writes: bool,
    /// When set, the kernel lookups fail.
    fail_reads: bool,
    identity_writes: i64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    pub fn set_fail_reads(&mut self, fail: bool) {
        self.fail_reads = fail;
    }

    fn check_reads(&self) -> Result<()> {
        if self.fail_reads {
            return Err(anyhow!("detection store is unavailable"));
        }
        Ok(())
    }

    /// Every logged event, oldest first.
    pub fn detections(&self) -> &[DetectionEvent] {
        &self.detections
    }

    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn identity_mut(&mut self, id: IdentityId) -> Result<&mut InMemoryIdentity> {
        self.identities
            .iter_mut()
            .find(|entry| entry.record.id == id)
            .ok_or_else(|| anyhow!("identity {} not found", id))
    }

    fn camera_mut(&mut self, id: CameraId) -> Result<&mut CameraRecord> {
        self.cameras
            .iter_mut()
            .find(|camera| camera.id == id)
            .ok_or_else(|| anyhow!("camera {} not found", id))
    }
}

impl Store for InMemoryStore {
    fn identities_with_features(&self) -> Result<Vec<KnownIdentity>> {
        self.check_reads()?;
        Ok(self
            .identities
            .iter()
            .filter(|entry| entry.features.is_some())
            .map(|entry| KnownIdentity {
                id: entry.record.id,
                name: entry.record.name.clone(),
                category: entry.record.category,
                features: entry.features.clone(),
            })
            .collect())
    }

    fn identity_by_id(&self, id: IdentityId) -> Result<Option<IdentityRecord>> {
        self.check_reads()?;
        Ok(self
            .identities
            .iter()
            .find(|entry| entry.record.id == id)
            .map(|entry| entry.record.clone()))
    }

    fn camera_by_id(&self, id: CameraId) -> Result<Option<CameraRecord>> {
        self.check_reads()?;
        Ok(self.cameras.iter().find(|camera| camera.id == id).cloned())
    }

    fn gallery_version(&self) -> Result<i64> {
        self.check_reads()?;
        Ok(self.identity_writes)
    }

    fn log_detection(&mut self, detection: &NewDetection) -> Result<i64> {
        if self.fail_writes {
            return Err(anyhow!("detection store is read-only"));
        }
        if !self.cameras.iter().any(|c| c.id == detection.camera_id) {
            return Err(anyhow!("camera {} not found", detection.camera_id));
        }
        let event_id = self.allocate_id();
        self.detections.push(DetectionEvent {
            event_id,
            camera_id: detection.camera_id,
            identity_id: detection.identity_id,
            display_name: detection.display_name.clone(),
            classification: detection.classification,
            timestamp: detection.timestamp,
        });
        Ok(event_id)
    }

    fn add_identity(&mut self, name: &str, category: IdentityCategory) -> Result<IdentityId> {
        let name = validate_name("identity", name)?;
        if self.identities.iter().any(|entry| entry.record.name == name) {
            return Err(anyhow!("identity '{}' already exists", name));
        }
        let id = self.allocate_id();
        self.identities.push(InMemoryIdentity {
            record: IdentityRecord {
                id,
                name,
                category,
                has_features: false,
                created_at: now_s(),
            },
            features: None,
        });
        self.identity_writes += 1;
        Ok(id)
    }

    fn list_identities(&self) -> Result<Vec<IdentityRecord>> {
        Ok(self
            .identities
            .iter()
            .map(|entry| entry.record.clone())
            .collect())
    }

    fn set_identity_category(
        &mut self,
        id: IdentityId,
        category: IdentityCategory,
    ) -> Result<()> {
        self.identity_mut(id)?.record.category = category;
        self.identity_writes += 1;
        Ok(())
    }

    fn set_identity_features(&mut self, id: IdentityId, features: &FeatureVector) -> Result<()> {
        let entry = self.identity_mut(id)?;
        entry.features = Some(features.clone());
        entry.record.has_features = true;
        self.identity_writes += 1;
        Ok(())
    }

    fn clear_identity_features(&mut self, id: IdentityId) -> Result<()> {
        let entry = self.identity_mut(id)?;
        entry.features = None;
        entry.record.has_features = false;
        self.identity_writes += 1;
        Ok(())
    }

    fn delete_identity(&mut self, id: IdentityId) -> Result<()> {
        let before = self.identities.len();
        self.identities.retain(|entry| entry.record.id != id);
        if self.identities.len() == before {
            return Err(anyhow!("identity {} not found", id));
        }
        for event in &mut self.detections {
            if event.identity_id == Some(id) {
                event.identity_id = None;
            }
        }
        self.identity_writes += 1;
        Ok(())
    }

    fn add_camera(&mut self, name: &str, source_uri: &str) -> Result<CameraId> {
        let name = validate_name("camera", name)?;
        let source_uri = source_uri.trim();
        if source_uri.is_empty() {
            return Err(anyhow!("camera source URI must not be empty"));
        }
        if self.cameras.iter().any(|c| c.source_uri == source_uri) {
            return Err(anyhow!("camera source {} already registered", source_uri));
        }
        let id = self.allocate_id();
        self.cameras.push(CameraRecord {
            id,
            name,
            source_uri: source_uri.to_string(),
            status: CameraStatus::Inactive,
            created_at: now_s(),
        });
        Ok(id)
    }

    fn list_cameras(&self) -> Result<Vec<CameraRecord>> {
        Ok(self.cameras.clone())
    }

    fn update_camera(
        &mut self,
        id: CameraId,
        name: Option<&str>,
        source_uri: Option<&str>,
    ) -> Result<()> {
        let name = name.map(|n| validate_name("camera", n)).transpose()?;
        if let Some(uri) = source_uri.map(str::trim) {
            if self.cameras.iter().any(|c| c.id != id && c.source_uri == uri) {
                return Err(anyhow!("camera source {} already registered", uri));
            }
        }
        let camera = self.camera_mut(id)?;
        if let Some(name) = name {
            camera.name = name;
        }
        if let Some(uri) = source_uri {
            camera.source_uri = uri.trim().to_string();
        }
        Ok(())
    }

    fn set_camera_status(&mut self, id: CameraId, status: CameraStatus) -> Result<()> {
        self.camera_mut(id)?.status = status;
        Ok(())
    }

    fn delete_camera(&mut self, id: CameraId) -> Result<()> {
        let before = self.cameras.len();
        self.cameras.retain(|camera| camera.id != id);
        if self.cameras.len() == before {
            return Err(anyhow!("camera {} not found", id));
        }
        self.detections.retain(|event| event.camera_id != id);
        Ok(())
    }

    fn detection_history(
        &self,
        since: i64,
        camera_id: Option<CameraId>,
    ) -> Result<Vec<DetectionEvent>> {
        let mut out: Vec<DetectionEvent> = self
            .detections
            .iter()
            .filter(|event| event.timestamp >= since)
            .filter(|event| camera_id.map_or(true, |id| event.camera_id == id))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then(b.event_id.cmp(&a.event_id))
        });
        Ok(out)
    }

    fn detection_stats(&self, since: i64) -> Result<DetectionStats> {
        let mut stats = DetectionStats::default();
        let mut names: HashMap<String, u64> = HashMap::new();
        for event in self.detections.iter().filter(|e| e.timestamp >= since) {
            stats.add(event.classification, 1);
            if event.classification != Classification::Known {
                if let Some(name) = &event.display_name {
                    *names.entry(name.clone()).or_default() += 1;
                }
            }
        }
        let mut top: Vec<(String, u64)> = names.into_iter().collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        top.truncate(TOP_NAMES);
        stats.top_names = top;
        Ok(stats)
    }

    fn prune_detections(&mut self, before: i64) -> Result<usize> {
        let count = self.detections.len();
        self.detections.retain(|event| event.timestamp >= before);
        Ok(count - self.detections.len())
    }
}
