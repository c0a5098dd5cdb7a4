//! Detection pipeline: classification, cooldown dedup, persistence, alerts.
//!
//! A `DetectionPipeline` is driven by exactly one thread (the monitor task of
//! the camera it serves), so its `DedupState` needs no lock. Keys are
//! `(camera_id, display_name)`; a pair is admitted when it was never logged or
//! when at least `cooldown` has passed since it was last admitted.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Result};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

use crate::gallery::{IdentityCategory, MatchResult};
use crate::storage::{NewDetection, SharedStore};
use crate::{unix_seconds, CameraId, IdentityId};

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Known,
    Unknown,
    Suspicious,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Known => "known",
            Classification::Unknown => "unknown",
            Classification::Suspicious => "suspicious",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "known" => Ok(Classification::Known),
            "unknown" => Ok(Classification::Unknown),
            "suspicious" => Ok(Classification::Suspicious),
            other => Err(anyhow!("unknown classification '{}'", other)),
        }
    }

    /// Whether an admitted detection of this kind is surfaced as an alert.
    pub fn raises_alert(&self) -> bool {
        !matches!(self, Classification::Known)
    }
}

/// A persisted detection.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionEvent {
    pub event_id: i64,
    pub camera_id: CameraId,
    pub identity_id: Option<IdentityId>,
    pub display_name: Option<String>,
    pub classification: Classification,
    /// Unix seconds.
    pub timestamp: i64,
}

/// User-facing notification for an admitted non-Known detection.
#[derive(Clone, Debug, PartialEq)]
pub struct Alert {
    pub camera_id: CameraId,
    pub classification: Classification,
    pub display_name: String,
    pub timestamp: SystemTime,
}

/// Last admission time per (camera, display name).
#[derive(Debug)]
pub struct DedupState {
    cooldown: Duration,
    last_logged: HashMap<(CameraId, String), SystemTime>,
}

impl DedupState {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_logged: HashMap::new(),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Admit and record `now`, or suppress. A clock that moved backwards
    /// counts as no time elapsed.
    pub fn admit(&mut self, camera_id: CameraId, display_name: &str, now: SystemTime) -> bool {
        let key = (camera_id, display_name.to_string());
        let admitted = match self.last_logged.get(&key) {
            None => true,
            Some(last) => now.duration_since(*last).unwrap_or(Duration::ZERO) >= self.cooldown,
        };
        if admitted {
            self.last_logged.insert(key, now);
        }
        admitted
    }

    /// Forget every entry of one camera. Returns how many were dropped.
    pub fn reset_camera(&mut self, camera_id: CameraId) -> usize {
        let before = self.last_logged.len();
        self.last_logged.retain(|(camera, _), _| *camera != camera_id);
        before - self.last_logged.len()
    }

    pub fn clear(&mut self) {
        self.last_logged.clear();
    }

    pub fn len(&self) -> usize {
        self.last_logged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_logged.is_empty()
    }
}

pub struct DetectionPipeline {
    dedup: DedupState,
    store: SharedStore,
    alerts: Option<Sender<Alert>>,
}

impl DetectionPipeline {
    pub fn new(store: SharedStore, cooldown: Duration, alerts: Option<Sender<Alert>>) -> Self {
        Self {
            dedup: DedupState::new(cooldown),
            store,
            alerts,
        }
    }

    pub fn dedup(&self) -> &DedupState {
        &self.dedup
    }

    pub fn reset_camera(&mut self, camera_id: CameraId) -> usize {
        self.dedup.reset_camera(camera_id)
    }

    /// Process one frame's results in order. Returns the events that were
    /// admitted and written.
    pub fn process(
        &mut self,
        camera_id: CameraId,
        results: &[MatchResult],
        now: SystemTime,
    ) -> Vec<DetectionEvent> {
        results
            .iter()
            .filter_map(|result| self.process_one(camera_id, result, now))
            .collect()
    }

    pub fn process_one(
        &mut self,
        camera_id: CameraId,
        result: &MatchResult,
        now: SystemTime,
    ) -> Option<DetectionEvent> {
        let classification = self.classify(result);
        if !self.dedup.admit(camera_id, &result.name, now) {
            log::debug!(
                "camera {}: suppressed repeat detection of {}",
                camera_id,
                result.name
            );
            return None;
        }

        let detection = NewDetection {
            camera_id,
            classification,
            identity_id: result.identity_id,
            display_name: Some(result.name.clone()),
            timestamp: unix_seconds(now),
        };
        let written = self.write(&detection);

        if classification.raises_alert() {
            self.emit(Alert {
                camera_id,
                classification,
                display_name: result.name.clone(),
                timestamp: now,
            });
        }

        match written {
            Ok(event_id) => {
                log::info!(
                    "camera {}: logged {} detection of {} (distance {:.4})",
                    camera_id,
                    classification.as_str(),
                    result.name,
                    result.distance
                );
                Some(DetectionEvent {
                    event_id,
                    camera_id,
                    identity_id: detection.identity_id,
                    display_name: detection.display_name,
                    classification,
                    timestamp: detection.timestamp,
                })
            }
            Err(e) => {
                log::error!(
                    "camera {}: failed to log detection of {}: {:#}",
                    camera_id,
                    result.name,
                    e
                );
                None
            }
        }
    }

    /// Unknown without an identity; otherwise the identity's category decides.
    /// A missing identity or a failed lookup falls back to Known.
    pub fn classify(&self, result: &MatchResult) -> Classification {
        let Some(identity_id) = result.identity_id else {
            return Classification::Unknown;
        };
        let lookup = self
            .store
            .lock()
            .map_err(|_| anyhow!("store lock poisoned"))
            .and_then(|store| store.identity_by_id(identity_id));
        match lookup {
            Ok(Some(identity)) => match identity.category {
                IdentityCategory::Flagged => Classification::Suspicious,
                IdentityCategory::Trusted => Classification::Known,
            },
            Ok(None) => {
                log::warn!(
                    "identity {} matched but is no longer stored; treating as known",
                    identity_id
                );
                Classification::Known
            }
            Err(e) => {
                log::warn!(
                    "identity {} lookup failed, treating as known: {:#}",
                    identity_id,
                    e
                );
                Classification::Known
            }
        }
    }

    fn write(&self, detection: &NewDetection) -> Result<i64> {
        let mut store = self
            .store
            .lock()
            .map_err(|_| anyhow!("store lock poisoned"))?;
        store.log_detection(detection)
    }

    fn emit(&self, alert: Alert) {
        log::warn!(
            "ALERT camera {}: {} ({})",
            alert.camera_id,
            alert.display_name,
            alert.classification.as_str()
        );
        let Some(alerts) = &self.alerts else {
            return;
        };
        if alerts.send(alert).is_err() {
            log::debug!("alert receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FaceRegion;
    use crate::gallery::UNKNOWN_NAME;
    use crate::storage::{shared, InMemoryStore, Store};
    use std::sync::{Arc, Mutex};

    fn matched(id: Option<IdentityId>, name: &str) -> MatchResult {
        MatchResult {
            region: FaceRegion::new(0, 0, 10, 10),
            identity_id: id,
            name: name.to_string(),
            distance: 0.0,
        }
    }

    struct Fixture {
        store: Arc<Mutex<InMemoryStore>>,
        camera: CameraId,
        alice: IdentityId,
        bob: IdentityId,
    }

    fn fixture() -> Result<Fixture> {
        let mut store = InMemoryStore::new();
        let camera = store.add_camera("C1", "stub://c1")?;
        let alice = store.add_identity("Alice", IdentityCategory::Trusted)?;
        let bob = store.add_identity("Bob", IdentityCategory::Flagged)?;
        Ok(Fixture {
            store: Arc::new(Mutex::new(store)),
            camera,
            alice,
            bob,
        })
    }

    fn pipeline(fx: &Fixture, alerts: Option<Sender<Alert>>) -> DetectionPipeline {
        let store: SharedStore = fx.store.clone();
        DetectionPipeline::new(store, DEFAULT_COOLDOWN, alerts)
    }

    #[test]
    fn dedup_boundary_is_inclusive() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let mut dedup = DedupState::new(Duration::from_secs(60));
        assert!(dedup.admit(1, "Alice", t0));
        assert!(!dedup.admit(1, "Alice", t0 + Duration::from_secs(59)));
        assert!(dedup.admit(1, "Alice", t0 + Duration::from_secs(60)));
        assert!(dedup.admit(2, "Alice", t0));
        assert!(dedup.admit(1, "Bob", t0));
    }

    #[test]
    fn suppressed_detection_does_not_extend_window() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let mut dedup = DedupState::new(Duration::from_secs(60));
        assert!(dedup.admit(1, "Alice", t0));
        assert!(!dedup.admit(1, "Alice", t0 + Duration::from_secs(30)));
        assert!(dedup.admit(1, "Alice", t0 + Duration::from_secs(61)));
    }

    #[test]
    fn clock_going_backwards_suppresses() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let mut dedup = DedupState::new(Duration::from_secs(60));
        assert!(dedup.admit(1, "Alice", t0));
        assert!(!dedup.admit(1, "Alice", t0 - Duration::from_secs(600)));
    }

    #[test]
    fn reset_is_per_camera() {
        let t0 = SystemTime::UNIX_EPOCH;
        let mut dedup = DedupState::new(Duration::from_secs(60));
        dedup.admit(1, "Alice", t0);
        dedup.admit(1, "Bob", t0);
        dedup.admit(2, "Alice", t0);
        assert_eq!(dedup.reset_camera(1), 2);
        assert!(dedup.admit(1, "Alice", t0));
        assert!(!dedup.admit(2, "Alice", t0));
        dedup.clear();
        assert!(dedup.is_empty());
    }

    #[test]
    fn classification_follows_identity_category() -> Result<()> {
        let fx = fixture()?;
        let p = pipeline(&fx, None);
        assert_eq!(p.classify(&matched(None, UNKNOWN_NAME)), Classification::Unknown);
        assert_eq!(p.classify(&matched(Some(fx.alice), "Alice")), Classification::Known);
        assert_eq!(p.classify(&matched(Some(fx.bob), "Bob")), Classification::Suspicious);
        assert_eq!(p.classify(&matched(Some(999), "Ghost")), Classification::Known);

        fx.store
            .lock()
            .map_err(|_| anyhow!("poisoned"))?
            .set_fail_reads(true);
        assert_eq!(p.classify(&matched(Some(fx.bob), "Bob")), Classification::Known);
        Ok(())
    }

    #[test]
    fn two_within_cooldown_then_one_after() -> Result<()> {
        let fx = fixture()?;
        let mut p = pipeline(&fx, None);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(10_000);
        let alice = matched(Some(fx.alice), "Alice");

        assert!(p.process_one(fx.camera, &alice, t0).is_some());
        assert!(p
            .process_one(fx.camera, &alice, t0 + Duration::from_secs(10))
            .is_none());
        assert!(p
            .process_one(fx.camera, &alice, t0 + DEFAULT_COOLDOWN)
            .is_some());

        let store = fx.store.lock().map_err(|_| anyhow!("poisoned"))?;
        assert_eq!(store.detections().len(), 2);
        Ok(())
    }

    #[test]
    fn alice_then_bob_scenario() -> Result<()> {
        let fx = fixture()?;
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut p = pipeline(&fx, Some(tx));
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(50_000);

        let frame1 = p.process(fx.camera, &[matched(Some(fx.alice), "Alice")], t0);
        assert_eq!(frame1.len(), 1);
        assert_eq!(frame1[0].classification, Classification::Known);

        let frame2 = p.process(fx.camera, &[matched(Some(fx.alice), "Alice")], t0);
        assert!(frame2.is_empty());

        let t3 = t0 + Duration::from_secs(61);
        let frame3 = p.process(fx.camera, &[matched(Some(fx.bob), "Bob")], t3);
        assert_eq!(frame3.len(), 1);
        assert_eq!(frame3[0].classification, Classification::Suspicious);
        assert_eq!(frame3[0].timestamp, unix_seconds(t3));

        let alerts: Vec<Alert> = rx.try_iter().collect();
        assert_eq!(
            alerts,
            vec![Alert {
                camera_id: fx.camera,
                classification: Classification::Suspicious,
                display_name: "Bob".to_string(),
                timestamp: t3,
            }]
        );

        let store = fx.store.lock().map_err(|_| anyhow!("poisoned"))?;
        assert_eq!(store.detection_history(0, Some(fx.camera))?.len(), 2);
        Ok(())
    }

    #[test]
    fn failed_write_still_records_dedup_and_alerts() -> Result<()> {
        let fx = fixture()?;
        fx.store
            .lock()
            .map_err(|_| anyhow!("poisoned"))?
            .set_fail_writes(true);
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut p = pipeline(&fx, Some(tx));
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1);
        let unknown = matched(None, UNKNOWN_NAME);

        assert!(p.process_one(fx.camera, &unknown, t0).is_none());
        assert_eq!(rx.try_iter().count(), 1);
        assert_eq!(p.dedup().len(), 1);

        fx.store
            .lock()
            .map_err(|_| anyhow!("poisoned"))?
            .set_fail_writes(false);
        assert!(p.process_one(fx.camera, &unknown, t0).is_none());
        assert_eq!(rx.try_iter().count(), 0);
        Ok(())
    }

    #[test]
    fn unknown_faces_share_one_dedup_key() -> Result<()> {
        let fx = fixture()?;
        let mut p = pipeline(&fx, None);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1);
        let events = p.process(
            fx.camera,
            &[matched(None, UNKNOWN_NAME), matched(None, UNKNOWN_NAME)],
            t0,
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].display_name.as_deref(), Some(UNKNOWN_NAME));
        Ok(())
    }

    #[test]
    fn shared_helper_wraps_any_store() -> Result<()> {
        let store = shared(InMemoryStore::new());
        let mut p = DetectionPipeline::new(store, DEFAULT_COOLDOWN, None);
        // The camera does not exist, so the write fails but dedup still records.
        assert!(p
            .process_one(1, &matched(None, UNKNOWN_NAME), SystemTime::UNIX_EPOCH)
            .is_none());
        assert_eq!(p.reset_camera(1), 1);
        Ok(())
    }
}
