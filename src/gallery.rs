//! Known-identity gallery and nearest-neighbour matching.
//!
//! The gallery is published as an immutable `Arc<Gallery>` snapshot. Matching
//! clones the `Arc` once per frame and works on that snapshot, so a concurrent
//! `load_gallery` never exposes a partially loaded gallery: readers see either
//! the old snapshot or the new one.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::extract::{FeatureExtractor, FeatureVector};
use crate::frame::{FaceRegion, Frame};
use crate::storage::Store;
use crate::IdentityId;

/// Default match threshold for Zernike descriptors.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.06;

/// Label given to faces that match no gallery entry.
pub const UNKNOWN_NAME: &str = "Unknown";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityCategory {
    Trusted,
    Flagged,
}

impl IdentityCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityCategory::Trusted => "trusted",
            IdentityCategory::Flagged => "flagged",
        }
    }

    /// Strict parse for operator input. `whitelist`/`blacklist` are accepted
    /// as aliases.
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "trusted" | "whitelist" => Ok(IdentityCategory::Trusted),
            "flagged" | "blacklist" => Ok(IdentityCategory::Flagged),
            other => Err(anyhow!(
                "unknown identity category '{}' (expected trusted or flagged)",
                other
            )),
        }
    }

    /// Lenient parse for stored rows: anything that is not flagged is trusted.
    pub fn from_stored(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "flagged" | "blacklist" => IdentityCategory::Flagged,
            _ => IdentityCategory::Trusted,
        }
    }
}

/// An identity as read from persistence.
#[derive(Clone, Debug, PartialEq)]
pub struct KnownIdentity {
    pub id: IdentityId,
    pub name: String,
    pub category: IdentityCategory,
    pub features: Option<FeatureVector>,
}

#[derive(Clone, Debug)]
pub struct GalleryEntry {
    pub id: IdentityId,
    pub name: String,
    pub features: FeatureVector,
}

/// Immutable gallery snapshot.
#[derive(Clone, Debug, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Identities without features are ignored. When an id appears more than
    /// once, the first occurrence wins.
    pub fn from_identities(identities: Vec<KnownIdentity>) -> Self {
        let mut seen = HashSet::new();
        let entries = identities
            .into_iter()
            .filter_map(|identity| {
                let features = identity.features?;
                if !seen.insert(identity.id) {
                    log::warn!("identity {} appears twice in gallery load", identity.id);
                    return None;
                }
                Some(GalleryEntry {
                    id: identity.id,
                    name: identity.name,
                    features,
                })
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn contains(&self, id: IdentityId) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }

    /// Closest entry and its distance. Entries whose length differs from the
    /// probe are skipped; ties keep the earliest entry.
    pub fn nearest(&self, probe: &FeatureVector) -> Option<(&GalleryEntry, f64)> {
        let mut best: Option<(&GalleryEntry, f64)> = None;
        for entry in &self.entries {
            let Some(distance) = entry.features.distance(probe) else {
                continue;
            };
            match best {
                Some((_, best_distance)) if best_distance <= distance => {}
                _ => best = Some((entry, distance)),
            }
        }
        best
    }
}

/// Outcome for one detected face.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MatchResult {
    pub region: FaceRegion,
    pub identity_id: Option<IdentityId>,
    /// Identity name, or `UNKNOWN_NAME`.
    pub name: String,
    /// Distance to the nearest comparable entry; infinite when there was none.
    pub distance: f64,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        self.identity_id.is_some()
    }
}

pub struct MatchingEngine {
    extractor: Arc<dyn FeatureExtractor>,
    gallery: RwLock<Arc<Gallery>>,
    threshold: f64,
}

impl MatchingEngine {
    pub fn new(extractor: Arc<dyn FeatureExtractor>, threshold: f64) -> Result<Self> {
        if !(threshold.is_finite() && threshold > 0.0) {
            return Err(anyhow!(
                "match threshold must be a positive finite number, got {}",
                threshold
            ));
        }
        Ok(Self {
            extractor,
            gallery: RwLock::new(Arc::new(Gallery::empty())),
            threshold,
        })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn extractor(&self) -> &Arc<dyn FeatureExtractor> {
        &self.extractor
    }

    /// Current snapshot.
    pub fn gallery(&self) -> Arc<Gallery> {
        match self.gallery.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replace the gallery snapshot.
    pub fn publish(&self, gallery: Gallery) {
        let gallery = Arc::new(gallery);
        match self.gallery.write() {
            Ok(mut guard) => *guard = gallery,
            Err(poisoned) => *poisoned.into_inner() = gallery,
        }
    }

    /// Reload every identity with features from `store` and publish the result.
    /// On error the previous gallery stays in place and the error is returned.
    pub fn load_gallery(&self, store: &dyn Store) -> Result<usize> {
        let identities = match store.identities_with_features() {
            Ok(identities) => identities,
            Err(e) => {
                log::error!("gallery reload failed, keeping previous gallery: {:#}", e);
                return Err(e);
            }
        };
        let gallery = Gallery::from_identities(identities);
        warn_on_mixed_lengths(&gallery);
        let count = gallery.len();
        self.publish(gallery);
        log::info!("loaded {} known faces", count);
        Ok(count)
    }

    /// Match every face in `frame`, in detection order. Region detection
    /// failures give an empty list; a region whose extraction fails or finds
    /// no face is left out.
    pub fn match_frame(&self, frame: &Frame) -> Vec<MatchResult> {
        let regions = match self.extractor.detect_regions(frame) {
            Ok(regions) => regions,
            Err(e) => {
                log::warn!(
                    "face detection failed on frame {}: {:#}",
                    frame.sequence,
                    e
                );
                return Vec::new();
            }
        };
        if regions.is_empty() {
            return Vec::new();
        }

        let gallery = self.gallery();
        let mut results = Vec::with_capacity(regions.len());
        for region in regions {
            match self.extractor.extract(frame, &region) {
                Ok(Some(features)) => {
                    results.push(Self::decide(&gallery, region, &features, self.threshold))
                }
                Ok(None) => log::debug!("no usable face in region {:?}", region),
                Err(e) => log::warn!("feature extraction failed for {:?}: {:#}", region, e),
            }
        }
        results
    }

    /// Match a single descriptor against the current snapshot.
    pub fn match_vector(&self, region: FaceRegion, features: &FeatureVector) -> MatchResult {
        Self::decide(&self.gallery(), region, features, self.threshold)
    }

    fn decide(
        gallery: &Gallery,
        region: FaceRegion,
        features: &FeatureVector,
        threshold: f64,
    ) -> MatchResult {
        match gallery.nearest(features) {
            Some((entry, distance)) if distance < threshold => MatchResult {
                region,
                identity_id: Some(entry.id),
                name: entry.name.clone(),
                distance,
            },
            Some((_, distance)) => MatchResult {
                region,
                identity_id: None,
                name: UNKNOWN_NAME.to_string(),
                distance,
            },
            None => MatchResult {
                region,
                identity_id: None,
                name: UNKNOWN_NAME.to_string(),
                distance: f64::INFINITY,
            },
        }
    }
}

fn warn_on_mixed_lengths(gallery: &Gallery) {
    let mut lengths: Vec<usize> = gallery.entries().iter().map(|e| e.features.len()).collect();
    lengths.sort_unstable();
    lengths.dedup();
    if lengths.len() > 1 {
        log::warn!(
            "gallery holds feature vectors of lengths {:?}; entries are only compared with probes of the same length",
            lengths
        );
    }
}
