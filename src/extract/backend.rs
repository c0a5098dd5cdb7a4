use anyhow::Result;

use crate::frame::{FaceRegion, Frame};

use super::FeatureVector;

/// Face feature extraction backend.
///
/// Extraction is a two-step capability: find candidate face regions in a
/// frame, then turn each region into a fixed-length descriptor. Backends are
/// shared between every camera's pipeline thread, so both steps take `&self`
/// and must not keep per-frame state that another camera could observe.
pub trait FeatureExtractor: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Candidate face regions, in a stable detection order.
    fn detect_regions(&self, frame: &Frame) -> Result<Vec<FaceRegion>>;

    /// Descriptor for one region. `Ok(None)` means no usable face was found
    /// in the region; that is an ordinary outcome, not an error.
    fn extract(&self, frame: &Frame, region: &FaceRegion) -> Result<Option<FeatureVector>>;

    /// Descriptor of the largest detected face, for enrolment from a still.
    fn extract_largest(&self, frame: &Frame) -> Result<Option<FeatureVector>> {
        let regions = self.detect_regions(frame)?;
        match largest_region(&regions) {
            Some(region) => self.extract(frame, &region),
            None => Ok(None),
        }
    }

    /// Optional warm-up hook.
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}

/// Largest region by area; the first one wins a tie.
pub fn largest_region(regions: &[FaceRegion]) -> Option<FaceRegion> {
    regions.iter().fold(None, |best: Option<FaceRegion>, region| match best {
        Some(b) if b.area() >= region.area() => Some(b),
        _ => Some(*region),
    })
}
