use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::{anyhow, Result};

use crate::extract::backend::FeatureExtractor;
use crate::extract::FeatureVector;
use crate::frame::{FaceRegion, Frame};

/// One scripted face: where it is and what it extracts to.
#[derive(Clone, Debug)]
pub struct StubFace {
    pub region: FaceRegion,
    /// `None` simulates "no usable face in this region".
    pub vector: Option<FeatureVector>,
}

impl StubFace {
    pub fn new(region: FaceRegion, vector: Option<FeatureVector>) -> Self {
        Self { region, vector }
    }
}

#[derive(Default)]
struct StubScript {
    queued: VecDeque<Vec<StubFace>>,
    steady: Vec<StubFace>,
    current: Vec<StubFace>,
}

/// Scripted extractor for tests.
///
/// Each `detect_regions` call consumes the next queued face list, or falls
/// back to the steady list once the queue is empty. Scripts are shared, so use
/// one stub per camera when the order matters.
#[derive(Default)]
pub struct StubExtractor {
    script: Mutex<StubScript>,
}

impl StubExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every frame shows the same faces.
    pub fn with_faces(faces: Vec<StubFace>) -> Self {
        Self {
            script: Mutex::new(StubScript {
                steady: faces,
                ..StubScript::default()
            }),
        }
    }

    /// Queue the faces for one upcoming frame.
    pub fn push_frame(&self, faces: Vec<StubFace>) -> Result<()> {
        let mut script = self
            .script
            .lock()
            .map_err(|_| anyhow!("stub script lock poisoned"))?;
        script.queued.push_back(faces);
        Ok(())
    }

    /// Replace the steady face list.
    pub fn set_faces(&self, faces: Vec<StubFace>) -> Result<()> {
        let mut script = self
            .script
            .lock()
            .map_err(|_| anyhow!("stub script lock poisoned"))?;
        script.steady = faces;
        Ok(())
    }
}

impl FeatureExtractor for StubExtractor {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect_regions(&self, _frame: &Frame) -> Result<Vec<FaceRegion>> {
        let mut script = self
            .script
            .lock()
            .map_err(|_| anyhow!("stub script lock poisoned"))?;
        let faces = match script.queued.pop_front() {
            Some(faces) => faces,
            None => script.steady.clone(),
        };
        let regions = faces.iter().map(|face| face.region).collect();
        script.current = faces;
        Ok(regions)
    }

    fn extract(&self, _frame: &Frame, region: &FaceRegion) -> Result<Option<FeatureVector>> {
        let script = self
            .script
            .lock()
            .map_err(|_| anyhow!("stub script lock poisoned"))?;
        Ok(script
            .current
            .iter()
            .find(|face| face.region == *region)
            .and_then(|face| face.vector.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: u32, value: f32) -> Result<StubFace> {
        Ok(StubFace::new(
            FaceRegion::new(x, 0, 10, 10),
            Some(FeatureVector::new(vec![value])?),
        ))
    }

    #[test]
    fn queued_frames_come_before_steady_faces() -> Result<()> {
        let stub = StubExtractor::with_faces(vec![face(0, 1.0)?]);
        stub.push_frame(vec![face(20, 2.0)?, face(40, 3.0)?])?;
        let frame = Frame::filled(64, 16, 0, 1);

        let regions = stub.detect_regions(&frame)?;
        assert_eq!(regions.len(), 2);
        let v = stub.extract(&frame, &regions[1])?.expect("scripted vector");
        assert_eq!(v.as_slice(), &[3.0]);

        let regions = stub.detect_regions(&frame)?;
        assert_eq!(regions, vec![FaceRegion::new(0, 0, 10, 10)]);
        Ok(())
    }

    #[test]
    fn unknown_region_extracts_nothing() -> Result<()> {
        let stub = StubExtractor::with_faces(vec![face(0, 1.0)?]);
        let frame = Frame::filled(16, 16, 0, 1);
        stub.detect_regions(&frame)?;
        assert!(stub
            .extract(&frame, &FaceRegion::new(5, 5, 1, 1))?
            .is_none());
        Ok(())
    }
}
