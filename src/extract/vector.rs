use anyhow::{anyhow, Result};

/// Upper bound on stored vector length. Anything larger is treated as a
/// corrupt blob rather than allocated.
pub const MAX_FEATURE_LEN: usize = 4096;

/// Fixed-length face descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureVector {
    values: Vec<f32>,
}

impl FeatureVector {
    /// Build a vector. Empty vectors and non-finite components are rejected.
    pub fn new(values: Vec<f32>) -> Result<Self> {
        if values.is_empty() {
            return Err(anyhow!("feature vector is empty"));
        }
        if values.len() > MAX_FEATURE_LEN {
            return Err(anyhow!(
                "feature vector length {} exceeds {}",
                values.len(),
                MAX_FEATURE_LEN
            ));
        }
        if let Some(pos) = values.iter().position(|v| !v.is_finite()) {
            return Err(anyhow!("feature vector component {} is not finite", pos));
        }
        Ok(Self { values })
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance, accumulated in f64. `None` when the lengths differ.
    pub fn distance(&self, other: &FeatureVector) -> Option<f64> {
        if self.values.len() != other.values.len() {
            return None;
        }
        let sum: f64 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| {
                let d = *a as f64 - *b as f64;
                d * d
            })
            .sum();
        Some(sum.sqrt())
    }

    /// Storage encoding: u32 LE component count, then each component as f32 LE.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.values.len() * 4);
        out.extend_from_slice(&(self.values.len() as u32).to_le_bytes());
        for v in &self.values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header: [u8; 4] = bytes
            .get(..4)
            .and_then(|h| h.try_into().ok())
            .ok_or_else(|| anyhow!("feature blob too short for length prefix"))?;
        let len = u32::from_le_bytes(header) as usize;
        if len > MAX_FEATURE_LEN {
            return Err(anyhow!("feature blob declares {} components", len));
        }
        let body = &bytes[4..];
        if body.len() != len * 4 {
            return Err(anyhow!(
                "feature blob length mismatch: {} components need {} bytes, got {}",
                len,
                len * 4,
                body.len()
            ));
        }
        let values = body
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::new(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn rejects_empty_and_non_finite() {
        assert!(FeatureVector::new(vec![]).is_err());
        assert!(FeatureVector::new(vec![1.0, f32::NAN]).is_err());
        assert!(FeatureVector::new(vec![1.0, f32::INFINITY]).is_err());
    }

    #[test]
    fn distance_is_euclidean() -> Result<()> {
        let a = FeatureVector::new(vec![0.0, 0.0])?;
        let b = FeatureVector::new(vec![3.0, 4.0])?;
        assert_relative_eq!(a.distance(&b).unwrap_or(f64::NAN), 5.0, epsilon = 1e-12);
        assert_eq!(a.distance(&a), Some(0.0));
        Ok(())
    }

    #[test]
    fn distance_undefined_for_length_mismatch() -> Result<()> {
        let a = FeatureVector::new(vec![0.0, 0.0])?;
        let b = FeatureVector::new(vec![0.0, 0.0, 0.0])?;
        assert_eq!(a.distance(&b), None);
        Ok(())
    }

    #[test]
    fn blob_encoding_is_length_prefixed_le() -> Result<()> {
        let v = FeatureVector::new(vec![1.0, -0.5])?;
        let bytes = v.to_bytes();
        assert_eq!(&bytes[..4], &2u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &1.0f32.to_le_bytes());
        assert_eq!(bytes.len(), 12);
        assert_eq!(FeatureVector::from_bytes(&bytes)?, v);
        Ok(())
    }

    #[test]
    fn truncated_or_oversized_blobs_are_rejected() {
        assert!(FeatureVector::from_bytes(&[1, 0]).is_err());
        let mut truncated = 3u32.to_le_bytes().to_vec();
        truncated.extend_from_slice(&1.0f32.to_le_bytes());
        assert!(FeatureVector::from_bytes(&truncated).is_err());
        let huge = (MAX_FEATURE_LEN as u32 + 1).to_le_bytes();
        assert!(FeatureVector::from_bytes(&huge).is_err());
    }
}
