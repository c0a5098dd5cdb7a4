mod backend;
mod backends;
mod registry;
mod vector;

pub use backend::{largest_region, FeatureExtractor};
pub use backends::{StubExtractor, StubFace, ZernikeExtractor, ZernikeSettings};
pub use registry::ExtractorRegistry;
pub use vector::{FeatureVector, MAX_FEATURE_LEN};
