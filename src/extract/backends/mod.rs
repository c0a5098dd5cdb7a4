pub mod stub;
pub mod zernike;

pub use stub::{StubExtractor, StubFace};
pub use zernike::{ZernikeExtractor, ZernikeSettings};
