//! Frame ingestion sources.
//!
//! This module provides different sources for camera frames:
//! - Synthetic scenes (`stub://`), for tests and demos
//! - RTSP/HTTP streams from IP cameras (feature: rtsp-gstreamer)
//! - USB/V4L2 devices (feature: ingest-v4l2)
//!
//! A `SourceFactory` turns a camera's source URI into an open `FrameSource`.
//! The capture manager opens sources on the caller's thread and then moves the
//! source into the session's acquisition thread, which is its only user.

use anyhow::{anyhow, Result};

use crate::frame::Frame;

#[cfg(feature = "rtsp-gstreamer")]
pub mod rtsp;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

#[cfg(feature = "rtsp-gstreamer")]
pub use rtsp::{RtspConfig, RtspSource};
pub use synthetic::{SyntheticConfig, SyntheticSource};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::{V4l2Config, V4l2Source};

/// An open camera stream.
pub trait FrameSource: Send {
    /// Block until the next frame is available or the read fails.
    fn read_frame(&mut self) -> Result<Frame>;

    /// Release the underlying device or stream. Called once, from the
    /// acquisition thread, before the source is dropped.
    fn release(&mut self) {}

    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}

/// Opens frame sources from camera URIs.
pub trait SourceFactory: Send + Sync {
    fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>>;
}

/// Default factory: routes by URI scheme to the compiled-in sources.
#[derive(Clone, Debug, Default)]
pub struct UriSourceFactory;

impl UriSourceFactory {
    pub fn new() -> Self {
        Self
    }
}

impl SourceFactory for UriSourceFactory {
    fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(anyhow!("camera source URI is empty"));
        }
        if uri.starts_with("stub://") {
            let config = SyntheticConfig::from_uri(uri)?;
            return Ok(Box::new(SyntheticSource::open(config)?));
        }
        if is_stream_uri(uri) {
            #[cfg(feature = "rtsp-gstreamer")]
            {
                let source = RtspSource::open(RtspConfig {
                    url: uri.to_string(),
                    ..RtspConfig::default()
                })?;
                return Ok(Box::new(source));
            }
            #[cfg(not(feature = "rtsp-gstreamer"))]
            {
                return Err(anyhow!(
                    "stream source {} requires the rtsp-gstreamer feature",
                    uri
                ));
            }
        }
        if let Some(device) = usb_device_path(uri) {
            #[cfg(feature = "ingest-v4l2")]
            {
                let source = V4l2Source::open(V4l2Config {
                    device,
                    ..V4l2Config::default()
                })?;
                return Ok(Box::new(source));
            }
            #[cfg(not(feature = "ingest-v4l2"))]
            {
                return Err(anyhow!(
                    "USB device {} requires the ingest-v4l2 feature",
                    device
                ));
            }
        }
        Err(anyhow!("unsupported camera source URI: {}", uri))
    }
}

fn is_stream_uri(uri: &str) -> bool {
    ["rtsp://", "rtsps://", "http://", "https://"]
        .iter()
        .any(|scheme| uri.starts_with(scheme))
}

/// `/dev/videoN`, `usb:N` or a bare device index.
fn usb_device_path(uri: &str) -> Option<String> {
    if uri.starts_with("/dev/video") {
        return Some(uri.to_string());
    }
    let index = uri.strip_prefix("usb:").unwrap_or(uri);
    index
        .parse::<u32>()
        .ok()
        .map(|index| format!("/dev/video{}", index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usb_paths_are_normalized() {
        assert_eq!(usb_device_path("usb:2").as_deref(), Some("/dev/video2"));
        assert_eq!(usb_device_path("0").as_deref(), Some("/dev/video0"));
        assert_eq!(
            usb_device_path("/dev/video1").as_deref(),
            Some("/dev/video1")
        );
        assert_eq!(usb_device_path("rtsp://cam"), None);
    }

    #[test]
    fn factory_opens_stub_sources() -> Result<()> {
        let factory = UriSourceFactory::new();
        let mut source = factory.open("stub://lobby?faces=1&fps=0")?;
        let frame = source.read_frame()?;
        assert_eq!(frame.sequence, 1);
        Ok(())
    }

    #[test]
    fn factory_rejects_unknown_schemes() {
        let factory = UriSourceFactory::new();
        assert!(factory.open("ftp://camera").is_err());
        assert!(factory.open("   ").is_err());
    }
}
