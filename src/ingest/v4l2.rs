//! V4L2 frame source (feature: ingest-v4l2).
//!
//! This module provides `V4l2Source` for USB cameras exposed as local device
//! nodes (e.g., /dev/video0). The device is asked for RGB3; if it refuses, the
//! negotiated format is used and frames of the wrong size are rejected.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::FrameSource;
use crate::frame::Frame;

/// Configuration for a V4L2 source.
#[derive(Clone, Debug)]
pub struct V4l2Config {
    /// Device path (e.g., "/dev/video0")
    pub device: String,
    pub target_fps: u32,
    /// Preferred frame width.
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            target_fps: 30,
            width: 640,
            height: 480,
        }
    }
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

/// USB camera source backed by libv4l memory-mapped streaming.
pub struct V4l2Source {
    config: V4l2Config,
    state: Option<DeviceState>,
    frame_count: u64,
    active_width: u32,
    active_height: u32,
}

impl V4l2Source {
    pub fn open(config: V4l2Config) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&config.device)
            .with_context(|| format!("open v4l2 device {}", config.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = config.width;
        format.height = config.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set format on {}: {}",
                    config.device,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        if config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Source: failed to set fps on {}: {}",
                    config.device,
                    err
                );
            }
        }

        let state = DeviceStateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "V4l2Source: connected to {} ({}x{})",
            config.device,
            format.width,
            format.height
        );
        Ok(Self {
            active_width: format.width,
            active_height: format.height,
            config,
            state: Some(state),
            frame_count: 0,
        })
    }
}

impl FrameSource for V4l2Source {
    fn read_frame(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        let state = self
            .state
            .as_mut()
            .ok_or_else(|| anyhow!("v4l2 device {} released", self.config.device))?;
        let pixels = state
            .with_mut(|fields| fields.stream.next().map(|(buf, _meta)| buf.to_vec()))
            .with_context(|| format!("capture v4l2 frame from {}", self.config.device))?;

        self.frame_count += 1;
        Frame::from_rgb(
            pixels,
            self.active_width,
            self.active_height,
            self.frame_count,
        )
    }

    fn release(&mut self) {
        // Dropping the state stops streaming and closes the device node.
        self.state = None;
        log::info!(
            "V4l2Source: released {} after {} frames",
            self.config.device,
            self.frame_count
        );
    }

    fn describe(&self) -> String {
        self.config.device.clone()
    }
}
