//! RTSP/HTTP frame source (feature: rtsp-gstreamer).
//!
//! This module provides `RtspSource` for ingesting frames from IP cameras.
//! The pipeline keeps at most one decoded buffer and drops older ones, which
//! matches the capture manager's latest-frame-wins model.

use anyhow::{anyhow, Context, Result};
use std::time::{Duration, Instant};

use super::FrameSource;
use crate::frame::Frame;

/// Configuration for an RTSP source.
#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// Stream URL (e.g., "rtsp://192.168.1.100:554/stream")
    pub url: String,
    /// Expected frame rate, used to size the pull timeout.
    pub target_fps: u32,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: "rtsp://localhost:554/stream".to_string(),
            target_fps: 25,
        }
    }
}

/// GStreamer-backed stream source.
pub struct RtspSource {
    config: RtspConfig,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_count: u64,
    connected_at: Instant,
}

impl RtspSource {
    /// Build the decode pipeline and set it playing.
    ///
    /// `rtspsrc`/`souphttpsrc` ! decodebin ! videoconvert ! RGB appsink
    pub fn open(config: RtspConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let src = if config.url.starts_with("http") {
            format!("souphttpsrc location={} is-live=true", config.url)
        } else {
            format!("rtspsrc location={} latency=0", config.url)
        };
        let pipeline_description = format!(
            "{} ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            src
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build stream pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("stream pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        pipeline
            .set_state(gstreamer::State::Playing)
            .with_context(|| format!("start stream {}", config.url))?;
        log::info!("RtspSource: connected to {}", config.url);

        Ok(Self {
            config,
            pipeline,
            appsink,
            frame_count: 0,
            connected_at: Instant::now(),
        })
    }

    fn frame_timeout(&self) -> Duration {
        let base_ms = if self.config.target_fps == 0 {
            500
        } else {
            (1000 / self.config.target_fps).saturating_mul(4)
        };
        Duration::from_millis(base_ms.max(500) as u64)
    }

    fn check_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(anyhow!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => return Err(anyhow!("stream reached EOS")),
                _ => {}
            }
        }
        Ok(())
    }
}

impl FrameSource for RtspSource {
    fn read_frame(&mut self) -> Result<Frame> {
        self.check_bus()?;

        let timeout = self.frame_timeout();
        let sample = self
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64))
            .ok_or_else(|| anyhow!("stream stalled"))?;

        let (pixels, width, height) = sample_to_pixels(&sample)?;
        self.frame_count += 1;
        Frame::from_rgb(pixels, width, height, self.frame_count)
    }

    fn release(&mut self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("RtspSource: failed to stop {}: {}", self.config.url, err);
        }
        log::info!(
            "RtspSource: released {} after {} frames ({}s)",
            self.config.url,
            self.frame_count,
            self.connected_at.elapsed().as_secs()
        );
    }

    fn describe(&self) -> String {
        self.config.url.clone()
    }
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("stream sample missing buffer")?;
    let caps = sample.caps().context("stream sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse stream caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map stream buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data[..row_bytes * height as usize].to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("stream buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
