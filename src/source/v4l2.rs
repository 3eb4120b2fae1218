//! V4L2 capture device.
//!
//! Opens a local device node, locks its format and frame rate, and streams
//! frames through memory-mapped buffers. Any format or rate the driver refuses
//! is a setup error: the camera never runs with settings other than the ones
//! configured.

use anyhow::Context;
use ouroboros::self_referencing;

use crate::error::SetupError;
use crate::frame::RawFrame;

use super::{CaptureDevice, CaptureSettings};

const STREAM_BUFFERS: u32 = 4;

pub struct V4l2Camera {
    path: String,
    settings: Option<CaptureSettings>,
    state: Option<V4l2State>,
    frame_count: u64,
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Camera {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            settings: None,
            state: None,
            frame_count: 0,
        }
    }

    fn config_error(&self, reason: impl Into<String>) -> SetupError {
        SetupError::DeviceConfiguration {
            device: self.path.clone(),
            reason: reason.into(),
        }
    }
}

impl CaptureDevice for V4l2Camera {
    fn configure(&mut self, settings: &CaptureSettings) -> Result<(), SetupError> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        // Release any previous stream before reopening.
        self.state = None;

        let mut device = v4l::Device::with_path(&self.path)
            .map_err(|err| self.config_error(format!("open failed: {}", err)))?;
        let mut format = device
            .format()
            .map_err(|err| self.config_error(format!("read format: {}", err)))?;
        format.width = settings.width;
        format.height = settings.height;
        format.fourcc = v4l::FourCC::new(&settings.format.fourcc());

        let applied = device
            .set_format(&format)
            .map_err(|err| self.config_error(format!("set format: {}", err)))?;
        if applied.fourcc != format.fourcc
            || applied.width != settings.width
            || applied.height != settings.height
        {
            return Err(self.config_error(format!(
                "driver selected {} {}x{}, requested {:?} {}x{}",
                applied.fourcc, applied.width, applied.height, settings.format, settings.width,
                settings.height
            )));
        }

        let params = v4l::video::capture::Parameters::with_fps(settings.fps);
        device
            .set_params(&params)
            .map_err(|err| self.config_error(format!("lock frame rate: {}", err)))?;

        let state = V4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, STREAM_BUFFERS)
            },
        }
        .try_build()
        .map_err(|err| self.config_error(format!("create buffer stream: {}", err)))?;

        self.state = Some(state);
        self.settings = Some(settings.clone());
        log::info!(
            "V4l2Camera: configured {} ({}x{} {:?} @ {} fps)",
            self.path,
            settings.width,
            settings.height,
            settings.format,
            settings.fps
        );
        Ok(())
    }

    fn next_frame(&mut self) -> anyhow::Result<RawFrame> {
        use v4l::io::traits::CaptureStream;

        let settings = self.settings.as_ref().context("v4l2 device not configured")?;
        let state = self.state.as_mut().context("v4l2 device not configured")?;
        let data = state.with_mut(|fields| {
            fields
                .stream
                .next()
                .map(|(buf, meta)| buf[..(meta.bytesused as usize).min(buf.len())].to_vec())
        });
        let data = data.context("capture v4l2 frame")?;

        self.frame_count += 1;
        Ok(RawFrame::new(
            data,
            settings.width,
            settings.height,
            settings.format,
            settings.orientation,
            self.frame_count,
        ))
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}
