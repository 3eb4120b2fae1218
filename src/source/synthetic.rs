use crate::error::SetupError;
use crate::frame::RawFrame;

use super::{CaptureDevice, CaptureSettings};

/// Synthetic camera for `stub://` devices.
///
/// Produces a static pattern that changes scene every 50 frames, in whatever
/// pixel format the settings ask for.
pub struct SyntheticCamera {
    name: String,
    settings: Option<CaptureSettings>,
    frame_count: u64,
    scene_state: u8,
}

impl SyntheticCamera {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: None,
            frame_count: 0,
            scene_state: 0,
        }
    }

    fn generate_pixels(&mut self, len: usize) -> Vec<u8> {
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let scene = self.scene_state as usize * 37;
        (0..len).map(|i| ((i + scene) % 256) as u8).collect()
    }
}

impl CaptureDevice for SyntheticCamera {
    fn configure(&mut self, settings: &CaptureSettings) -> Result<(), SetupError> {
        if settings.fps == 0 {
            return Err(SetupError::DeviceConfiguration {
                device: self.name.clone(),
                reason: "frame rate must be at least 1 fps".to_string(),
            });
        }
        if settings.format.frame_len(settings.width, settings.height).unwrap_or(0) == 0 {
            return Err(SetupError::DeviceConfiguration {
                device: self.name.clone(),
                reason: format!(
                    "unsupported frame size {}x{} for {:?}",
                    settings.width, settings.height, settings.format
                ),
            });
        }
        log::info!(
            "SyntheticCamera: configured {} ({}x{} {:?} @ {} fps)",
            self.name,
            settings.width,
            settings.height,
            settings.format,
            settings.fps
        );
        self.settings = Some(settings.clone());
        Ok(())
    }

    fn next_frame(&mut self) -> anyhow::Result<RawFrame> {
        let settings = self
            .settings
            .clone()
            .ok_or_else(|| anyhow::anyhow!("synthetic camera not configured"))?;
        self.frame_count += 1;
        let len = settings
            .format
            .frame_len(settings.width, settings.height)
            .unwrap_or(0);
        let pixels = self.generate_pixels(len);
        Ok(RawFrame::new(
            pixels,
            settings.width,
            settings.height,
            settings.format,
            settings.orientation,
            self.frame_count,
        ))
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}
