use std::{fs, path::PathBuf};

use chrono::{DateTime, Local};
use rscam::{
    Camera as V4l2Device, Config, CID_AUTO_WHITE_BALANCE, CID_BRIGHTNESS, CID_CONTRAST,
    CID_EXPOSURE_ABSOLUTE, CID_EXPOSURE_AUTO, CID_GAIN, CID_GAMMA, CID_HUE, CID_SATURATION,
    CID_SHARPNESS, CID_WHITE_BALANCE_TEMPERATURE, FIELD_NONE,
};
use tracing::{debug, info, warn};

use crate::{
    capture_controller::{Camera, CameraSession},
    common::CaptureId,
    errors::CameraError,
    user_config::CameraSettings,
};

/**
 * Number of V4L2 buffers. While the camera sits idle between captures the
 * driver fills all of them and then drops new frames, so this many stale
 * frames have to be skipped before a fresh one comes out.
 */
const NBUFFERS: u32 = 2;

/**
 * A UVC camera that streams MJPEG. Each capture writes one JPEG into a
 * per-run directory under the configured output dir.
 */
pub(crate) struct V4l2Camera {
    settings: CameraSettings,
}

struct V4l2Session {
    device: V4l2Device,
    run_dir: PathBuf,
    sequence: u32,
}

impl V4l2Camera {
    pub(crate) fn new(settings: CameraSettings) -> Self {
        Self { settings }
    }
}

impl Camera for V4l2Camera {
    fn open(&self) -> Result<Box<dyn CameraSession>, CameraError> {
        let mut device = V4l2Device::new(&self.settings.device_path)
            .map_err(|e| CameraError::Open(format!("{}: {}", self.settings.device_path, e)))?;

        _apply_controls(&mut device, &self.settings.controls);

        let config = Config {
            interval: (1, 30),
            resolution: self.settings.resolution,
            format: b"MJPG",
            field: FIELD_NONE,
            nbuffers: NBUFFERS,
        };
        device.start(&config)?;

        // Only once streaming, so a failed start leaves nothing on disk.
        let run_dir = self.settings.output_dir.join(run_dir_name(&Local::now()));
        if let Err(e) = fs::create_dir_all(&run_dir) {
            if let Err(stop_err) = device.stop() {
                warn!("Failed to stop camera stream: {}", stop_err);
            }
            return Err(CameraError::Open(format!("{}: {}", run_dir.display(), e)));
        }

        info!(
            "Opened {} at {}x{}, writing to {}",
            self.settings.device_path,
            self.settings.resolution.0,
            self.settings.resolution.1,
            run_dir.display()
        );
        Ok(Box::new(V4l2Session {
            device,
            run_dir,
            sequence: 0,
        }))
    }
}

impl CameraSession for V4l2Session {
    fn capture(&mut self) -> Result<CaptureId, CameraError> {
        for _ in 0..NBUFFERS {
            // Dropping the frame hands the buffer back to the driver.
            self.device
                .capture()
                .map_err(|e| CameraError::Capture(e.to_string()))?;
        }
        let frame = self
            .device
            .capture()
            .map_err(|e| CameraError::Capture(e.to_string()))?;

        // Camera occasionally sends a malformed jpeg. Don't store it.
        let header = turbojpeg::read_header(&frame[..])
            .map_err(|e| CameraError::MalformedFrame(e.to_string()))?;

        self.sequence += 1;
        let path = self.run_dir.join(frame_file_name(self.sequence));
        fs::write(&path, &frame[..])
            .map_err(|e| CameraError::Capture(format!("{}: {}", path.display(), e)))?;

        debug!(
            "Wrote {} ({}x{}, {} bytes)",
            path.display(),
            header.width,
            header.height,
            frame.len()
        );
        Ok(CaptureId(self.sequence))
    }

    fn close(mut self: Box<Self>) {
        if let Err(e) = self.device.stop() {
            warn!("Failed to stop camera stream: {}", e);
        }
        info!(
            "Closed camera after {} frames in {}",
            self.sequence,
            self.run_dir.display()
        );
    }
}

/**
 * Maps a configuration key to its V4L2 control id.
 */
pub(crate) fn control_id(name: &str) -> Option<u32> {
    match name {
        "brightness" => Some(CID_BRIGHTNESS),
        "contrast" => Some(CID_CONTRAST),
        "saturation" => Some(CID_SATURATION),
        "hue" => Some(CID_HUE),
        "gamma" => Some(CID_GAMMA),
        "gain" => Some(CID_GAIN),
        "sharpness" => Some(CID_SHARPNESS),
        "auto_white_balance" => Some(CID_AUTO_WHITE_BALANCE),
        "white_balance_temperature" => Some(CID_WHITE_BALANCE_TEMPERATURE),
        "exposure_auto" => Some(CID_EXPOSURE_AUTO),
        "exposure_absolute" => Some(CID_EXPOSURE_ABSOLUTE),
        _ => None,
    }
}

/**
 * Applies controls in configuration order. Order matters: auto modes have
 * to be switched off before the manual value they guard is accepted.
 */
fn _apply_controls(device: &mut V4l2Device, controls: &[(String, i32)]) {
    for (name, value) in controls {
        let Some(id) = control_id(name) else {
            warn!("Unknown camera control '{}', skipping", name);
            continue;
        };
        match device.set_control(id, value) {
            Ok(()) => debug!("Set camera control {} = {}", name, value),
            Err(e) => warn!("Could not set camera control {} = {}: {}", name, value, e),
        }
    }
}

pub(crate) fn run_dir_name(started: &DateTime<Local>) -> String {
    started.format("run_%Y%m%d_%H%M%S").to_string()
}

pub(crate) fn frame_file_name(sequence: u32) -> String {
    format!("frame_{:05}.jpg", sequence)
}
