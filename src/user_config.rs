use std::{
    fs::read_to_string,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use json::JsonValue;
use tracing::{info, warn};

use crate::{
    common::{CaptureConfig, MAX_FRAMES, MAX_SECONDS},
    errors::ConfigError,
};

const CONFIG_FILE: &str = "timelapse.json";
/** Highest BCM GPIO number on the 40-pin header. */
const MAX_BCM_PIN: u64 = 27;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EncoderPins {
    pub(crate) a: u8,
    pub(crate) b: u8,
    pub(crate) button: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LcdPins {
    pub(crate) rs: u8,
    pub(crate) en: u8,
    pub(crate) d4: u8,
    pub(crate) d5: u8,
    pub(crate) d6: u8,
    pub(crate) d7: u8,
    pub(crate) backlight: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CameraSettings {
    pub(crate) device_path: String,
    pub(crate) resolution: (u32, u32), // (width, height)
    pub(crate) output_dir: PathBuf,
    /**
     * V4L2 controls applied when the camera is opened, by name
     * (e.g. "brightness", "exposure_absolute").
     */
    pub(crate) controls: Vec<(String, i32)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BacklightTiming {
    /** Full brightness is held this long after the last activity. */
    pub(crate) idle: Duration,
    /** Time per brightness unit while fading out. */
    pub(crate) fade_step: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UserConfig {
    pub(crate) encoder: EncoderPins,
    pub(crate) lcd: LcdPins,
    pub(crate) camera: CameraSettings,
    pub(crate) capture: CaptureConfig,
    pub(crate) backlight: BacklightTiming,
    /** How often countdowns are redrawn while a run is active. */
    pub(crate) refresh_tick: Duration,
}

///////////////////
// Implementations
///////////////////
impl Default for UserConfig {
    fn default() -> Self {
        Self {
            encoder: EncoderPins {
                a: 5,
                b: 6,
                button: 13,
            },
            lcd: LcdPins {
                rs: 25,
                en: 24,
                d4: 23,
                d5: 22,
                d6: 27,
                d7: 17,
                backlight: 18,
            },
            camera: CameraSettings {
                device_path: String::from("/dev/video0"),
                resolution: (1920, 1080),
                output_dir: PathBuf::from("./captures"),
                controls: Vec::new(),
            },
            capture: CaptureConfig::default(),
            backlight: BacklightTiming {
                idle: Duration::from_secs(15),
                fade_step: Duration::from_millis(20),
            },
            refresh_tick: Duration::from_millis(250),
        }
    }
}

impl UserConfig {
    /**
     * Reads <config_dir>/timelapse.json. A missing file means "all defaults".
     */
    pub(crate) fn read(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        let raw = match read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("{} not found, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        let config = Self::parse(&raw).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.clone(),
                message,
            },
            other => other,
        })?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub(crate) fn parse(raw: &str) -> Result<Self, ConfigError> {
        let root = json::parse(raw).map_err(|e| ConfigError::Parse {
            path: PathBuf::from(CONFIG_FILE),
            message: e.to_string(),
        })?;
        let defaults = Self::default();

        let encoder_json = &root["encoder"];
        let encoder = EncoderPins {
            a: _pin(encoder_json, "a", "encoder.a", defaults.encoder.a)?,
            b: _pin(encoder_json, "b", "encoder.b", defaults.encoder.b)?,
            button: _pin(encoder_json, "button", "encoder.button", defaults.encoder.button)?,
        };

        let lcd_json = &root["lcd"];
        let lcd = LcdPins {
            rs: _pin(lcd_json, "rs", "lcd.rs", defaults.lcd.rs)?,
            en: _pin(lcd_json, "en", "lcd.en", defaults.lcd.en)?,
            d4: _pin(lcd_json, "d4", "lcd.d4", defaults.lcd.d4)?,
            d5: _pin(lcd_json, "d5", "lcd.d5", defaults.lcd.d5)?,
            d6: _pin(lcd_json, "d6", "lcd.d6", defaults.lcd.d6)?,
            d7: _pin(lcd_json, "d7", "lcd.d7", defaults.lcd.d7)?,
            backlight: _pin(lcd_json, "backlight", "lcd.backlight", defaults.lcd.backlight)?,
        };

        let camera = CameraSettings::_from_json(&root["camera"], defaults.camera)?;

        let capture_json = &root["capture"];
        let capture = CaptureConfig {
            interval_seconds: _bounded(
                capture_json,
                "interval",
                "capture.interval",
                defaults.capture.interval_seconds as u64,
                1,
                MAX_SECONDS as u64,
            )? as u32,
            start_delay_seconds: _bounded(
                capture_json,
                "delay",
                "capture.delay",
                defaults.capture.start_delay_seconds as u64,
                0,
                MAX_SECONDS as u64,
            )? as u32,
            frame_count: _bounded(
                capture_json,
                "frames",
                "capture.frames",
                defaults.capture.frame_count as u64,
                0,
                MAX_FRAMES as u64,
            )? as u32,
        };

        let backlight_json = &root["backlight"];
        let backlight = BacklightTiming {
            idle: Duration::from_secs(_bounded(
                backlight_json,
                "idle_seconds",
                "backlight.idle_seconds",
                defaults.backlight.idle.as_secs(),
                1,
                3600,
            )?),
            fade_step: Duration::from_millis(_bounded(
                backlight_json,
                "fade_step_ms",
                "backlight.fade_step_ms",
                defaults.backlight.fade_step.as_millis() as u64,
                1,
                1000,
            )?),
        };

        let refresh_tick = Duration::from_millis(_bounded(
            &root,
            "refresh_ms",
            "refresh_ms",
            defaults.refresh_tick.as_millis() as u64,
            10,
            1000,
        )?);

        Ok(Self {
            encoder,
            lcd,
            camera,
            capture,
            backlight,
            refresh_tick,
        })
    }
}

impl CameraSettings {
    fn _from_json(camera_json: &JsonValue, defaults: CameraSettings) -> Result<Self, ConfigError> {
        let device_path = match &camera_json["device"] {
            JsonValue::Null => defaults.device_path,
            value => value
                .as_str()
                .ok_or_else(|| _invalid("camera.device", "expected a string"))?
                .to_string(),
        };

        let resolution = match &camera_json["resolution"] {
            JsonValue::Null => defaults.resolution,
            value => {
                let parts: Vec<&JsonValue> = value.members().collect();
                if parts.len() != 2 {
                    return Err(_invalid("camera.resolution", "expected [width, height]"));
                }
                match (parts[0].as_u32(), parts[1].as_u32()) {
                    (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
                    _ => return Err(_invalid("camera.resolution", "expected positive integers")),
                }
            }
        };

        let output_dir = match &camera_json["output_dir"] {
            JsonValue::Null => defaults.output_dir,
            value => PathBuf::from(
                value
                    .as_str()
                    .ok_or_else(|| _invalid("camera.output_dir", "expected a string"))?,
            ),
        };

        let mut controls = Vec::new();
        for (name, value) in camera_json["controls"].entries() {
            let value = value
                .as_i32()
                .ok_or_else(|| _invalid("camera.controls", "control values must be integers"))?;
            controls.push((name.to_string(), value));
        }

        Ok(Self {
            device_path,
            resolution,
            output_dir,
            controls,
        })
    }
}

fn _invalid(key: &'static str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        message: message.to_string(),
    }
}

/**
 * Reads an optional unsigned integer and checks it against [min, max].
 */
fn _bounded(
    parent: &JsonValue,
    field: &str,
    key: &'static str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, ConfigError> {
    let value = &parent[field];
    if value.is_null() {
        return Ok(default);
    }
    match value.as_u64() {
        Some(v) if v >= min && v <= max => Ok(v),
        _ => Err(ConfigError::Invalid {
            key,
            message: format!("expected an integer in {}..={}, got {}", min, max, value.dump()),
        }),
    }
}

fn _pin(parent: &JsonValue, field: &str, key: &'static str, default: u8) -> Result<u8, ConfigError> {
    _bounded(parent, field, key, default as u64, 0, MAX_BCM_PIN).map(|pin| pin as u8)
}
