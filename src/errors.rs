use std::{fmt, io, path::PathBuf};

/**
 * Camera collaborator failures. Opaque to the scheduler: any of these ends
 * the current run.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CameraError {
    /** Device could not be opened or configured */
    Open(String),
    /** A frame could not be taken or stored */
    Capture(String),
    /** The device returned something that is not a JPEG */
    MalformedFrame(String),
    /** The worker thread went away before reporting the open result */
    WorkerGone,
}

/** Cancellable task failures */
#[derive(Debug)]
pub(crate) enum TaskError {
    /** start() called while a worker is still alive */
    AlreadyRunning(&'static str),
    /** The OS refused to create the worker thread */
    Spawn(io::Error),
}

/** Why a capture run could not be started */
#[derive(Debug)]
pub(crate) enum StartError {
    Camera(CameraError),
    Task(TaskError),
}

/** Configuration loading failures */
#[derive(Debug)]
pub(crate) enum ConfigError {
    Read { path: PathBuf, source: io::Error },
    Parse { path: PathBuf, message: String },
    Invalid { key: &'static str, message: String },
}

/** Top level error, returned from main */
#[derive(Debug)]
pub(crate) enum AppError {
    Config(ConfigError),
    Gpio(rppal::gpio::Error),
    Signal(ctrlc::Error),
}

impl fmt::Display for CameraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraError::Open(msg) => write!(f, "camera open failed: {}", msg),
            CameraError::Capture(msg) => write!(f, "capture failed: {}", msg),
            CameraError::MalformedFrame(msg) => write!(f, "malformed frame: {}", msg),
            CameraError::WorkerGone => write!(f, "capture worker exited unexpectedly"),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::AlreadyRunning(name) => write!(f, "task '{}' is already running", name),
            TaskError::Spawn(e) => write!(f, "could not spawn worker thread: {}", e),
        }
    }
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartError::Camera(e) => write!(f, "{}", e),
            StartError::Task(e) => write!(f, "{}", e),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "could not read {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, message } => {
                write!(f, "could not parse {} as JSON: {}", path.display(), message)
            }
            ConfigError::Invalid { key, message } => {
                write!(f, "invalid value for '{}': {}", key, message)
            }
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(e) => write!(f, "Configuration error: {}", e),
            AppError::Gpio(e) => write!(f, "GPIO error: {}", e),
            AppError::Signal(e) => write!(f, "Signal handler error: {}", e),
        }
    }
}

impl std::error::Error for CameraError {}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TaskError::Spawn(e) => Some(e),
            TaskError::AlreadyRunning(_) => None,
        }
    }
}

impl std::error::Error for StartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartError::Camera(e) => Some(e),
            StartError::Task(e) => Some(e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Config(e) => Some(e),
            AppError::Gpio(e) => Some(e),
            AppError::Signal(e) => Some(e),
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::Config(err)
    }
}

impl From<rppal::gpio::Error> for AppError {
    fn from(err: rppal::gpio::Error) -> Self {
        AppError::Gpio(err)
    }
}

impl From<ctrlc::Error> for AppError {
    fn from(err: ctrlc::Error) -> Self {
        AppError::Signal(err)
    }
}

impl From<rscam::Error> for CameraError {
    fn from(err: rscam::Error) -> Self {
        CameraError::Open(err.to_string())
    }
}
