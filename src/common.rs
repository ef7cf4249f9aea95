use std::time::Duration;

use crate::errors::CameraError;

/**
 * Operator input, as delivered through the mailbox. An empty mailbox slot
 * stands for "no event".
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    /** Encoder rotated by the given number of detents (signed). */
    Pulse(i32),
    /** Encoder button pressed. */
    Button,
    /** A capture run ended on its own. Carries the run id. */
    RunFinished(u32),
}

/**
 * Capture parameters as the operator edits them, in whole seconds.
 * frame_count == 0 means "run until cancelled".
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CaptureConfig {
    pub(crate) interval_seconds: u32,
    pub(crate) start_delay_seconds: u32,
    pub(crate) frame_count: u32,
}

/**
 * Snapshot handed to the capture worker at start time. The worker never sees
 * later edits to the CaptureConfig it came from.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Schedule {
    pub(crate) interval: Duration,
    pub(crate) start_delay: Duration,
    pub(crate) frame_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CaptureId(pub(crate) u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RunEnd {
    /** Frame quota reached. */
    Completed,
    /** Stopped by the operator (or teardown). */
    Cancelled,
    /** The camera failed mid-run. */
    Failed(CameraError),
}

/**
 * Left behind by a finished capture worker for the dispatcher to pick up.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RunReport {
    pub(crate) run_id: u32,
    pub(crate) captured: u32,
    pub(crate) end: RunEnd,
}

pub(crate) const MAX_SECONDS: u32 = 99 * 3600 + 59 * 60 + 59;
pub(crate) const MAX_FRAMES: u32 = 99_999;

///////////////////
// Implementations
///////////////////
impl CaptureConfig {
    pub(crate) fn schedule(&self) -> Schedule {
        Schedule {
            // An interval of zero would capture in a busy loop.
            interval: Duration::from_secs(self.interval_seconds.max(1) as u64),
            start_delay: Duration::from_secs(self.start_delay_seconds as u64),
            frame_count: self.frame_count,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 10,
            start_delay_seconds: 0,
            frame_count: 5,
        }
    }
}

impl Schedule {
    pub(crate) fn is_unbounded(&self) -> bool {
        self.frame_count == 0
    }

    pub(crate) fn quota_reached(&self, captured: u32) -> bool {
        !self.is_unbounded() && captured >= self.frame_count
    }
}

/**
 * Formats a second count as HH:MM:SS.
 */
pub(crate) fn format_hms(total_seconds: u64) -> String {
    let h = total_seconds / 3600;
    let m = (total_seconds / 60) % 60;
    let s = total_seconds % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}
