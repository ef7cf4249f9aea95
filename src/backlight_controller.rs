use tracing::debug;

use crate::{
    cancellable_task::{CancellableTask, Worker},
    display::{SharedDisplay, MAX_BRIGHTNESS},
    errors::TaskError,
    user_config::BacklightTiming,
};

/**
 * Keeps the backlight on while the operator is active and fades it out
 * after a quiet period.
 */
pub(crate) struct BacklightFade {
    task: CancellableTask,
    display: SharedDisplay,
    timing: BacklightTiming,
}

impl BacklightFade {
    pub(crate) fn new(display: SharedDisplay, timing: BacklightTiming) -> Self {
        Self {
            task: CancellableTask::new("backlight"),
            display,
            timing,
        }
    }

    /**
     * Back to full brightness, restarting the idle window. The previous fade
     * worker is fully retired before the new one starts.
     */
    pub(crate) fn restart(&self) -> Result<(), TaskError> {
        self.task.request_stop_and_wait();

        let display = self.display.clone();
        let timing = self.timing;
        self.task
            .start(move |worker| _fade_out(worker, display, timing))
    }

    pub(crate) fn stop(&self) {
        self.task.request_stop_and_wait();
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        !self.task.is_done()
    }
}

fn _fade_out(worker: Worker, display: SharedDisplay, timing: BacklightTiming) {
    display.set_backlight(MAX_BRIGHTNESS);
    if worker.wait_for(timing.idle) {
        return;
    }

    let mut level = MAX_BRIGHTNESS;
    while level > 0 {
        if worker.wait_for(timing.fade_step) {
            return;
        }
        level -= 1;
        display.set_backlight(level);
    }
    debug!("Backlight faded out");
}

#[cfg(test)]
mod tests {
    use std::{
        thread,
        time::{Duration, Instant},
    };

    use super::*;
    use crate::display::testing::RecordingDisplay;

    fn fade_with(idle: Duration, fade_step: Duration) -> (BacklightFade, RecordingDisplay) {
        let recorder = RecordingDisplay::default();
        let fade = BacklightFade::new(
            SharedDisplay::new(recorder.clone()),
            BacklightTiming { idle, fade_step },
        );
        (fade, recorder)
    }

    #[test]
    fn fades_to_zero_after_idle_window() {
        let (fade, recorder) = fade_with(Duration::from_millis(10), Duration::from_micros(100));
        fade.restart().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while fade.is_running() {
            assert!(Instant::now() < deadline, "fade did not finish");
            thread::sleep(Duration::from_millis(5));
        }

        let levels = recorder.backlight_levels();
        assert_eq!(levels.len(), MAX_BRIGHTNESS as usize + 1);
        assert_eq!(levels[0], MAX_BRIGHTNESS);
        assert!(levels.windows(2).all(|w| w[1] + 1 == w[0]));
        assert_eq!(recorder.last_backlight(), Some(0));
    }

    #[test]
    fn activity_during_idle_keeps_full_brightness() {
        let (fade, recorder) = fade_with(Duration::from_secs(60), Duration::from_millis(1));
        fade.restart().unwrap();
        thread::sleep(Duration::from_millis(10));
        fade.restart().unwrap();
        thread::sleep(Duration::from_millis(10));
        fade.stop();

        assert_eq!(recorder.backlight_levels(), vec![MAX_BRIGHTNESS, MAX_BRIGHTNESS]);
        assert!(!fade.is_running());
    }

    #[test]
    fn restart_mid_fade_resets_to_full() {
        let (fade, recorder) = fade_with(Duration::ZERO, Duration::from_millis(2));
        fade.restart().unwrap();
        thread::sleep(Duration::from_millis(30));
        fade.restart().unwrap();
        thread::sleep(Duration::from_millis(5));
        fade.stop();

        let levels = recorder.backlight_levels();
        let restart_at = levels.iter().rposition(|&l| l == MAX_BRIGHTNESS).unwrap();
        assert!(levels[..restart_at].iter().any(|&l| l < MAX_BRIGHTNESS));
        assert!(levels[restart_at + 1..].iter().all(|&l| l > MAX_BRIGHTNESS - 10));
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let (fade, recorder) = fade_with(Duration::from_secs(1), Duration::from_millis(1));
        fade.stop();
        assert!(recorder.backlight_levels().is_empty());
    }
}
