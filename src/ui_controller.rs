use tracing::{debug, info, warn};

use crate::{
    backlight_controller::BacklightFade,
    common::{CaptureConfig, Event, RunEnd, RunReport, MAX_FRAMES, MAX_SECONDS},
    display::{Screen, SharedDisplay},
    errors::StartError,
    mailbox::Mailbox,
};

/**
 * What the UI needs from the capture side. Starting blocks until the camera
 * is open; stopping blocks until it is released again.
 */
pub(crate) trait RunControl {
    /** Returns the id the run's Event::RunFinished will carry. */
    fn start_run(&mut self, config: &CaptureConfig) -> Result<u32, StartError>;
    /** Stops any active run and returns the report not collected yet. */
    fn stop_run(&mut self) -> Option<RunReport>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProgramState {
    Menu,
    SetInterval,
    SetDelay,
    SetFrames,
    Running,
}

const MENU: [(ProgramState, &str); 4] = [
    (ProgramState::SetInterval, "Interval"),
    (ProgramState::SetDelay, "Delay"),
    (ProgramState::SetFrames, "Frames"),
    (ProgramState::Running, "Start"),
];

const TITLE: &str = "Timelapse";
const HOUR_MINUTE_SECOND: &[u32] = &[3600, 60, 1];
const SINGLE_UNIT: &[u32] = &[1];

/**
 * Cursor over a row of numeric fields followed by an OK button.
 * Each field adds its step to the edited value per detent.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ValueEditor {
    steps: &'static [u32],
    min: u32,
    max: u32,
    selected: usize,
    editing: bool,
}

impl ValueEditor {
    fn time(min: u32) -> Self {
        Self {
            steps: HOUR_MINUTE_SECOND,
            min,
            max: MAX_SECONDS,
            selected: HOUR_MINUTE_SECOND.len(),
            editing: false,
        }
    }

    fn count() -> Self {
        Self {
            steps: SINGLE_UNIT,
            min: 0,
            max: MAX_FRAMES,
            selected: SINGLE_UNIT.len(),
            editing: false,
        }
    }

    fn ok_index(&self) -> usize {
        self.steps.len()
    }

    /**
     * Returns true when OK was pressed.
     */
    fn handle(&mut self, event: Event, value: &mut u32) -> bool {
        match event {
            Event::Pulse(detents) if self.editing => {
                let step = self.steps[self.selected] as i64;
                let next = *value as i64 + detents as i64 * step;
                // A step that would leave the range is dropped whole.
                if (self.min as i64..=self.max as i64).contains(&next) {
                    *value = next as u32;
                }
            }
            Event::Pulse(detents) => {
                let next = self.selected as i64 + detents as i64;
                self.selected = next.clamp(0, self.ok_index() as i64) as usize;
            }
            Event::Button if !self.editing && self.selected == self.ok_index() => return true,
            Event::Button => self.editing = !self.editing,
            Event::RunFinished(_) => {}
        }
        false
    }

    fn _mark(&self, index: usize, text: &str) -> String {
        if index != self.selected {
            format!(" {} ", text)
        } else if self.editing {
            format!(">{}<", text)
        } else {
            format!("[{}]", text)
        }
    }

    fn render_time(&self, seconds: u32) -> String {
        let parts = [seconds / 3600, (seconds / 60) % 60, seconds % 60];
        let mut row: String = parts
            .iter()
            .enumerate()
            .map(|(i, part)| self._mark(i, &format!("{:02}", part)))
            .collect();
        row.push_str(&self._mark(self.ok_index(), "OK"));
        row
    }

    fn render_count(&self, value: u32) -> String {
        format!(
            "{:<12}{}",
            self._mark(0, &format!("{:05}", value)),
            self._mark(self.ok_index(), "OK")
        )
    }
}

/**
 * Turns operator events into configuration edits and run start/stop.
 * Owned and driven by the dispatcher thread only.
 */
pub(crate) struct UiStateMachine<R: RunControl> {
    state: ProgramState,
    menu_index: usize,
    editor: ValueEditor,
    config: CaptureConfig,
    /** Top row of the menu: title, or how the last run went. */
    status: String,
    current_run: Option<u32>,
    runner: R,
    display: SharedDisplay,
}

impl<R: RunControl> UiStateMachine<R> {
    pub(crate) fn new(config: CaptureConfig, runner: R, display: SharedDisplay) -> Self {
        Self {
            state: ProgramState::Menu,
            menu_index: 0,
            editor: ValueEditor::time(1),
            config,
            status: TITLE.to_string(),
            current_run: None,
            runner,
            display,
        }
    }

    pub(crate) fn state(&self) -> ProgramState {
        self.state
    }

    pub(crate) fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub(crate) fn redraw(&self) {
        self.display.show(&self.screen());
    }

    pub(crate) fn dispatch(&mut self, event: Event) {
        let previous = self.state;
        if self._handle(event) {
            self.redraw();
        }
        if previous != self.state {
            debug!(from = ?previous, to = ?self.state, "UI state changed");
        }
    }

    /**
     * What the display should show for the current state. While running,
     * the capture worker owns the display and this is only the placeholder
     * drawn while the camera opens.
     */
    pub(crate) fn screen(&self) -> Screen {
        match self.state {
            ProgramState::Menu => {
                let (_, label) = MENU[self.menu_index];
                [self.status.clone(), format!("{}. {}", self.menu_index + 1, label)]
            }
            ProgramState::SetInterval => [
                "Interval".to_string(),
                self.editor.render_time(self.config.interval_seconds),
            ],
            ProgramState::SetDelay => [
                "Delay".to_string(),
                self.editor.render_time(self.config.start_delay_seconds),
            ],
            ProgramState::SetFrames => [
                "Frames (0=inf)".to_string(),
                self.editor.render_count(self.config.frame_count),
            ],
            ProgramState::Running => ["Opening camera".to_string(), String::new()],
        }
    }

    /**
     * Stops any active run. Used on teardown.
     */
    pub(crate) fn shutdown(&mut self) -> Option<RunReport> {
        self.current_run = None;
        self.runner.stop_run()
    }

    /**
     * Returns true if the screen needs to be redrawn.
     */
    fn _handle(&mut self, event: Event) -> bool {
        match self.state {
            ProgramState::Menu => self._handle_menu(event),
            ProgramState::SetInterval => {
                let confirmed = self.editor.handle(event, &mut self.config.interval_seconds);
                self._leave_editor(confirmed)
            }
            ProgramState::SetDelay => {
                let confirmed = self
                    .editor
                    .handle(event, &mut self.config.start_delay_seconds);
                self._leave_editor(confirmed)
            }
            ProgramState::SetFrames => {
                let confirmed = self.editor.handle(event, &mut self.config.frame_count);
                self._leave_editor(confirmed)
            }
            ProgramState::Running => self._handle_running(event),
        }
    }

    fn _handle_menu(&mut self, event: Event) -> bool {
        match event {
            Event::Pulse(detents) => {
                let next = self.menu_index as i64 + detents as i64;
                self.menu_index = next.clamp(0, MENU.len() as i64 - 1) as usize;
                true
            }
            Event::Button => {
                let (target, _) = MENU[self.menu_index];
                match target {
                    ProgramState::SetInterval => self.editor = ValueEditor::time(1),
                    ProgramState::SetDelay => self.editor = ValueEditor::time(0),
                    ProgramState::SetFrames => self.editor = ValueEditor::count(),
                    ProgramState::Running => return self._start_run(),
                    ProgramState::Menu => {}
                }
                self.state = target;
                true
            }
            // A run that was already stopped by the operator.
            Event::RunFinished(_) => false,
        }
    }

    fn _leave_editor(&mut self, confirmed: bool) -> bool {
        if confirmed {
            self.state = ProgramState::Menu;
        }
        true
    }

    fn _start_run(&mut self) -> bool {
        self.state = ProgramState::Running;
        // Opening the camera can take a while.
        self.redraw();

        match self.runner.start_run(&self.config) {
            Ok(run_id) => {
                info!(run_id, config = ?self.config, "Entered running state");
                self.current_run = Some(run_id);
                // The capture worker draws from here on.
                false
            }
            Err(e) => {
                warn!("Could not start capture run: {}", e);
                self.status = match e {
                    StartError::Camera(_) => "Camera error".to_string(),
                    StartError::Task(_) => "Start failed".to_string(),
                };
                self.state = ProgramState::Menu;
                true
            }
        }
    }

    fn _handle_running(&mut self, event: Event) -> bool {
        match event {
            Event::Button => {
                let report = self.runner.stop_run();
                self._back_to_menu(report);
                true
            }
            Event::RunFinished(run_id) if Some(run_id) == self.current_run => {
                let report = self.runner.stop_run();
                self._back_to_menu(report);
                true
            }
            Event::RunFinished(stale) => {
                debug!(stale, "Ignoring finish of an earlier run");
                false
            }
            Event::Pulse(_) => false,
        }
    }

    fn _back_to_menu(&mut self, report: Option<RunReport>) {
        self.current_run = None;
        self.state = ProgramState::Menu;
        self.status = match report {
            Some(report) => status_line(&report),
            None => TITLE.to_string(),
        };
    }
}

/**
 * One-row summary of a finished run.
 */
pub(crate) fn status_line(report: &RunReport) -> String {
    match report.end {
        RunEnd::Completed => format!("Done {} frames", report.captured),
        RunEnd::Cancelled => format!("Stopped at {}", report.captured),
        RunEnd::Failed(_) => format!("Error after {}", report.captured),
    }
}

/**
 * Dispatcher loop. Runs on the calling thread until the mailbox is closed.
 * Every event counts as activity for the backlight.
 */
pub(crate) fn run_event_loop<R: RunControl>(
    mailbox: &Mailbox,
    ui: &mut UiStateMachine<R>,
    backlight: &BacklightFade,
) {
    ui.redraw();
    if let Err(e) = backlight.restart() {
        warn!("Could not start backlight fade: {}", e);
    }

    while let Some(event) = mailbox.take() {
        if let Err(e) = backlight.restart() {
            warn!("Could not restart backlight fade: {}", e);
        }
        debug!(?event, state = ?ui.state(), "Dispatching event");
        ui.dispatch(event);
    }
    info!("Event loop finished");
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        thread,
        time::Duration,
    };

    use proptest::prelude::*;

    use super::*;
    use crate::{
        capture_controller::{Camera, CameraSession, CaptureScheduler},
        common::CaptureId,
        display::testing::RecordingDisplay,
        errors::CameraError,
        user_config::BacklightTiming,
    };

    #[derive(Debug, Default)]
    struct RunnerLog {
        starts: Vec<CaptureConfig>,
        stops: u32,
    }

    /**
     * Hands out run ids 1, 2, ... and a canned report on every stop.
     */
    #[derive(Debug, Clone, Default)]
    struct ScriptedRunner {
        log: Arc<Mutex<RunnerLog>>,
        fail_start: bool,
        report_end: Option<RunEnd>,
    }

    impl RunControl for ScriptedRunner {
        fn start_run(&mut self, config: &CaptureConfig) -> Result<u32, StartError> {
            if self.fail_start {
                return Err(StartError::Camera(CameraError::Open("unplugged".to_string())));
            }
            let mut log = self.log.lock().unwrap();
            log.starts.push(*config);
            Ok(log.starts.len() as u32)
        }

        fn stop_run(&mut self) -> Option<RunReport> {
            let mut log = self.log.lock().unwrap();
            log.stops += 1;
            let run_id = log.starts.len() as u32;
            self.report_end.clone().map(|end| RunReport {
                run_id,
                captured: 4,
                end,
            })
        }
    }

    fn ui_with(runner: ScriptedRunner) -> (UiStateMachine<ScriptedRunner>, RecordingDisplay) {
        let recorder = RecordingDisplay::default();
        let ui = UiStateMachine::new(
            CaptureConfig::default(),
            runner,
            SharedDisplay::new(recorder.clone()),
        );
        (ui, recorder)
    }

    fn feed<R: RunControl>(ui: &mut UiStateMachine<R>, events: &[Event]) {
        for event in events {
            ui.dispatch(*event);
        }
    }

    #[test]
    fn menu_cursor_is_clamped() {
        let (mut ui, recorder) = ui_with(ScriptedRunner::default());
        ui.redraw();
        assert_eq!(recorder.row(0), "Timelapse");
        assert_eq!(recorder.row(1), "1. Interval");

        feed(&mut ui, &[Event::Pulse(-1)]);
        assert_eq!(recorder.row(1), "1. Interval");
        feed(&mut ui, &[Event::Pulse(2)]);
        assert_eq!(recorder.row(1), "3. Frames");
        feed(&mut ui, &[Event::Pulse(5)]);
        assert_eq!(recorder.row(1), "4. Start");
    }

    #[test]
    fn interval_editor_steps_by_field() {
        let (mut ui, recorder) = ui_with(ScriptedRunner::default());
        feed(&mut ui, &[Event::Button]);
        assert_eq!(ui.state(), ProgramState::SetInterval);
        assert_eq!(recorder.row(0), "Interval");
        assert_eq!(recorder.row(1), " 00  00  10 [OK]");

        // Move to minutes, edit +2 minutes.
        feed(&mut ui, &[Event::Pulse(-2), Event::Button]);
        assert_eq!(recorder.row(1), " 00 >00< 10  OK");
        feed(&mut ui, &[Event::Pulse(1), Event::Pulse(1)]);
        assert_eq!(ui.config().interval_seconds, 130);

        // Leave edit mode, go to OK, confirm.
        feed(&mut ui, &[Event::Button, Event::Pulse(2), Event::Button]);
        assert_eq!(ui.state(), ProgramState::Menu);
        assert_eq!(recorder.row(1), "1. Interval");
        assert_eq!(ui.config().interval_seconds, 130);
    }

    #[test]
    fn interval_cannot_go_below_one_second() {
        let (mut ui, _) = ui_with(ScriptedRunner::default());
        // Seconds field, edit, -20 from 10s is dropped.
        feed(&mut ui, &[Event::Button, Event::Pulse(-1), Event::Button, Event::Pulse(-20)]);
        assert_eq!(ui.config().interval_seconds, 10);

        feed(&mut ui, &[Event::Pulse(-9)]);
        assert_eq!(ui.config().interval_seconds, 1);
        feed(&mut ui, &[Event::Pulse(-1)]);
        assert_eq!(ui.config().interval_seconds, 1);
    }

    #[test]
    fn step_past_the_limit_leaves_value_unchanged() {
        let mut editor = ValueEditor::time(1);
        let mut value = 10;
        editor.selected = 0;
        editor.editing = true;

        // -1h from 10s would go negative.
        editor.handle(Event::Pulse(-1), &mut value);
        assert_eq!(value, 10);

        editor.handle(Event::Pulse(1), &mut value);
        assert_eq!(value, 3610);
        editor.handle(Event::Pulse(-1), &mut value);
        assert_eq!(value, 10);
    }

    #[test]
    fn delay_may_be_zero_and_stays_in_range() {
        let (mut ui, recorder) = ui_with(ScriptedRunner::default());
        feed(&mut ui, &[Event::Pulse(1), Event::Button]);
        assert_eq!(ui.state(), ProgramState::SetDelay);

        // Hours field, edit. +200h is out of range and dropped.
        feed(&mut ui, &[Event::Pulse(-3), Event::Button, Event::Pulse(200)]);
        assert_eq!(ui.config().start_delay_seconds, 0);

        feed(&mut ui, &[Event::Pulse(99)]);
        assert_eq!(ui.config().start_delay_seconds, 99 * 3600);
        assert_eq!(recorder.row(1), ">99< 00  00  OK");
        feed(&mut ui, &[Event::Pulse(1)]);
        assert_eq!(ui.config().start_delay_seconds, 99 * 3600);

        feed(&mut ui, &[Event::Pulse(-500)]);
        assert_eq!(ui.config().start_delay_seconds, 99 * 3600);
        feed(&mut ui, &[Event::Pulse(-99)]);
        assert_eq!(ui.config().start_delay_seconds, 0);
    }

    #[test]
    fn frames_editor() {
        let (mut ui, recorder) = ui_with(ScriptedRunner::default());
        feed(&mut ui, &[Event::Pulse(2), Event::Button]);
        assert_eq!(ui.state(), ProgramState::SetFrames);
        assert_eq!(recorder.row(1), " 00005      [OK]");

        feed(&mut ui, &[Event::Pulse(-1), Event::Button, Event::Pulse(-7)]);
        assert_eq!(ui.config().frame_count, 5);
        feed(&mut ui, &[Event::Pulse(-5), Event::Pulse(-1)]);
        assert_eq!(ui.config().frame_count, 0);
        assert_eq!(recorder.row(1), ">00000<      OK");
        feed(&mut ui, &[Event::Button, Event::Pulse(1), Event::Button]);
        assert_eq!(ui.state(), ProgramState::Menu);
    }

    #[test]
    fn start_then_stop_returns_to_menu() {
        let runner = ScriptedRunner {
            report_end: Some(RunEnd::Cancelled),
            ..ScriptedRunner::default()
        };
        let log = runner.log.clone();
        let (mut ui, recorder) = ui_with(runner);

        feed(&mut ui, &[Event::Pulse(3), Event::Button]);
        assert_eq!(ui.state(), ProgramState::Running);
        assert_eq!(log.lock().unwrap().starts, vec![CaptureConfig::default()]);

        // Knob turns while running are ignored.
        feed(&mut ui, &[Event::Pulse(1)]);
        assert_eq!(ui.state(), ProgramState::Running);
        assert_eq!(log.lock().unwrap().stops, 0);

        feed(&mut ui, &[Event::Button]);
        assert_eq!(ui.state(), ProgramState::Menu);
        assert_eq!(log.lock().unwrap().stops, 1);
        assert_eq!(recorder.row(0), "Stopped at 4");
        assert_eq!(recorder.row(1), "4. Start");
    }

    #[test]
    fn run_finished_for_current_run_returns_to_menu() {
        let runner = ScriptedRunner {
            report_end: Some(RunEnd::Completed),
            ..ScriptedRunner::default()
        };
        let (mut ui, recorder) = ui_with(runner);

        feed(&mut ui, &[Event::Pulse(3), Event::Button]);
        feed(&mut ui, &[Event::RunFinished(99)]);
        assert_eq!(ui.state(), ProgramState::Running);

        feed(&mut ui, &[Event::RunFinished(1)]);
        assert_eq!(ui.state(), ProgramState::Menu);
        assert_eq!(recorder.row(0), "Done 4 frames");
    }

    #[test]
    fn failed_run_shows_error() {
        let runner = ScriptedRunner {
            report_end: Some(RunEnd::Failed(CameraError::Capture("io".to_string()))),
            ..ScriptedRunner::default()
        };
        let (mut ui, recorder) = ui_with(runner);

        feed(&mut ui, &[Event::Pulse(3), Event::Button, Event::RunFinished(1)]);
        assert_eq!(ui.state(), ProgramState::Menu);
        assert_eq!(recorder.row(0), "Error after 4");
    }

    #[test]
    fn start_failure_stays_in_menu() {
        let runner = ScriptedRunner {
            fail_start: true,
            ..ScriptedRunner::default()
        };
        let (mut ui, recorder) = ui_with(runner);

        feed(&mut ui, &[Event::Pulse(3), Event::Button]);
        assert_eq!(ui.state(), ProgramState::Menu);
        assert_eq!(recorder.row(0), "Camera error");
        assert_eq!(recorder.row(1), "4. Start");
    }

    #[test]
    fn late_finish_after_manual_stop_is_ignored() {
        let runner = ScriptedRunner {
            report_end: Some(RunEnd::Cancelled),
            ..ScriptedRunner::default()
        };
        let log = runner.log.clone();
        let (mut ui, recorder) = ui_with(runner);

        feed(&mut ui, &[Event::Pulse(3), Event::Button, Event::Button]);
        feed(&mut ui, &[Event::RunFinished(1)]);
        assert_eq!(ui.state(), ProgramState::Menu);
        assert_eq!(log.lock().unwrap().stops, 1);
        assert_eq!(recorder.row(0), "Stopped at 4");
    }

    proptest! {
        #[test]
        fn edited_values_stay_in_range(pulses in prop::collection::vec(-400i32..400, 0..40)) {
            let mut editor = ValueEditor::time(1);
            let mut value = 10;
            editor.selected = 0;
            editor.editing = true;
            for detents in pulses {
                let before = value;
                editor.handle(Event::Pulse(detents), &mut value);
                prop_assert!((1..=MAX_SECONDS).contains(&value));
                let wanted = before as i64 + detents as i64 * 3600;
                if (1..=MAX_SECONDS as i64).contains(&wanted) {
                    prop_assert_eq!(value as i64, wanted);
                } else {
                    prop_assert_eq!(value, before);
                }
            }
        }

        #[test]
        fn cursor_stays_on_a_field(pulses in prop::collection::vec(-5i32..5, 0..40)) {
            let mut editor = ValueEditor::count();
            let mut value = 0;
            for detents in pulses {
                editor.handle(Event::Pulse(detents), &mut value);
                prop_assert!(editor.selected <= editor.ok_index());
            }
            prop_assert_eq!(value, 0);
        }
    }

    //////////////////// End to end, through the mailbox ////////////////////

    #[derive(Clone, Default)]
    struct CountingCamera {
        captures: Arc<Mutex<Vec<std::time::Instant>>>,
        closes: Arc<Mutex<u32>>,
    }

    struct CountingSession(CountingCamera);

    impl Camera for CountingCamera {
        fn open(&self) -> Result<Box<dyn CameraSession>, CameraError> {
            Ok(Box::new(CountingSession(self.clone())))
        }
    }

    impl CameraSession for CountingSession {
        fn capture(&mut self) -> Result<CaptureId, CameraError> {
            let mut captures = self.0.captures.lock().unwrap();
            captures.push(std::time::Instant::now());
            Ok(CaptureId(captures.len() as u32))
        }

        fn close(self: Box<Self>) {
            *self.0.closes.lock().unwrap() += 1;
        }
    }

    #[test]
    fn two_frame_run_through_the_dispatcher() {
        let mailbox = Arc::new(Mailbox::new());
        let recorder = RecordingDisplay::default();
        let display = SharedDisplay::new(recorder.clone());
        let camera = CountingCamera::default();
        let scheduler = CaptureScheduler::new(
            Arc::new(camera.clone()),
            display.clone(),
            mailbox.clone(),
            Duration::from_millis(20),
        );
        let config = CaptureConfig {
            interval_seconds: 1,
            start_delay_seconds: 0,
            frame_count: 2,
        };
        let mut ui = UiStateMachine::new(config, scheduler, display.clone());
        let backlight = BacklightFade::new(
            display,
            BacklightTiming {
                idle: Duration::from_secs(60),
                fade_step: Duration::from_millis(10),
            },
        );

        let dispatcher_mailbox = mailbox.clone();
        let dispatcher = thread::spawn(move || {
            run_event_loop(&dispatcher_mailbox, &mut ui, &backlight);
            backlight.stop();
            (ui.state(), ui.shutdown())
        });

        // Menu -> "4. Start" -> press.
        for event in [Event::Pulse(3), Event::Button] {
            while !mailbox.post(event) {
                thread::sleep(Duration::from_millis(1));
            }
        }

        // Two captures one second apart, then the run announces itself done
        // and the UI drops back to the menu.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while recorder.row(0) != "Done 2 frames" {
            assert!(std::time::Instant::now() < deadline, "run never finished");
            thread::sleep(Duration::from_millis(10));
        }
        mailbox.close();
        let (state, leftover) = dispatcher.join().unwrap();

        assert_eq!(state, ProgramState::Menu);
        assert_eq!(leftover, None);
        let captures = camera.captures.lock().unwrap().clone();
        assert_eq!(captures.len(), 2);
        let gap = captures[1] - captures[0];
        assert!(gap >= Duration::from_millis(995) && gap < Duration::from_millis(1100));
        assert_eq!(*camera.closes.lock().unwrap(), 1);
        assert_eq!(recorder.last_backlight(), Some(255));
    }
}
