use std::{
    sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use tracing::{debug, error, info};

use crate::{
    cancellable_task::{CancellableTask, Worker},
    common::{format_hms, CaptureConfig, CaptureId, Event, RunEnd, RunReport, Schedule},
    display::SharedDisplay,
    errors::{CameraError, StartError, TaskError},
    mailbox::Mailbox,
    ui_controller::RunControl,
};

/**
 * Something that can be opened for one capture run.
 */
pub(crate) trait Camera: Send + Sync {
    fn open(&self) -> Result<Box<dyn CameraSession>, CameraError>;
}

/**
 * An open camera. Lives on the capture worker thread for exactly one run.
 */
pub(crate) trait CameraSession {
    fn capture(&mut self) -> Result<CaptureId, CameraError>;
    fn close(self: Box<Self>);
}

/**
 * Starts and stops timed capture runs. Only the dispatcher thread calls into
 * this; the run itself happens on a CancellableTask worker that owns the
 * camera session for the run's whole lifetime.
 */
pub(crate) struct CaptureScheduler {
    task: CancellableTask,
    camera: Arc<dyn Camera>,
    display: SharedDisplay,
    mailbox: Arc<Mailbox>,
    refresh_tick: Duration,
    /** Written by the worker before it reports done. */
    last_report: Arc<Mutex<Option<RunReport>>>,
    last_run_id: u32,
}

/**
 * Everything one run needs, moved onto the worker thread.
 */
struct CaptureJob {
    run_id: u32,
    schedule: Schedule,
    camera: Arc<dyn Camera>,
    display: SharedDisplay,
    mailbox: Arc<Mailbox>,
    refresh_tick: Duration,
    report: Arc<Mutex<Option<RunReport>>>,
}

impl CaptureScheduler {
    pub(crate) fn new(
        camera: Arc<dyn Camera>,
        display: SharedDisplay,
        mailbox: Arc<Mailbox>,
        refresh_tick: Duration,
    ) -> Self {
        Self {
            task: CancellableTask::new("capture"),
            camera,
            display,
            mailbox,
            refresh_tick,
            last_report: Arc::new(Mutex::new(None)),
            last_run_id: 0,
        }
    }

    /**
     * Starts a run and blocks until the camera is open. Returns the run id
     * that the matching Event::RunFinished will carry.
     */
    pub(crate) fn start(&mut self, schedule: Schedule) -> Result<u32, StartError> {
        if !self.task.is_done() {
            return Err(StartError::Task(TaskError::AlreadyRunning(self.task.name())));
        }

        self.last_run_id = self.last_run_id.wrapping_add(1);
        let run_id = self.last_run_id;
        *self._report() = None;

        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let job = CaptureJob {
            run_id,
            schedule,
            camera: self.camera.clone(),
            display: self.display.clone(),
            mailbox: self.mailbox.clone(),
            refresh_tick: self.refresh_tick,
            report: self.last_report.clone(),
        };
        self.task
            .start(move |worker| job.run(worker, ready_tx))
            .map_err(StartError::Task)?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!(
                    run_id,
                    interval = ?schedule.interval,
                    start_delay = ?schedule.start_delay,
                    frames = schedule.frame_count,
                    "Capture run started"
                );
                Ok(run_id)
            }
            Ok(Err(e)) => {
                self.task.request_stop_and_wait();
                Err(StartError::Camera(e))
            }
            Err(_) => {
                self.task.request_stop_and_wait();
                Err(StartError::Camera(CameraError::WorkerGone))
            }
        }
    }

    /**
     * Stops the current run, if any, and waits until the camera is released.
     * Returns the report of the last run that has not been collected yet.
     */
    pub(crate) fn stop(&mut self) -> Option<RunReport> {
        self.task.request_stop_and_wait();
        self._report().take()
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        !self.task.is_done()
    }

    fn _report(&self) -> MutexGuard<'_, Option<RunReport>> {
        self.last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl RunControl for CaptureScheduler {
    fn start_run(&mut self, config: &CaptureConfig) -> Result<u32, StartError> {
        self.start(config.schedule())
    }

    fn stop_run(&mut self) -> Option<RunReport> {
        self.stop()
    }
}

//////////////////////////// Capture Worker Start ////////////////////////////
impl CaptureJob {
    fn run(self, worker: Worker, ready: mpsc::SyncSender<Result<(), CameraError>>) {
        let mut session = match self.camera.open() {
            Ok(session) => session,
            Err(e) => {
                error!(run_id = self.run_id, "Could not open camera: {}", e);
                let _ = ready.send(Err(e));
                return;
            }
        };
        let _ = ready.send(Ok(()));

        let (captured, end) = if self._wait_out_delay(&worker) {
            (0, RunEnd::Cancelled)
        } else {
            self._capture_until_done(&worker, session.as_mut())
        };

        // The camera must be released before the controller is told we're done.
        session.close();

        match &end {
            RunEnd::Failed(e) => error!(run_id = self.run_id, captured, "Capture run failed: {}", e),
            _ => info!(run_id = self.run_id, captured, end = ?end, "Capture run ended"),
        }

        let announce = end != RunEnd::Cancelled;
        *self.report.lock().unwrap_or_else(PoisonError::into_inner) = Some(RunReport {
            run_id: self.run_id,
            captured,
            end,
        });
        worker.finish();

        // Outside the task protocol: the dispatcher may be blocked in
        // request_stop_and_wait() and cannot take from the mailbox until
        // done has been set.
        if announce {
            self.mailbox.post_blocking(Event::RunFinished(self.run_id));
        }
    }

    /**
     * Returns true if the run was cancelled during the delay.
     */
    fn _wait_out_delay(&self, worker: &Worker) -> bool {
        if self.schedule.start_delay.is_zero() {
            return worker.stop_requested();
        }

        let deadline = Instant::now() + self.schedule.start_delay;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            self.display.show(&[
                "Starting in".to_string(),
                format_hms(_ceil_secs(deadline - now)),
            ]);
            if worker.wait_until(deadline.min(now + self.refresh_tick)) {
                return true;
            }
        }
    }

    fn _capture_until_done(
        &self,
        worker: &Worker,
        session: &mut dyn CameraSession,
    ) -> (u32, RunEnd) {
        let mut captured: u32 = 0;
        let mut next_deadline = Instant::now();

        while !self.schedule.quota_reached(captured) {
            if worker.stop_requested() {
                return (captured, RunEnd::Cancelled);
            }

            if Instant::now() >= next_deadline {
                match session.capture() {
                    Ok(id) => {
                        captured += 1;
                        next_deadline = next_capture_deadline(
                            next_deadline,
                            self.schedule.interval,
                            Instant::now(),
                        );
                        debug!(run_id = self.run_id, frame = id.0, captured, "Captured frame");
                    }
                    Err(e) => return (captured, RunEnd::Failed(e)),
                }
                if self.schedule.quota_reached(captured) {
                    break;
                }
            }

            let now = Instant::now();
            self.display.show(&self._status_screen(captured, next_deadline, now));
            if worker.wait_until(next_deadline.min(now + self.refresh_tick)) {
                return (captured, RunEnd::Cancelled);
            }
        }

        (captured, RunEnd::Completed)
    }

    fn _status_screen(&self, captured: u32, next_deadline: Instant, now: Instant) -> [String; 2] {
        let progress = if self.schedule.is_unbounded() {
            format!("Frame {}", captured)
        } else {
            format!("Frame {}/{}", captured, self.schedule.frame_count)
        };
        let remaining = next_deadline.saturating_duration_since(now);
        [progress, format!("Next {}", format_hms(_ceil_secs(remaining)))]
    }
}
//////////////////////////// Capture Worker End ////////////////////////////

/**
 * The deadline after `previous`. Always a whole number of intervals after
 * `previous`, so capture time and wake-up jitter never accumulate. If the
 * capture overran one or more boundaries, those are skipped rather than
 * fired back to back.
 */
pub(crate) fn next_capture_deadline(previous: Instant, interval: Duration, now: Instant) -> Instant {
    let next = previous + interval;
    if next >= now || interval.is_zero() {
        return next;
    }

    let behind = now - next;
    // A boundary that lands exactly on `now` still counts.
    let skipped = behind.as_nanos().div_ceil(interval.as_nanos()) as u32;
    next + interval * skipped
}

fn _ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}
