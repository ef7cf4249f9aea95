use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, trace};

use crate::errors::TaskError;

#[derive(Debug)]
struct TaskState {
    done: bool,
    stop_requested: bool,
}

/**
 * Shared between the controller and one worker at a time. `done` and
 * `stop_requested` are only ever touched under `state`.
 */
#[derive(Debug)]
struct TaskControl {
    state: Mutex<TaskState>,
    cond_to_worker: Condvar,
    cond_to_master: Condvar,
}

/**
 * A background worker that can be started, and whose stop is requested and
 * then waited for. request_stop_and_wait() only returns once the worker has
 * finished its cleanup, so the controller can immediately reuse whatever the
 * worker was holding.
 */
#[derive(Debug)]
pub(crate) struct CancellableTask {
    name: &'static str,
    control: Arc<TaskControl>,
}

/**
 * The worker's side of the protocol. Dropping it (or calling finish())
 * marks the task done and wakes the controller, which covers every exit
 * path of the worker body including early returns and panics.
 */
#[derive(Debug)]
pub(crate) struct Worker {
    name: &'static str,
    control: Arc<TaskControl>,
}

impl TaskControl {
    fn lock(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CancellableTask {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            control: Arc::new(TaskControl {
                // A task that was never started counts as finished.
                state: Mutex::new(TaskState {
                    done: true,
                    stop_requested: false,
                }),
                cond_to_worker: Condvar::new(),
                cond_to_master: Condvar::new(),
            }),
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    /**
     * Launches `body` on its own thread and returns immediately.
     * Fails if the previous worker has not finished yet; restart with
     * request_stop_and_wait() followed by start().
     */
    pub(crate) fn start<F>(&self, body: F) -> Result<(), TaskError>
    where
        F: FnOnce(Worker) + Send + 'static,
    {
        {
            let mut state = self.control.lock();
            if !state.done {
                return Err(TaskError::AlreadyRunning(self.name));
            }
            state.done = false;
            state.stop_requested = false;
        }

        let worker = Worker {
            name: self.name,
            control: self.control.clone(),
        };
        let spawned = thread::Builder::new()
            .name(self.name.to_string())
            .spawn(move || body(worker));

        match spawned {
            Ok(_) => {
                debug!(task = self.name, "worker started");
                Ok(())
            }
            Err(e) => {
                self.control.lock().done = true;
                Err(TaskError::Spawn(e))
            }
        }
    }

    /**
     * Asks the worker to stop and blocks until it reports done. Returns
     * immediately if no worker is running.
     */
    pub(crate) fn request_stop_and_wait(&self) {
        let mut state = self.control.lock();
        if state.done {
            return;
        }

        state.stop_requested = true;
        self.control.cond_to_worker.notify_all();
        while !state.done {
            state = self
                .control
                .cond_to_master
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        debug!(task = self.name, "worker stopped");
    }

    pub(crate) fn is_done(&self) -> bool {
        self.control.lock().done
    }
}

impl Worker {
    pub(crate) fn stop_requested(&self) -> bool {
        self.control.lock().stop_requested
    }

    /**
     * Sleeps until `deadline` or until a stop is requested, whichever comes
     * first. Returns true if a stop was requested.
     */
    pub(crate) fn wait_until(&self, deadline: Instant) -> bool {
        let mut state = self.control.lock();
        loop {
            if state.stop_requested {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .control
                .cond_to_worker
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub(crate) fn wait_for(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }

    /**
     * Marks the task done. Anything the worker does after this is outside
     * the protocol and must not touch resources the controller may reuse.
     */
    pub(crate) fn finish(self) {}
}

impl Drop for Worker {
    fn drop(&mut self) {
        let mut state = self.control.lock();
        state.done = true;
        self.control.cond_to_master.notify_all();
        trace!(task = self.name, "worker done");
    }
}
