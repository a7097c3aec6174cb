//! Trigger surface: at most one update task at a time, plus a bounded viewer
//! that streams the task's progress lines to whoever asked for the update.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::config::OtaConfig;
use crate::error::OtaError;
use crate::progress::{Phase, ProgressLog, ProgressSink};

const OTA_TASK_NAME: &str = "ota_task";
const OTA_TASK_STACK: usize = 8192;

/// Slot that at most one update task can hold.
#[derive(Default)]
pub struct UpdateGate {
    in_flight: Mutex<bool>,
}

impl UpdateGate {
    pub fn try_acquire(self: &Arc<Self>) -> Result<UpdatePermit, OtaError> {
        let mut in_flight = match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *in_flight {
            return Err(OtaError::ReentrancyRejected);
        }
        *in_flight = true;
        Ok(UpdatePermit { gate: Arc::clone(self) })
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.lock().map(|g| *g).unwrap_or(true)
    }
}

/// Held by the running update task; releases the gate when dropped.
pub struct UpdatePermit {
    gate: Arc<UpdateGate>,
}

impl Drop for UpdatePermit {
    fn drop(&mut self) {
        match self.gate.in_flight.lock() {
            Ok(mut guard) => *guard = false,
            Err(poisoned) => *poisoned.into_inner() = false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewerConfig {
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl From<&OtaConfig> for ViewerConfig {
    fn from(config: &OtaConfig) -> Self {
        Self {
            poll_interval: config.viewer_poll_interval(),
            max_polls: config.viewer_max_polls,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    Completed,
    Failed,
    /// The poll ceiling elapsed; the update task keeps running on its own.
    TimedOut,
}

pub struct OtaService {
    gate: Arc<UpdateGate>,
    progress: Arc<ProgressLog>,
    viewer: ViewerConfig,
    task_stack: usize,
}

impl OtaService {
    pub fn new(progress: Arc<ProgressLog>, viewer: ViewerConfig) -> Self {
        Self {
            gate: Arc::new(UpdateGate::default()),
            progress,
            viewer,
            task_stack: OTA_TASK_STACK,
        }
    }

    pub fn progress(&self) -> &Arc<ProgressLog> {
        &self.progress
    }

    pub fn is_running(&self) -> bool {
        self.gate.is_busy()
    }

    /// Start `job` on its own task unless an update is already in flight.
    ///
    /// A rejected start never runs `job`. If the task cannot be spawned the
    /// attempt is marked failed so joining viewers stop waiting.
    pub fn start<J>(&self, job: J) -> Result<(), OtaError>
    where
        J: FnOnce(Arc<ProgressLog>) + Send + 'static,
    {
        let permit = self.gate.try_acquire()?;
        self.progress.begin_attempt();

        let progress = Arc::clone(&self.progress);
        thread::Builder::new()
            .name(OTA_TASK_NAME.to_string())
            .stack_size(self.task_stack)
            .spawn(move || {
                let _permit = permit;
                job(progress);
            })
            .map_err(|e| {
                let err = OtaError::TaskSpawn(e.kind());
                log::error!("{}", err);
                self.progress.push_line(&err.to_string());
                self.progress.set_phase(Phase::Failed);
                err
            })?;

        log::info!("Update task started");
        Ok(())
    }

    /// Stream the current attempt's progress lines to `emit` until it finishes,
    /// fails, or the poll ceiling is reached.
    pub fn watch<E, W>(&self, mut emit: W) -> Result<WatchOutcome, E>
    where
        W: FnMut(&str) -> Result<(), E>,
    {
        let mut cursor = self.progress.attempt_start();

        for _ in 0..self.viewer.max_polls {
            thread::sleep(self.viewer.poll_interval);

            // Phase first: every line pushed before a terminal phase is then visible below.
            let phase = self.progress.phase();
            let (lines, next) = self.progress.lines_since(cursor);
            cursor = next;
            for line in &lines {
                emit(line)?;
            }

            match phase {
                Phase::Failed => return Ok(WatchOutcome::Failed),
                Phase::Completed => return Ok(WatchOutcome::Completed),
                Phase::Idle | Phase::Running => {}
            }
        }

        log::warn!("Stopped waiting for update after {} polls", self.viewer.max_polls);
        Ok(WatchOutcome::TimedOut)
    }

    /// Start an update, or join the one in flight, then watch it.
    pub fn trigger<E, J, W>(&self, job: J, emit: W) -> Result<WatchOutcome, E>
    where
        J: FnOnce(Arc<ProgressLog>) + Send + 'static,
        W: FnMut(&str) -> Result<(), E>,
        E: From<OtaError>,
    {
        match self.start(job) {
            Ok(()) => {}
            Err(OtaError::ReentrancyRejected) => {
                log::info!("Update already in progress, joining its progress stream");
            }
            Err(e) => return Err(e.into()),
        }
        self.watch(emit)
    }
}
