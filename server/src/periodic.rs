use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::shutdown::{instant_after, Deadline, StopError, Stoppable};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PeriodicTaskError {
    #[error("interval must be greater than zero")]
    InvalidInterval,

    #[error("periodic task {name} already started")]
    AlreadyStarted { name: String },

    #[error("periodic task {name} already stopped")]
    Stopped { name: String },
}

/// Unit of work run on every tick. It is awaited inline by the schedule loop,
/// so two runs of the same task never overlap.
#[async_trait]
pub trait Work: Send + Sync + 'static {
    async fn run(&self);
}

#[async_trait]
impl<F, Fut> Work for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn run(&self) {
        (self)().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Running,
    Stopped,
}

struct Schedule {
    state: TaskState,
    handle: Option<JoinHandle<()>>,
}

pub struct PeriodicTask {
    name: String,
    interval: Duration,
    work: Arc<dyn Work>,
    stop_token: CancellationToken,
    schedule: Mutex<Schedule>,
}

impl PeriodicTask {
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        work: impl Work,
    ) -> Result<Self, PeriodicTaskError> {
        if interval.is_zero() {
            return Err(PeriodicTaskError::InvalidInterval);
        }
        let name = name.into();
        debug!(task = name, interval = ?interval, "create new periodic task");
        Ok(Self {
            name,
            interval,
            work: Arc::new(work),
            stop_token: CancellationToken::new(),
            schedule: Mutex::new(Schedule {
                state: TaskState::Idle,
                handle: None,
            }),
        })
    }

    pub fn state(&self) -> TaskState {
        self.schedule.lock().expect("lock not poisoned").state
    }

    /// Spawn the schedule loop and return immediately. The first run happens
    /// one interval after start; the loop also exits when `cancel_token` fires.
    pub fn start(&self, cancel_token: CancellationToken) -> Result<(), PeriodicTaskError> {
        let mut schedule = self.schedule.lock().expect("lock not poisoned");
        match schedule.state {
            TaskState::Idle => {}
            TaskState::Running => {
                return Err(PeriodicTaskError::AlreadyStarted {
                    name: self.name.clone(),
                })
            }
            TaskState::Stopped => {
                return Err(PeriodicTaskError::Stopped {
                    name: self.name.clone(),
                })
            }
        }

        info!(task = self.name, interval = ?self.interval, "start periodic task");
        let handle = tokio::spawn(run_schedule(
            self.name.clone(),
            self.interval,
            self.work.clone(),
            self.stop_token.clone(),
            cancel_token,
        ));
        schedule.handle = Some(handle);
        schedule.state = TaskState::Running;
        Ok(())
    }
}

async fn run_schedule(
    name: String,
    interval: Duration,
    work: Arc<dyn Work>,
    stop_token: CancellationToken,
    cancel_token: CancellationToken,
) {
    let mut ticker = time::interval_at(instant_after(interval), interval);
    // a tick missed while work is running is dropped, not queued
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = stop_token.cancelled() => {
                debug!(task = name, "periodic task stop requested");
                break;
            }
            _ = cancel_token.cancelled() => {
                debug!(task = name, "periodic task cancelled");
                break;
            }
            _ = ticker.tick() => {
                trace!(task = name, "run periodic task");
                work.run().await;
            }
        }
    }
    debug!(task = name, "periodic task loop exited");
}

#[async_trait]
impl Stoppable for PeriodicTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stop(&self, deadline: Deadline) -> Result<(), StopError> {
        let handle = {
            let mut schedule = self.schedule.lock().expect("lock not poisoned");
            match schedule.state {
                TaskState::Stopped => return Ok(()),
                TaskState::Idle => {
                    schedule.state = TaskState::Stopped;
                    return Ok(());
                }
                TaskState::Running => {
                    schedule.state = TaskState::Stopped;
                    schedule.handle.take()
                }
            }
        };

        info!(task = self.name, "shutdown periodic task");
        self.stop_token.cancel();

        let Some(handle) = handle else {
            return Ok(());
        };
        match time::timeout_at(deadline.at(), handle).await {
            Ok(Ok(())) => {
                debug!(task = self.name, "periodic task shutdown completed");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(task = self.name, error = %e, "periodic task loop ended abnormally");
                Ok(())
            }
            Err(_) => {
                warn!(task = self.name, "periodic task still running at deadline");
                Err(StopError::DeadlineExceeded)
            }
        }
    }
}
