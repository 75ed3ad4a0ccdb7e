//! Dual-cadence harvest scheduler.
//!
//! One worker per priority class, each a loop over a command channel and a
//! sleep. Workers are spawned lazily by [`HarvestScheduler::start`]; nothing
//! ticks until a class has been started.
//!
//! ```text
//! Stopped -> PartiallyRunning -> FullyRunning
//!     \            |                 |
//!      \           +---- pause ------+--> Paused --resume--> (running)
//!       +------------- shutdown ------------------------> ShutDown
//! ```
//!
//! Stopping is cooperative: a worker finishes the task it is running before
//! it observes a stop.

use crate::{PipelineError, PipelineResult};
use async_trait::async_trait;
use harvest_config_and_utils::{PriorityClass, Profile};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// First on-demand tick after `start`.
const ON_DEMAND_START_DELAY: Duration = Duration::from_secs(5);
/// First live tick after `start`.
const LIVE_START_DELAY: Duration = Duration::from_secs(2);
/// First on-demand tick after `resume`.
const ON_DEMAND_RESUME_DELAY: Duration = Duration::from_secs(1);
/// First live tick after `resume`.
const LIVE_RESUME_DELAY: Duration = Duration::from_millis(500);
/// How long shutdown waits for a worker to finish its current task.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(30);

/// A unit of scheduled work.
#[async_trait]
pub trait HarvestTask: Send + Sync {
    async fn run(&self);
}

/// Scheduler lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Stopped,
    PartiallyRunning,
    FullyRunning,
    Paused,
    ShutDown,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::PartiallyRunning => "partially_running",
            Self::FullyRunning => "fully_running",
            Self::Paused => "paused",
            Self::ShutDown => "shut_down",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug)]
enum TimerCommand {
    HarvestNow,
    Pause,
    Resume(Duration),
    Stop,
}

enum Wake {
    Tick,
    Command(Option<TimerCommand>),
}

struct Worker {
    commands: mpsc::UnboundedSender<TimerCommand>,
    handle: JoinHandle<()>,
}

struct ClassTimer {
    task: Arc<dyn HarvestTask>,
    running: AtomicBool,
    worker: Mutex<Option<Worker>>,
}

impl ClassTimer {
    fn new(task: Arc<dyn HarvestTask>) -> Self {
        Self {
            task,
            running: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    /// Send to the worker. Returns false when there is none.
    fn send(&self, command: TimerCommand) -> bool {
        match self.worker.lock().as_ref() {
            Some(worker) => worker.commands.send(command).is_ok(),
            None => false,
        }
    }
}

struct SchedulerInner {
    profile: Arc<Profile>,
    runtime: Handle,
    live: ClassTimer,
    on_demand: ClassTimer,
    paused: AtomicBool,
    extended: AtomicBool,
    shut_down: AtomicBool,
    shutdown_lock: tokio::sync::Mutex<()>,
}

impl SchedulerInner {
    fn timer(&self, class: PriorityClass) -> &ClassTimer {
        match class {
            PriorityClass::Live => &self.live,
            PriorityClass::OnDemand => &self.on_demand,
        }
    }

    fn interval(&self, class: PriorityClass) -> Duration {
        let base = self.profile.interval(class);
        if self.extended.load(Ordering::Acquire) {
            base.saturating_mul(2)
        } else {
            base
        }
    }

    /// Run the class task on its own tokio task so a panic stays contained.
    async fn run_task(&self, class: PriorityClass) {
        let task = self.timer(class).task.clone();
        let result = self.runtime.spawn(async move { task.run().await }).await;
        if let Err(e) = result {
            if e.is_panic() {
                error!(class = %class, "Harvest task panicked");
            } else {
                warn!(class = %class, error = %e, "Harvest task cancelled");
            }
        }
    }
}

/// Holds only a weak reference so a dropped scheduler takes its workers with
/// it: the command channel closes and any pending tick fails to upgrade.
async fn run_worker(
    scheduler: Weak<SchedulerInner>,
    class: PriorityClass,
    mut commands: mpsc::UnboundedReceiver<TimerCommand>,
    first_delay: Option<Duration>,
) {
    let mut delay = first_delay;
    debug!(class = %class, ?delay, "Harvest worker started");

    loop {
        let wake = match delay {
            Some(d) => tokio::select! {
                command = commands.recv() => Wake::Command(command),
                _ = tokio::time::sleep(d) => Wake::Tick,
            },
            None => Wake::Command(commands.recv().await),
        };

        let Some(inner) = scheduler.upgrade() else {
            break;
        };

        match wake {
            Wake::Tick => {
                if !inner.timer(class).running.load(Ordering::Acquire) {
                    break;
                }
                inner.run_task(class).await;
                delay = Some(inner.interval(class));
            }
            Wake::Command(Some(TimerCommand::HarvestNow)) => {
                inner.run_task(class).await;
                if delay.is_some() {
                    delay = Some(inner.interval(class));
                }
            }
            Wake::Command(Some(TimerCommand::Pause)) => delay = None,
            Wake::Command(Some(TimerCommand::Resume(d))) => delay = Some(d),
            Wake::Command(Some(TimerCommand::Stop)) | Wake::Command(None) => break,
        }
    }

    debug!(class = %class, "Harvest worker stopped");
}

/// Two lazily started repeating harvest timers.
#[derive(Clone)]
pub struct HarvestScheduler {
    inner: Arc<SchedulerInner>,
}

/// Non-owning handle to a [`HarvestScheduler`].
#[derive(Clone)]
pub struct WeakHarvestScheduler {
    inner: Weak<SchedulerInner>,
}

impl WeakHarvestScheduler {
    pub fn upgrade(&self) -> Option<HarvestScheduler> {
        self.inner.upgrade().map(|inner| HarvestScheduler { inner })
    }
}

impl HarvestScheduler {
    /// Create a stopped scheduler bound to the current tokio runtime.
    pub fn new(
        profile: Arc<Profile>,
        live_task: Arc<dyn HarvestTask>,
        on_demand_task: Arc<dyn HarvestTask>,
    ) -> PipelineResult<Self> {
        let runtime = Handle::try_current().map_err(|e| PipelineError::Runtime(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                profile,
                runtime,
                live: ClassTimer::new(live_task),
                on_demand: ClassTimer::new(on_demand_task),
                paused: AtomicBool::new(false),
                extended: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                shutdown_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn downgrade(&self) -> WeakHarvestScheduler {
        WeakHarvestScheduler {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn state(&self) -> SchedulerState {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::Acquire) {
            return SchedulerState::ShutDown;
        }
        let running = PriorityClass::ALL
            .iter()
            .filter(|class| self.is_running(**class))
            .count();
        match (running, inner.paused.load(Ordering::Acquire)) {
            (0, _) => SchedulerState::Stopped,
            (_, true) => SchedulerState::Paused,
            (1, false) => SchedulerState::PartiallyRunning,
            _ => SchedulerState::FullyRunning,
        }
    }

    pub fn is_running(&self, class: PriorityClass) -> bool {
        self.inner.timer(class).running.load(Ordering::Acquire)
    }

    /// Start the repeating timer for one class. Idempotent.
    pub fn start(&self, class: PriorityClass) {
        let inner = &self.inner;
        let timer = inner.timer(class);

        // Checked under the worker lock; shutdown flips the flag before it
        // takes the same lock.
        let mut worker = timer.worker.lock();
        if inner.shut_down.load(Ordering::Acquire) {
            return;
        }
        if timer.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let first_delay = if inner.paused.load(Ordering::Acquire) {
            None
        } else {
            Some(match class {
                PriorityClass::OnDemand => ON_DEMAND_START_DELAY,
                PriorityClass::Live => LIVE_START_DELAY,
            })
        };

        let (commands, receiver) = mpsc::unbounded_channel();
        let handle = inner.runtime.spawn(run_worker(
            Arc::downgrade(inner),
            class,
            receiver,
            first_delay,
        ));
        *worker = Some(Worker { commands, handle });

        info!(class = %class, interval_secs = inner.interval(class).as_secs(), "Harvest timer started");
    }

    /// Suspend pending ticks. Started classes stay marked running.
    pub fn pause(&self) {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::Acquire) {
            return;
        }
        if !inner.paused.swap(true, Ordering::AcqRel) {
            for class in PriorityClass::ALL {
                inner.timer(class).send(TimerCommand::Pause);
            }
            debug!("Harvest scheduler paused");
        }
    }

    /// Reinstall ticks for started classes.
    ///
    /// `extended` doubles the intervals, and only takes effect on TV profiles.
    pub fn resume(&self, extended: bool) {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::Acquire) {
            return;
        }

        let extended = extended && inner.profile.is_tv();
        inner.extended.store(extended, Ordering::Release);
        inner.paused.store(false, Ordering::Release);

        inner
            .on_demand
            .send(TimerCommand::Resume(ON_DEMAND_RESUME_DELAY));
        inner.live.send(TimerCommand::Resume(LIVE_RESUME_DELAY));
        debug!(extended, "Harvest scheduler resumed");
    }

    /// Stop both timers, wait for the workers, then run both tasks once.
    ///
    /// Terminal and idempotent.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let _guard = inner.shutdown_lock.lock().await;
        if inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("Harvest scheduler shutting down");

        for class in PriorityClass::ALL {
            let timer = inner.timer(class);
            let worker = {
                let mut worker = timer.worker.lock();
                timer.running.store(false, Ordering::Release);
                worker.take()
            };
            let Some(mut worker) = worker else {
                continue;
            };
            let _ = worker.commands.send(TimerCommand::Stop);
            if tokio::time::timeout(SHUTDOWN_WAIT, &mut worker.handle)
                .await
                .is_err()
            {
                warn!(class = %class, "Harvest worker did not stop in time, aborting");
                worker.handle.abort();
            }
        }

        inner.run_task(PriorityClass::OnDemand).await;
        inner.run_task(PriorityClass::Live).await;
        info!("Harvest scheduler shut down");
    }

    /// Run both tasks now without touching timer state.
    pub async fn force_harvest(&self) {
        self.inner.run_task(PriorityClass::OnDemand).await;
        self.inner.run_task(PriorityClass::Live).await;
    }

    /// Harvest one class out of band.
    ///
    /// A started class's worker runs it next; otherwise a one-off task is
    /// spawned. Never waits for the harvest.
    pub fn harvest_now(&self, class: PriorityClass) {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::Acquire) {
            return;
        }
        if inner.timer(class).send(TimerCommand::HarvestNow) {
            return;
        }

        let inner = inner.clone();
        self.inner.runtime.spawn(async move {
            inner.run_task(class).await;
        });
    }
}
