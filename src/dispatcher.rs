//! Serialized execution context for the monitor.
//!
//! A single named worker thread drains a job queue and fires an optional
//! periodic timer. Everything that touches monitor state (public commands, OS
//! topology callbacks, sampler ticks) runs here, so none of them interleave.

use crossbeam::channel::{self, select, Receiver, Sender};
use log::{debug, error};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::error::{MonitorError, MonitorResult};

type Job = Box<dyn FnOnce() + Send + 'static>;
type TickFn = Arc<dyn Fn() + Send + Sync + 'static>;

enum Command {
    Run(Job),
    /// Re-read the timer slot
    Wake,
    Shutdown,
}

#[derive(Clone)]
struct ActiveTimer {
    interval: Duration,
    ticker: Receiver<Instant>,
    tick: TickFn,
}

/// Timer slot shared with the worker. Every change bumps `generation` so a
/// tick already buffered for a replaced timer is dropped.
#[derive(Default)]
struct TimerSlot {
    generation: u64,
    active: Option<ActiveTimer>,
}

/// Single-threaded job queue with a periodic timer.
pub struct Dispatcher {
    sender: Sender<Command>,
    timer: Arc<Mutex<TimerSlot>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("timer_interval", &self.timer_interval())
            .field("has_worker", &self.worker.lock().is_some())
            .finish()
    }
}

impl Dispatcher {
    /// Spawns the worker thread.
    pub fn new(name: &str) -> MonitorResult<Self> {
        let (sender, receiver) = channel::unbounded();
        let timer = Arc::new(Mutex::new(TimerSlot::default()));
        let worker_timer = Arc::clone(&timer);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_worker(receiver, worker_timer))
            .map_err(|e| MonitorError::Unknown(format!("Failed to spawn dispatcher: {}", e)))?;

        Ok(Self {
            sender,
            timer,
            worker_id: handle.thread().id(),
            worker: Mutex::new(Some(handle)),
        })
    }

    /// True when called from the dispatcher's own thread.
    pub fn is_dispatcher_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    /// Queues a job behind everything already posted.
    pub fn post<F>(&self, job: F) -> MonitorResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .send(Command::Run(Box::new(job)))
            .map_err(|_| MonitorError::MonitorStopped)
    }

    /// Runs `f` on the dispatcher and waits for its result.
    ///
    /// Runs inline when already on the dispatcher thread. Returns
    /// `MonitorStopped` if the dispatcher shut down (or the job panicked)
    /// before producing a value.
    pub fn invoke<F, R>(&self, f: F) -> MonitorResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_dispatcher_thread() {
            return Ok(f());
        }

        let (tx, rx) = channel::bounded(1);
        self.post(move || {
            let _ = tx.send(f());
        })?;
        rx.recv().map_err(|_| MonitorError::MonitorStopped)
    }

    /// Waits until every job posted before this call has run.
    pub fn flush(&self) -> MonitorResult<()> {
        self.invoke(|| ())
    }

    /// Starts (or restarts) the periodic timer. The first tick fires after one interval.
    pub fn start_timer<F>(&self, interval: Duration, tick: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        {
            let mut slot = self.timer.lock();
            slot.generation += 1;
            slot.active = Some(ActiveTimer {
                interval,
                ticker: channel::tick(interval),
                tick: Arc::new(tick),
            });
        }
        let _ = self.sender.send(Command::Wake);
    }

    /// Stops the timer. A tick already in flight is discarded.
    pub fn stop_timer(&self) {
        {
            let mut slot = self.timer.lock();
            if slot.active.is_none() {
                return;
            }
            slot.generation += 1;
            slot.active = None;
        }
        let _ = self.sender.send(Command::Wake);
    }

    pub fn timer_interval(&self) -> Option<Duration> {
        self.timer.lock().active.as_ref().map(|t| t.interval)
    }

    pub fn is_timer_running(&self) -> bool {
        self.timer.lock().active.is_some()
    }

    /// Stops the timer and the worker. Jobs still queued are dropped.
    ///
    /// Joins the worker unless called from it.
    pub fn shutdown(&self) {
        self.stop_timer();
        let _ = self.sender.send(Command::Shutdown);

        if self.is_dispatcher_thread() {
            return;
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(receiver: Receiver<Command>, timer: Arc<Mutex<TimerSlot>>) {
    let idle = channel::never::<Instant>();

    loop {
        let (generation, active) = {
            let slot = timer.lock();
            (slot.generation, slot.active.clone())
        };
        let ticker = active.as_ref().map(|t| &t.ticker).unwrap_or(&idle);

        select! {
            recv(receiver) -> msg => match msg {
                Ok(Command::Run(job)) => run_guarded(job),
                Ok(Command::Wake) => {}
                Ok(Command::Shutdown) | Err(_) => break,
            },
            recv(ticker) -> _ => {
                if timer.lock().generation != generation {
                    continue;
                }
                if let Some(active) = &active {
                    let tick = Arc::clone(&active.tick);
                    run_guarded(Box::new(move || tick()));
                }
            }
        }
    }

    debug!("Dispatcher worker exiting");
}

fn run_guarded(job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!("Dispatcher job panicked; continuing");
    }
}
