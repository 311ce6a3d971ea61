//! Timer Service
//!
//! One process-wide scheduler. Stages request one-shot or recurring timers
//! by id; when a timer is due, a synthetic event is dispatched to the
//! owning stage's event channel, where its workers pick it up between
//! messages. Recurring timers re-arm themselves; what happens to missed
//! ticks is configurable per timer.

use serde_json::Value;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

/// Synthetic event delivered to a stage when one of its timers fires.
#[derive(Clone, Debug)]
pub struct TimerEvent {
    pub timer_id: String,
    pub payload: Option<Value>,
}

/// Behaviour when the service falls behind a recurring timer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MissedTickPolicy {
    /// Fire once for every missed interval until caught up (default).
    #[default]
    CatchUp,

    /// Drop missed intervals and re-arm from now.
    Skip,
}

/// A timer registration.
pub struct TimerRequest {
    /// Owning stage identifier; cancellation is scoped to it.
    pub owner: String,
    pub timer_id: String,
    pub delay: Duration,
    /// Recurrence interval; `None` makes the timer one-shot.
    pub interval: Option<Duration>,
    pub payload: Option<Value>,
    pub missed_tick_policy: MissedTickPolicy,
    /// Where due events are dispatched.
    pub dispatch: flume::Sender<TimerEvent>,
}

struct ActiveTimer {
    owner: String,
    timer_id: String,
    next_due: Instant,
    interval: Option<Duration>,
    payload: Option<Value>,
    missed_tick_policy: MissedTickPolicy,
    dispatch: flume::Sender<TimerEvent>,
}

enum Command {
    Add(TimerRequest),
    Cancel { owner: String, timer_id: String },
    Shutdown,
}

pub struct TimerService {
    tx: flume::Sender<Command>,
    rx: flume::Receiver<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerService {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            tx,
            rx,
            task: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let mut guard = self.task.lock().expect("timer task lock");
        if guard.is_some() {
            return;
        }
        let rx = self.rx.clone();
        *guard = Some(tokio::spawn(run(rx)));
        tracing::debug!("timer service started");
    }

    pub async fn stop(&self) {
        let _ = self.tx.send(Command::Shutdown);
        let task = self.task.lock().expect("timer task lock").take();
        if let Some(task) = task {
            let _ = task.await;
        }
        tracing::debug!("timer service stopped");
    }

    /// Register a timer. A timer with the same owner and id replaces the
    /// previous registration.
    pub fn add_timer(&self, request: TimerRequest) {
        let _ = self.tx.send(Command::Add(request));
    }

    pub fn cancel_timer(&self, owner: &str, timer_id: &str) {
        let _ = self.tx.send(Command::Cancel {
            owner: owner.to_string(),
            timer_id: timer_id.to_string(),
        });
    }
}

async fn run(rx: flume::Receiver<Command>) {
    let mut timers: Vec<ActiveTimer> = Vec::new();

    loop {
        let idle = Duration::from_secs(3600);
        let until_next = timers
            .iter()
            .map(|t| t.next_due.saturating_duration_since(Instant::now()))
            .min()
            .unwrap_or(idle);

        tokio::select! {
            command = rx.recv_async() => match command {
                Ok(Command::Add(request)) => {
                    timers.retain(|t| {
                        t.owner != request.owner || t.timer_id != request.timer_id
                    });
                    timers.push(ActiveTimer {
                        owner: request.owner,
                        timer_id: request.timer_id,
                        next_due: Instant::now() + request.delay,
                        interval: request.interval,
                        payload: request.payload,
                        missed_tick_policy: request.missed_tick_policy,
                        dispatch: request.dispatch,
                    });
                }
                Ok(Command::Cancel { owner, timer_id }) => {
                    timers.retain(|t| t.owner != owner || t.timer_id != timer_id);
                }
                Ok(Command::Shutdown) | Err(_) => break,
            },
            _ = tokio::time::sleep(until_next) => {
                fire_due(&mut timers);
            }
        }
    }
}

fn fire_due(timers: &mut Vec<ActiveTimer>) {
    let now = Instant::now();
    timers.retain_mut(|timer| {
        if timer.next_due > now {
            return true;
        }

        let delivered = timer
            .dispatch
            .send(TimerEvent {
                timer_id: timer.timer_id.clone(),
                payload: timer.payload.clone(),
            })
            .is_ok();
        if !delivered {
            // Owner is gone; drop the registration.
            return false;
        }

        match timer.interval {
            Some(interval) => {
                timer.next_due = match timer.missed_tick_policy {
                    // Catch-up fires once per missed interval: the next due
                    // time may still be in the past, so the next loop pass
                    // fires again immediately.
                    MissedTickPolicy::CatchUp => timer.next_due + interval,
                    MissedTickPolicy::Skip => now + interval,
                };
                true
            }
            None => false,
        }
    });
}
