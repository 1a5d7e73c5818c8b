//! # Sync Scheduler
//!
//! Background task that decides when the operation queue drains.
//!
//! ## Triggers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncScheduler Loop                               │
//! │                                                                         │
//! │   connectivity ──► offline → online ─────┐                             │
//! │   lifecycle    ──► Foreground / SyncNow ─┼──► drain() ──► Idle         │
//! │   interval     ──► tick (online only) ───┘        │    or IdleWithErrors│
//! │                    + cache sweep                  │                     │
//! │                                                   ▼                     │
//! │                              triggers that arrived while Syncing        │
//! │                              are discarded (coalesced)                  │
//! │                                                                         │
//! │   Background pauses the interval; Foreground resumes it.               │
//! │   Offline pauses the interval; the queue is left untouched.            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cache::ResponseCache;
use crate::queue::OperationQueue;
use crate::transport::Connectivity;

/// Scheduler state as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Syncing,
    /// Last pass dead-lettered operations or was aborted.
    IdleWithErrors,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchedulerCommand {
    Foreground,
    Background,
    SyncNow,
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Startup,
    Online,
    Foreground,
    Manual,
    Interval,
}

impl Trigger {
    fn as_str(&self) -> &'static str {
        match self {
            Trigger::Startup => "startup",
            Trigger::Online => "online",
            Trigger::Foreground => "foreground",
            Trigger::Manual => "manual",
            Trigger::Interval => "interval",
        }
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Drives queue drains and cache sweeps.
pub struct SyncScheduler {
    queue: OperationQueue,
    cache: ResponseCache,
    connectivity: Connectivity,
    online_rx: watch::Receiver<bool>,
    commands: mpsc::Receiver<SchedulerCommand>,
    state: watch::Sender<SchedulerState>,
    interval: Duration,
    foreground: bool,
}

impl SyncScheduler {
    /// Spawns the scheduler loop and returns its handle.
    pub fn spawn(
        queue: OperationQueue,
        cache: ResponseCache,
        connectivity: Connectivity,
        interval: Duration,
    ) -> SchedulerHandle {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(SchedulerState::Idle);

        let scheduler = SyncScheduler {
            queue,
            cache,
            online_rx: connectivity.subscribe(),
            connectivity,
            commands: command_rx,
            state: state_tx,
            interval,
            foreground: true,
        };

        let task = tokio::spawn(scheduler.run());

        SchedulerHandle {
            commands: command_tx,
            state: state_rx,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(mut self) {
        info!(interval_ms = self.interval.as_millis() as u64, "Sync scheduler started");

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.online_rx.borrow_and_update();
        if self.connectivity.is_online() {
            if !self.sync(Trigger::Startup).await {
                return;
            }
            ticker.reset();
        }

        loop {
            let ticking = self.foreground && self.connectivity.is_online();

            let keep_running = tokio::select! {
                changed = self.online_rx.changed() => {
                    if changed.is_err() {
                        debug!("Connectivity source dropped");
                        break;
                    }
                    let online = *self.online_rx.borrow_and_update();
                    if online {
                        ticker.reset();
                        self.sync(Trigger::Online).await
                    } else {
                        info!("Offline; periodic sync paused");
                        true
                    }
                }

                command = self.commands.recv() => match command {
                    None | Some(SchedulerCommand::Shutdown) => break,
                    Some(SchedulerCommand::Background) => {
                        debug!("App in background; periodic sync paused");
                        self.foreground = false;
                        true
                    }
                    Some(SchedulerCommand::Foreground) => {
                        let resumed = !self.foreground;
                        self.foreground = true;
                        if resumed && self.connectivity.is_online() {
                            ticker.reset();
                            self.sync(Trigger::Foreground).await
                        } else {
                            true
                        }
                    }
                    Some(SchedulerCommand::SyncNow) => {
                        if self.connectivity.is_online() {
                            self.sync(Trigger::Manual).await
                        } else {
                            debug!("Manual sync ignored while offline");
                            true
                        }
                    }
                },

                _ = ticker.tick(), if ticking => {
                    if let Err(e) = self.cache.sweep_expired().await {
                        warn!(error = %e, "Cache sweep failed");
                    }
                    self.sync(Trigger::Interval).await
                }
            };

            if !keep_running {
                break;
            }
        }

        info!("Sync scheduler stopped");
    }

    /// Runs one drain, then discards triggers that piled up meanwhile.
    ///
    /// Returns `false` when a shutdown arrived during the pass.
    async fn sync(&mut self, trigger: Trigger) -> bool {
        debug!(trigger = trigger.as_str(), "Sync triggered");
        self.state.send_replace(SchedulerState::Syncing);

        let has_errors = match self.queue.drain().await {
            Ok(report) => {
                if let Some(halted) = &report.halted {
                    debug!(error = %halted, "Drain halted waiting for credentials");
                }
                report.dead_lettered > 0
            }
            Err(e) => {
                error!(error = %e, "Drain failed");
                true
            }
        };

        self.state.send_replace(if has_errors {
            SchedulerState::IdleWithErrors
        } else {
            SchedulerState::Idle
        });

        self.online_rx.borrow_and_update();
        let mut keep_running = true;
        while let Ok(command) = self.commands.try_recv() {
            match command {
                SchedulerCommand::Shutdown => keep_running = false,
                SchedulerCommand::Background => self.foreground = false,
                SchedulerCommand::Foreground => self.foreground = true,
                SchedulerCommand::SyncNow => debug!("Coalesced manual trigger"),
            }
        }
        keep_running
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Handle for lifecycle events and shutdown of a running scheduler.
pub struct SchedulerHandle {
    commands: mpsc::Sender<SchedulerCommand>,
    state: watch::Receiver<SchedulerState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerHandle {
    fn send(&self, command: SchedulerCommand) {
        // A full channel means triggers are already pending; dropping is coalescing.
        if let Err(e) = self.commands.try_send(command) {
            debug!(?command, error = %e, "Scheduler command dropped");
        }
    }

    pub fn app_foreground(&self) {
        self.send(SchedulerCommand::Foreground);
    }

    pub fn app_background(&self) {
        self.send(SchedulerCommand::Background);
    }

    pub fn sync_now(&self) {
        self.send(SchedulerCommand::SyncNow);
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SchedulerState> {
        self.state.clone()
    }

    /// Stops the loop and waits for it. A pass in progress finishes first.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(SchedulerCommand::Shutdown).await;
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Scheduler task panicked");
            }
        }
    }
}
