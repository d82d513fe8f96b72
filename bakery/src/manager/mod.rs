//! The customer manager: spawns customers, books their status reports and
//! owns the customer queue segment.

use std::collections::HashMap;
use std::process::{self, Child};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use signal_hook::consts::SIGTERM;
use tracing::{debug, info, warn};

use crate::config::BakeryConfig;
use crate::core::{now_secs, send_signal, Shutdown};
use crate::customer::{random_customer, Customer, CustomerAction, STATUS_SIGNAL};
use crate::errors::{BakeryError, Result};
use crate::guard::NamedSemaphore;
use crate::launch::Launcher;
use crate::protocol::{Channels, StatusMessage};
use crate::queue::{BoundedQueue, SharedQueue};
use crate::state::SharedGame;

const NAP: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq)]
pub enum StatusOutcome {
    /// Cached patience and state refreshed, or nothing to refresh.
    Updated,
    /// Terminal report. The queue record, if still queued, is gone.
    Left { pid: i32, action: CustomerAction },
    /// Sender unknown to both the queue and the roster.
    Orphaned,
    /// Undecodable state or action byte. Nothing was touched.
    Malformed(String),
}

/// Applies one status report to the queue. Call with the queue guard held.
/// `known` says whether the manager spawned the sender; a customer a seller
/// already dequeued is known but no longer queued.
pub fn apply_status(queue: &mut BoundedQueue<'_, Customer>, known: bool, status: &StatusMessage) -> Result<StatusOutcome> {
    let (action, state) = match status.action().and_then(|a| Ok((a, status.state()?))) {
        Ok(decoded) => decoded,
        Err(BakeryError::Codec(reason)) => return Ok(StatusOutcome::Malformed(reason)),
        Err(e) => return Err(e),
    };
    let pid = status.customer_pid;
    match queue.position(|c| c.pid == pid) {
        Some(index) if action.is_leave() => {
            queue.remove_at(index)?;
            Ok(StatusOutcome::Left { pid, action })
        }
        Some(index) => {
            let mut record = queue.get(index)?;
            record.patience = status.patience;
            record.set_state(state);
            record.check_in();
            queue.set(index, record)?;
            Ok(StatusOutcome::Updated)
        }
        None if known && action.is_leave() => Ok(StatusOutcome::Left { pid, action }),
        None if known => Ok(StatusOutcome::Updated),
        None => Ok(StatusOutcome::Orphaned),
    }
}

/// Books a terminal report against the shared counters.
pub fn count_leave(game: &SharedGame, pid: i32, action: CustomerAction) -> Result<()> {
    match action {
        CustomerAction::LeaveComplained => game.with_cascade(|cascade, counters| {
            counters.complained += 1;
            cascade.record_complaint(pid, now_secs());
        }),
        CustomerAction::LeaveCascade => game.with_cascade(|_, counters| counters.cascade += 1),
        CustomerAction::LeaveNormal => Ok(game.with_manager_fields(|f| *f.served += 1)),
        CustomerAction::LeaveFrustrated => Ok(game.with_manager_fields(|f| *f.frustrated += 1)),
        CustomerAction::LeaveMissingOrder => Ok(game.with_manager_fields(|f| *f.missing_order += 1)),
        CustomerAction::StatusUpdate => Err(BakeryError::Logic("status update is not a leave".to_string())),
    }
}

pub fn should_spawn(active: usize, max: usize, roll: f64, probability: f64) -> bool {
    active < max && roll < probability
}

struct Tracked {
    child: Child,
    /// Seen exited once without a terminal report.
    vanished: bool,
}

/// Customer processes this manager spawned and has not yet reaped.
#[derive(Default)]
struct Roster {
    live: HashMap<i32, Tracked>,
    leaving: Vec<Child>,
}

impl Roster {
    fn insert(&mut self, child: Child) {
        self.live.insert(child.id() as i32, Tracked { child, vanished: false });
    }

    fn contains(&self, pid: i32) -> bool {
        self.live.contains_key(&pid)
    }

    fn active(&self) -> usize {
        self.live.len()
    }

    /// Stops tracking `pid` as active; the process is reaped later.
    fn retire(&mut self, pid: i32) {
        if let Some(tracked) = self.live.remove(&pid) {
            self.leaving.push(tracked.child);
        }
    }

    /// Reaps retired processes. Returns pids that exited twice in a row
    /// without a terminal report.
    fn reap(&mut self) -> Vec<i32> {
        self.leaving.retain_mut(|child| !matches!(child.try_wait(), Ok(Some(_)) | Err(_)));
        let mut vanished = Vec::new();
        for (pid, tracked) in self.live.iter_mut() {
            if let Ok(Some(status)) = tracked.child.try_wait() {
                if tracked.vanished {
                    warn!(pid, %status, "customer exited without reporting");
                    vanished.push(*pid);
                } else {
                    tracked.vanished = true;
                }
            }
        }
        for pid in &vanished {
            self.live.remove(pid);
        }
        vanished
    }

    fn terminate_all(&mut self) {
        for (pid, tracked) in self.live.iter_mut() {
            if matches!(tracked.child.try_wait(), Ok(None)) {
                if let Err(e) = send_signal(*pid, SIGTERM) {
                    debug!(pid, error = %e, "could not terminate customer");
                }
            }
        }
        for (_, mut tracked) in self.live.drain() {
            let _ = tracked.child.wait();
        }
        for mut child in self.leaving.drain(..) {
            let _ = child.wait();
        }
    }
}

pub struct CustomerManager {
    cfg: BakeryConfig,
    game: SharedGame,
    queue: Option<SharedQueue>,
    channels: Channels,
    launcher: Launcher,
    roster: Roster,
    next_id: u32,
    pid: i32,
    recheck: Arc<AtomicBool>,
    shutdown: Shutdown,
    rng: StdRng,
}

impl CustomerManager {
    /// Creates the customer queue and its guard. The game state must exist.
    pub fn new(cfg: BakeryConfig, channels: Channels, launcher: Launcher) -> Result<CustomerManager> {
        let game = SharedGame::open(&cfg)?;
        let queue = SharedQueue::create(&cfg)?;
        let recheck = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(STATUS_SIGNAL, Arc::clone(&recheck)).map_err(BakeryError::SignalHook)?;
        Ok(CustomerManager {
            cfg,
            game,
            queue: Some(queue),
            channels,
            launcher,
            roster: Roster::default(),
            next_id: 1,
            pid: process::id() as i32,
            recheck,
            shutdown: Shutdown::install()?,
            rng: StdRng::from_entropy(),
        })
    }

    fn queue(&self) -> Result<&SharedQueue> {
        self.queue.as_ref().ok_or(BakeryError::Cancelled)
    }

    pub fn run(mut self) -> Result<()> {
        info!(pid = self.pid, max_customers = self.cfg.customers.max_customers, "customer manager started");
        let period = Duration::from_millis(self.cfg.simulation.tick_ms.max(1));
        while !self.shutdown.is_closing() {
            self.tick()?;
            self.nap(period)?;
        }
        self.close();
        Ok(())
    }

    /// Sleeps for `period`, draining status early whenever a customer nudges.
    fn nap(&mut self, period: Duration) -> Result<()> {
        let until = Instant::now() + period;
        while Instant::now() < until && !self.shutdown.is_closing() {
            if self.recheck.swap(false, Ordering::Relaxed) {
                self.drain_status()?;
            }
            thread::sleep(NAP);
        }
        Ok(())
    }

    fn tick(&mut self) -> Result<()> {
        self.drain_status()?;
        let window = self.cfg.customers.cascade_window_secs;
        if self.game.with_cascade(|cascade, _| cascade.expire(now_secs(), window))? {
            debug!("complaint expired");
        }
        let roll = self.rng.gen::<f64>();
        let max = self.cfg.customers.max_customers as usize;
        if should_spawn(self.roster.active(), max, roll, self.cfg.customers.customer_probability) {
            if let Err(e) = self.spawn_customer() {
                warn!(error = %e, "could not spawn customer");
            }
        }
        for pid in self.roster.reap() {
            self.queue()?.with_queue(|q| q.remove_matching(|c| c.pid == pid).ok())?;
            count_leave(&self.game, pid, CustomerAction::LeaveFrustrated)?;
        }
        let active = self.roster.active() as u32;
        self.game.with_manager_fields(|f| {
            *f.active_customers = active;
            *f.elapsed_secs = now_secs() - f.start_time;
        });
        Ok(())
    }

    /// The record is queued with pid 0 before the process exists and patched
    /// once it does. Sellers never take a customer that has not checked in,
    /// so the placeholder is never selected, and the spawn itself runs with
    /// the queue guard released.
    fn spawn_customer(&mut self) -> Result<()> {
        let record = random_customer(self.next_id, &self.cfg.customers, &mut self.rng);
        let id = record.id;
        self.queue()?.with_queue(|q| q.enqueue(record))??;
        self.next_id += 1;
        let child = match self.launcher.spawn_customer(&record, self.pid) {
            Ok(child) => child,
            Err(e) => {
                self.queue()?.with_queue(|q| q.remove_matching(|c| c.id == id && c.pid == 0).ok())?;
                return Err(e);
            }
        };
        let pid = child.id() as i32;
        let placed = self.queue()?.with_queue(|q| match q.position(|c| c.id == id && c.pid == 0) {
            Some(index) => {
                let mut patched = record;
                patched.pid = pid;
                q.set(index, patched).is_ok()
            }
            None => false,
        })?;
        if !placed {
            warn!(id, pid, "queued record vanished before its pid was set");
        }
        info!(id, pid, patience = record.patience, "customer spawned");
        self.roster.insert(child);
        Ok(())
    }

    fn drain_status(&mut self) -> Result<()> {
        while let Some(status) = self.channels.status.try_recv(0)? {
            self.handle_status(&status)?;
        }
        Ok(())
    }

    fn handle_status(&mut self, status: &StatusMessage) -> Result<()> {
        let known = self.roster.contains(status.customer_pid);
        let outcome = self.queue()?.with_queue(|q| apply_status(q, known, status))??;
        match outcome {
            StatusOutcome::Updated => {}
            StatusOutcome::Left { pid, action } => {
                count_leave(&self.game, pid, action)?;
                info!(pid, id = status.customer_id, ?action, "customer left");
                if let Err(e) = send_signal(pid, SIGTERM) {
                    debug!(pid, error = %e, "customer already gone");
                }
                self.roster.retire(pid);
            }
            StatusOutcome::Orphaned => {
                warn!(pid = status.customer_pid, id = status.customer_id, "status from unknown customer, dropped");
            }
            StatusOutcome::Malformed(reason) => {
                warn!(pid = status.customer_pid, id = status.customer_id, %reason, "undecodable status, dropped");
            }
        }
        Ok(())
    }

    /// Terminates every customer, clears and unlinks the queue and removes
    /// the queue and cascade guards. Safe to call more than once.
    pub fn close(&mut self) {
        let queue = match self.queue.take() {
            Some(queue) => queue,
            None => return,
        };
        info!("customer manager shutting down");
        match queue.with_queue(|q| {
            let pids: Vec<i32> = q.iter().map(|c| c.pid).filter(|pid| *pid > 0).collect();
            q.clear();
            pids
        }) {
            Ok(pids) => {
                for pid in pids {
                    if let Err(e) = send_signal(pid, SIGTERM) {
                        debug!(pid, error = %e, "queued customer already gone");
                    }
                }
            }
            Err(e) => warn!(error = %e, "could not clear customer queue"),
        }
        self.roster.terminate_all();
        drop(queue);
        let names = self.cfg.guard_names();
        for name in [&names.queue, &names.cascade] {
            if let Err(e) = NamedSemaphore::unlink(name) {
                warn!(name = %name, error = %e, "could not remove guard");
            }
        }
    }
}

impl Drop for CustomerManager {
    fn drop(&mut self) {
        self.close();
    }
}
