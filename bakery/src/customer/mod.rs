//! One OS process per customer.
//!
//! The process is a single actor loop waiting on three kinds of event: the
//! decay tick, the seller's selection (SIGUSR1, whose sender pid is the seller
//! to order from) and cancellation (SIGTERM/SIGINT). Signals are turned into
//! events by a listener thread, so no state is touched from a signal handler.

mod machine;
mod record;

pub use machine::{random_customer, random_order, CustomerMachine};
pub use record::{Customer, CustomerAction, CustomerState};

use std::process;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use signal_hook::consts::{SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::iterator::exfiltrator::WithOrigin;
use signal_hook::iterator::SignalsInfo;
use tracing::{debug, info, warn};

use crate::config::BakeryConfig;
use crate::core::{block_all_signals, send_signal, Shutdown};
use crate::errors::{BakeryError, Result};
use crate::protocol::{Channels, OrderMessage, STATUS_MTYPE};
use crate::state::SharedGame;

/// Signal a seller sends to pick a customer.
pub const SELECT_SIGNAL: libc::c_int = SIGUSR1;
/// Signal a customer sends to make the manager drain its status channel.
pub const STATUS_SIGNAL: libc::c_int = SIGUSR2;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Event {
    Selected { seller_pid: i32 },
    Cancel,
}

fn listen_for_signals() -> Result<Receiver<Event>> {
    let mut signals = SignalsInfo::<WithOrigin>::new(&[SELECT_SIGNAL, SIGTERM, SIGINT])
        .map_err(BakeryError::SignalHook)?;
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for origin in signals.forever() {
            let event = if origin.signal == SELECT_SIGNAL {
                Event::Selected { seller_pid: origin.process.map(|p| p.pid).unwrap_or(0) }
            } else {
                Event::Cancel
            };
            if tx.send(event).is_err() {
                break;
            }
        }
    });
    Ok(rx)
}

/// Settles a service that broke off with `error`. A customer still in the
/// bakery walks out frustrated. One that already left may have lost its
/// terminal report on the way out, so the error is handed back and the
/// process exits with it.
fn recover(machine: &mut CustomerMachine, error: BakeryError) -> Result<()> {
    if machine.has_left() {
        return Err(error);
    }
    warn!(error = %error, state = %machine.state(), "service broke off");
    machine.communication_failed();
    Ok(())
}

pub struct CustomerProcess {
    cfg: BakeryConfig,
    machine: CustomerMachine,
    game: SharedGame,
    channels: Channels,
    manager_pid: i32,
    shutdown: Shutdown,
    rng: StdRng,
}

impl CustomerProcess {
    pub fn new(cfg: BakeryConfig, mut record: Customer, channels: Channels, manager_pid: i32) -> Result<CustomerProcess> {
        record.pid = process::id() as i32;
        let game = SharedGame::open(&cfg)?;
        let machine = CustomerMachine::new(record, cfg.customers.walk_ticks);
        Ok(CustomerProcess {
            cfg,
            machine,
            game,
            channels,
            manager_pid,
            shutdown: Shutdown::install()?,
            rng: StdRng::from_entropy(),
        })
    }

    fn pid(&self) -> i32 {
        self.machine.record().pid
    }

    pub fn run(mut self) -> Result<()> {
        let events = listen_for_signals()?;
        info!(id = self.machine.record().id, pid = self.pid(), patience = self.machine.patience(), "customer arrived");
        self.machine.start();
        self.flush()?;

        let period = Duration::from_millis(self.cfg.customers.tick_ms);
        let mut next_tick = Instant::now() + period;
        while !self.machine.has_left() {
            let timeout = next_tick.saturating_duration_since(Instant::now());
            match events.recv_timeout(timeout) {
                Ok(Event::Selected { seller_pid }) => {
                    match self.serve(seller_pid) {
                        Ok(()) => {}
                        Err(BakeryError::Cancelled) => {
                            self.cancel();
                            return Ok(());
                        }
                        Err(e) => {
                            recover(&mut self.machine, e)?;
                            self.flush()?;
                        }
                    }
                    next_tick = Instant::now() + period;
                }
                Ok(Event::Cancel) => {
                    self.cancel();
                    return Ok(());
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.on_tick()?;
                    next_tick += period;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(BakeryError::Logic("signal listener stopped".to_string()));
                }
            }
        }
        info!(id = self.machine.record().id, state = %self.machine.state(), "customer left");
        Ok(())
    }

    fn on_tick(&mut self) -> Result<()> {
        self.machine.tick();
        if !self.machine.has_left() {
            let cascade = self.game.with_cascade(|cascade, _| *cascade)?;
            let roll = self.rng.gen::<f64>();
            if self.machine.check_contagion(&cascade, roll, self.cfg.customers.cascade_probability) {
                info!(id = self.machine.record().id, complainer = cascade.complaining_pid, "walking out after a complaint");
            }
        }
        self.flush()
    }

    /// Order from `seller_pid` and wait, without timeout, for the reply.
    fn serve(&mut self, seller_pid: i32) -> Result<()> {
        if !self.machine.select() {
            debug!(state = %self.machine.state(), "selected while not waiting, ignoring");
            return Ok(());
        }
        self.flush()?;
        if seller_pid <= 0 {
            warn!("selection signal without a sender");
            self.machine.communication_failed();
            return self.flush();
        }

        let (lines, total) = random_order(&self.cfg, &mut self.rng);
        let order = OrderMessage::new(self.machine.record(), &lines, total)?;
        if let Err(e) = self.channels.orders.send(seller_pid as i64, &order) {
            warn!(error = %e, seller_pid, "could not place order");
            self.machine.communication_failed();
            return self.flush();
        }
        self.machine.order_sent();
        self.flush()?;

        let reply = self.channels.completions.recv(self.pid() as i64, &self.shutdown);
        match reply.and_then(|done| done.result()) {
            Ok(result) => {
                let roll = self.rng.gen::<f64>();
                self.machine.complete(result, roll, self.cfg.customers.complaint_probability);
            }
            Err(BakeryError::Cancelled) => return Err(BakeryError::Cancelled),
            Err(e) => {
                warn!(error = %e, "no usable completion");
                self.machine.communication_failed();
            }
        }
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        let reports = self.machine.drain_reports();
        if reports.is_empty() {
            return Ok(());
        }
        for status in &reports {
            self.channels.status.send(STATUS_MTYPE, status)?;
        }
        if let Err(e) = send_signal(self.manager_pid, STATUS_SIGNAL) {
            // The manager also polls, so a lost nudge only delays it.
            debug!(error = %e, "could not notify manager");
        }
        Ok(())
    }

    /// Abrupt cancellation: no more signals, no more ticks, no messages.
    fn cancel(self) {
        block_all_signals();
        debug!(pid = self.pid(), "customer cancelled");
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OrderResult;

    fn at_the_counter() -> CustomerMachine {
        let mut m = CustomerMachine::new(Customer::new(1, 10.0, 1.0), 0);
        m.start();
        assert!(m.select());
        m.drain_reports();
        m
    }

    #[test]
    fn broken_service_ends_frustrated() {
        let mut m = at_the_counter();
        recover(&mut m, BakeryError::Codec("bad order".to_string())).unwrap();
        assert!(m.has_left());
        assert_eq!(m.state(), CustomerState::Frustrated);
        let reports = m.drain_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].action().unwrap(), CustomerAction::LeaveFrustrated);
    }

    #[test]
    fn failure_after_leaving_is_returned() {
        let mut m = at_the_counter();
        m.order_sent();
        m.complete(OrderResult::Success, 1.0, 0.0);
        let err = recover(&mut m, BakeryError::Logic("status channel gone".to_string()));
        assert!(matches!(err, Err(BakeryError::Logic(_))));
        // The outcome stays the one the seller delivered.
        assert_eq!(m.state(), CustomerState::WaitingForOrder);
        assert_eq!(m.drain_reports().last().map(|s| s.action().unwrap()), Some(CustomerAction::LeaveNormal));
    }
}
