//! Counter staff. A seller takes the customer at the head of the queue, lets
//! go of the queue, and serves that one customer to completion.

use std::fmt;
use std::process;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::BakeryConfig;
use crate::core::{send_signal, Shutdown};
use crate::customer::{Customer, SELECT_SIGNAL};
use crate::errors::{BakeryError, Result};
use crate::protocol::{Channels, CompletionMessage, OrderMessage, OrderResult};
use crate::queue::{BoundedQueue, QueueError, SharedQueue};
use crate::state::{FulfillError, ReadyProducts, SharedGame};

const ORDER_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SellerState {
    Idle,
    TakingOrder,
    ProcessingOrder,
    CompletingOrder,
}

impl fmt::Display for SellerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SellerState::Idle => "IDLE",
            SellerState::TakingOrder => "TAKING_ORDER",
            SellerState::ProcessingOrder => "PROCESSING_ORDER",
            SellerState::CompletingOrder => "COMPLETING_ORDER",
        };
        f.write_str(name)
    }
}

/// Prices `order` from the catalog and takes it out of `ready`, all lines or
/// none. Call with the ready-products guard held. Failed and missing orders
/// are priced at zero and earn nothing.
pub fn settle(cfg: &BakeryConfig, ready: &mut ReadyProducts, profit: &mut f64, order: &OrderMessage) -> (OrderResult, f32) {
    let mut total = 0.0f32;
    for line in order.lines() {
        match cfg.product(line.category as usize, line.product as usize) {
            Some(product) => total += product.price * line.quantity as f32,
            None => return (OrderResult::Missing, 0.0),
        }
    }
    match ready.fulfill(order.lines()) {
        Ok(()) => {
            *profit += total as f64;
            (OrderResult::Success, total)
        }
        Err(FulfillError::Missing { .. }) => (OrderResult::Missing, 0.0),
        Err(FulfillError::Insufficient { .. }) => (OrderResult::Failed, 0.0),
    }
}

/// Dequeues the head customer once it has checked in. Until then the head
/// is a process still starting up (possibly without a pid yet) and the
/// queue counts as empty. Call with the queue guard held.
pub fn take_head(queue: &mut BoundedQueue<'_, Customer>) -> std::result::Result<Customer, QueueError> {
    match queue.front() {
        Ok(head) if !head.is_checked_in() => Err(QueueError::Empty),
        Ok(_) => queue.dequeue(),
        Err(e) => Err(e),
    }
}

pub struct Seller {
    id: u32,
    pid: i32,
    cfg: BakeryConfig,
    game: SharedGame,
    queue: SharedQueue,
    channels: Channels,
    shutdown: Shutdown,
    state: SellerState,
}

impl Seller {
    /// Attaches to the game state and, once the manager has created it, the
    /// customer queue.
    pub fn new(id: u32, cfg: BakeryConfig, channels: Channels) -> Result<Seller> {
        let shutdown = Shutdown::install()?;
        let game = SharedGame::open(&cfg)?;
        let idle = Duration::from_millis(cfg.sellers.idle_ms);
        let queue = loop {
            shutdown.ensure_not_closing()?;
            match SharedQueue::open(&cfg) {
                Ok(queue) => break queue,
                Err(e) => {
                    debug!(error = %e, "customer queue not ready");
                    thread::sleep(idle);
                }
            }
        };
        Ok(Seller {
            id,
            pid: process::id() as i32,
            cfg,
            game,
            queue,
            channels,
            shutdown,
            state: SellerState::Idle,
        })
    }

    fn enter(&mut self, state: SellerState) {
        debug!(seller = self.id, from = %self.state, to = %state, "seller state");
        self.state = state;
    }

    pub fn run(mut self) -> Result<()> {
        info!(seller = self.id, pid = self.pid, "seller open");
        let idle = Duration::from_millis(self.cfg.sellers.idle_ms);
        while !self.shutdown.is_closing() {
            let next = self.queue.with_queue(take_head)?;
            match next {
                Ok(customer) => match self.serve(customer) {
                    Ok(()) | Err(BakeryError::Cancelled) => {}
                    Err(e) => warn!(seller = self.id, customer = customer.id, error = %e, "service failed"),
                },
                Err(QueueError::Empty) => thread::sleep(idle),
                Err(e) => return Err(e.into()),
            }
            self.enter(SellerState::Idle);
        }
        info!(seller = self.id, "seller closed");
        Ok(())
    }

    fn serve(&mut self, customer: Customer) -> Result<()> {
        self.enter(SellerState::TakingOrder);
        send_signal(customer.pid, SELECT_SIGNAL)?;
        let order = match self.wait_for_order(customer.pid)? {
            Some(order) => order,
            None => {
                info!(seller = self.id, customer = customer.id, "customer gone before ordering");
                return Ok(());
            }
        };

        self.enter(SellerState::ProcessingOrder);
        let cfg = &self.cfg;
        let (result, price) = self.game.with_ready(|ready, profit| settle(cfg, ready, profit, &order))?;

        self.enter(SellerState::CompletingOrder);
        let reply = CompletionMessage::new(order.customer_id, result, price);
        self.channels.completions.send(order.customer_pid as i64, &reply)?;
        info!(seller = self.id, customer = order.customer_id, ?result, price, "order completed");
        Ok(())
    }

    /// Waits for the order addressed to this seller. No timeout: it ends when
    /// the order arrives, the customer process no longer exists, or shutdown.
    fn wait_for_order(&self, customer_pid: i32) -> Result<Option<OrderMessage>> {
        loop {
            self.shutdown.ensure_not_closing()?;
            if let Some(order) = self.channels.orders.try_recv(self.pid as i64)? {
                if order.customer_pid != customer_pid {
                    warn!(seller = self.id, from = order.customer_pid, "order from a customer not being served, dropped");
                    continue;
                }
                return Ok(Some(order));
            }
            if send_signal(customer_pid, 0).is_err() {
                return Ok(None);
            }
            thread::sleep(ORDER_POLL);
        }
    }
}
