//! The supply chain: serves restock requests one at a time, in arrival order.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::BakeryConfig;
use crate::core::Shutdown;
use crate::errors::{BakeryError, Result};
use crate::protocol::{confirmation_mtype, Channels, RestockConfirmation, RestockRequest, RESTOCK_MTYPE};
use crate::state::SharedGame;

const SLICE: Duration = Duration::from_millis(20);

/// `base / urgency`, urgency taken as at least 1.
pub fn delivery_delay(base: Duration, urgency: u32) -> Duration {
    base / urgency.max(1)
}

pub struct SupplyChain {
    cfg: BakeryConfig,
    game: SharedGame,
    channels: Channels,
    shutdown: Shutdown,
}

impl SupplyChain {
    pub fn new(cfg: BakeryConfig, channels: Channels) -> Result<SupplyChain> {
        Ok(SupplyChain { game: SharedGame::open(&cfg)?, cfg, channels, shutdown: Shutdown::install()? })
    }

    pub fn run(self) -> Result<()> {
        info!("supply chain open");
        loop {
            // Urgency only sets the delay; requests are never reordered.
            let request = match self.channels.restock_requests.recv(RESTOCK_MTYPE, &self.shutdown) {
                Ok(request) => request,
                Err(BakeryError::Cancelled) => break,
                Err(e) => return Err(e),
            };
            match self.deliver(&request) {
                Ok(()) => {}
                Err(BakeryError::Cancelled) => break,
                Err(e) => warn!(chef = request.chef_id, error = %e, "delivery failed"),
            }
        }
        info!("supply chain closed");
        Ok(())
    }

    fn deliver(&self, request: &RestockRequest) -> Result<()> {
        let delay = delivery_delay(Duration::from_millis(self.cfg.supply.base_delay_ms), request.urgency);
        self.wait(delay)?;
        let (ingredient, quantity) = (request.ingredient as usize, request.quantity.max(0));
        self.game.with_inventory(|inventory| inventory.add(ingredient, quantity))??;
        let confirmation = RestockConfirmation { chef_id: request.chef_id, ingredient: request.ingredient, quantity };
        self.channels.restock_confirmations.send(confirmation_mtype(request.chef_id), &confirmation)?;
        info!(chef = request.chef_id, ingredient, quantity, ?delay, "delivered");
        Ok(())
    }

    fn wait(&self, delay: Duration) -> Result<()> {
        let until = Instant::now() + delay;
        loop {
            self.shutdown.ensure_not_closing()?;
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            thread::sleep(SLICE.min(until - now));
        }
    }
}
