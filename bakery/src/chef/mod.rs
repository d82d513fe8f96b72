//! Chefs turn ingredients into ready products and ask the supply chain for
//! more ingredients when stock runs low. A chef has at most one restock
//! request in flight.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::BakeryConfig;
use crate::core::Shutdown;
use crate::errors::Result;
use crate::protocol::{confirmation_mtype, Channels, RestockConfirmation, RestockRequest, RESTOCK_MTYPE};
use crate::state::{Inventory, SharedGame};

/// `10 / (stock + 1)`, bounded to 1..=10. Emptier means more urgent.
pub fn urgency(stock: i32) -> u32 {
    (10 / (stock.max(0) + 1)).clamp(1, 10) as u32
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chef {
    id: u32,
    waiting: bool,
    next_product: usize,
}

impl Chef {
    pub fn new(id: u32) -> Chef {
        Chef { id, waiting: false, next_product: 0 }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_waiting_for_ingredients(&self) -> bool {
        self.waiting
    }

    /// Request for the first ingredient below `low_water`, topping it up to
    /// `target`. Nothing while a request is outstanding. Call with the
    /// inventory guard held and send after releasing it.
    pub fn plan_restock(&self, inventory: &Inventory, low_water: i32, target: i32) -> Option<RestockRequest> {
        if self.waiting {
            return None;
        }
        let (ingredient, stock) = inventory.first_below(low_water)?;
        Some(RestockRequest {
            chef_id: self.id,
            ingredient: ingredient as u32,
            quantity: (target - stock).max(1),
            urgency: urgency(stock),
        })
    }

    pub fn on_sent(&mut self) {
        self.waiting = true;
    }

    /// Clears the waiting flag when `confirmation` answers this chef.
    pub fn on_confirmation(&mut self, confirmation: &RestockConfirmation) -> bool {
        if self.waiting && confirmation.chef_id == self.id {
            self.waiting = false;
            true
        } else {
            false
        }
    }

    /// Next (category, product) to bake. Each chef works one category and
    /// cycles through its products.
    pub fn next_recipe(&mut self, cfg: &BakeryConfig) -> Option<(usize, usize)> {
        if cfg.catalog.is_empty() {
            return None;
        }
        let category = self.id as usize % cfg.catalog.len();
        let products = cfg.catalog[category].products.len();
        if products == 0 {
            return None;
        }
        let product = self.next_product % products;
        self.next_product = self.next_product.wrapping_add(1);
        Some((category, product))
    }
}

pub struct ChefProcess {
    chef: Chef,
    cfg: BakeryConfig,
    game: SharedGame,
    channels: Channels,
    shutdown: Shutdown,
}

impl ChefProcess {
    pub fn new(id: u32, cfg: BakeryConfig, channels: Channels) -> Result<ChefProcess> {
        Ok(ChefProcess {
            chef: Chef::new(id),
            game: SharedGame::open(&cfg)?,
            cfg,
            channels,
            shutdown: Shutdown::install()?,
        })
    }

    pub fn run(mut self) -> Result<()> {
        info!(chef = self.chef.id(), "chef at the oven");
        let poll = Duration::from_millis(self.cfg.chefs.poll_interval_ms.max(1));
        let bake_every = Duration::from_millis(self.cfg.chefs.bake_interval_ms);
        let mut next_bake = Instant::now() + bake_every;
        while !self.shutdown.is_closing() {
            self.check_confirmation()?;
            self.check_stock()?;
            if Instant::now() >= next_bake {
                self.bake()?;
                next_bake = Instant::now() + bake_every;
            }
            thread::sleep(poll);
        }
        info!(chef = self.chef.id(), "chef done");
        Ok(())
    }

    fn check_confirmation(&mut self) -> Result<()> {
        let mtype = confirmation_mtype(self.chef.id());
        while let Some(confirmation) = self.channels.restock_confirmations.try_recv(mtype)? {
            if self.chef.on_confirmation(&confirmation) {
                debug!(chef = self.chef.id(), ingredient = confirmation.ingredient, quantity = confirmation.quantity, "restock arrived");
            }
        }
        Ok(())
    }

    fn check_stock(&mut self) -> Result<()> {
        let (low, target) = (self.cfg.chefs.low_water, self.cfg.chefs.target_level);
        let chef = &self.chef;
        let request = self.game.with_inventory(|inventory| chef.plan_restock(inventory, low, target))?;
        if let Some(request) = request {
            match self.channels.restock_requests.send(RESTOCK_MTYPE, &request) {
                Ok(()) => {
                    self.chef.on_sent();
                    info!(chef = self.chef.id(), ingredient = request.ingredient, quantity = request.quantity, urgency = request.urgency, "restock requested");
                }
                Err(e) => warn!(chef = self.chef.id(), error = %e, "restock request not sent"),
            }
        }
        Ok(())
    }

    /// Deducts one unit's recipe under the inventory guard, then adds the
    /// unit under the ready-products guard. The guards are never nested.
    fn bake(&mut self) -> Result<()> {
        let (category, product) = match self.chef.next_recipe(&self.cfg) {
            Some(next) => next,
            None => return Ok(()),
        };
        let recipe: Vec<(usize, i32)> = match self.cfg.product(category, product) {
            Some(p) => p.recipe.iter().map(|r| (r.ingredient, r.quantity)).collect(),
            None => return Ok(()),
        };
        match self.game.with_inventory(|inventory| inventory.try_deduct(&recipe))? {
            Ok(()) => {
                self.game.with_ready(|ready, _| ready.add(category, product, 1))??;
                debug!(chef = self.chef.id(), category, product, "baked");
            }
            Err(shortage) => {
                debug!(chef = self.chef.id(), ingredient = shortage.ingredient, needed = shortage.needed, available = shortage.available, "not enough to bake");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirmation(chef_id: u32) -> RestockConfirmation {
        RestockConfirmation { chef_id, ingredient: 0, quantity: 10 }
    }

    #[test]
    fn urgency_grows_as_stock_shrinks() {
        assert_eq!(urgency(0), 10);
        assert_eq!(urgency(1), 5);
        assert_eq!(urgency(4), 2);
        assert_eq!(urgency(9), 1);
        assert_eq!(urgency(100), 1);
        assert_eq!(urgency(-3), 10);
    }

    #[test]
    fn restock_targets_first_low_ingredient() {
        let chef = Chef::new(2);
        let inventory = Inventory::new(&[50, 3, 1]);
        let request = chef.plan_restock(&inventory, 5, 30).unwrap();
        assert_eq!(request, RestockRequest { chef_id: 2, ingredient: 1, quantity: 27, urgency: 2 });
        assert_eq!(chef.plan_restock(&Inventory::new(&[50, 50]), 5, 30), None);
    }

    #[test]
    fn at_most_one_request_in_flight() {
        let mut chef = Chef::new(1);
        let low = Inventory::new(&[0]);
        assert!(!chef.is_waiting_for_ingredients());
        assert!(chef.plan_restock(&low, 5, 30).is_some());
        chef.on_sent();
        assert!(chef.is_waiting_for_ingredients());
        assert_eq!(chef.plan_restock(&low, 5, 30), None);

        assert!(!chef.on_confirmation(&confirmation(2)));
        assert!(chef.is_waiting_for_ingredients());
        assert!(chef.on_confirmation(&confirmation(1)));
        assert!(!chef.is_waiting_for_ingredients());
        assert!(!chef.on_confirmation(&confirmation(1)));
        assert!(chef.plan_restock(&low, 5, 30).is_some());
    }

    #[test]
    fn chefs_cycle_their_category() {
        let cfg = BakeryConfig::default();
        let mut chef = Chef::new(1);
        let products = cfg.catalog[1].products.len();
        let picks: Vec<_> = (0..products + 1).map(|_| chef.next_recipe(&cfg).unwrap()).collect();
        assert!(picks.iter().all(|&(c, _)| c == 1));
        assert_eq!(picks[0], picks[products]);
    }
}
