//! The process-wide game record and the handle every actor uses to reach it.
//!
//! Locking units:
//! - `inventory`: inventory guard
//! - `ready` and `daily_profit`: ready-products guard
//! - `cascade`, `counters.complained`, `counters.cascade`: cascade guard
//! - remaining counters, `active_customers`, `elapsed_secs`: written only by
//!   the customer manager (single writer, read unlocked by others)

use std::fmt;
use std::mem;
use std::ptr::NonNull;

use tracing::info;

use crate::config::{BakeryConfig, MAX_CATEGORIES, MAX_INGREDIENTS, MAX_PRODUCTS};
use crate::core::{now_secs, Segment, ShmemCast};
use crate::errors::{BakeryError, Result};
use crate::guard::NamedSemaphore;
use crate::protocol::OrderLine;

const GAME_STATE_MAGIC: u32 = 0x4261_6b65; // "Bake"

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Counters {
    pub served: u32,
    pub frustrated: u32,
    pub complained: u32,
    pub missing_order: u32,
    pub cascade: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
#[repr(C)]
pub struct CascadeState {
    recent_complaint: u32,
    pub complaining_pid: i32,
    pub last_complaint_time: f64,
}

impl CascadeState {
    pub fn is_recent(&self) -> bool {
        self.recent_complaint != 0
    }

    pub fn record_complaint(&mut self, pid: i32, now: f64) {
        self.recent_complaint = 1;
        self.complaining_pid = pid;
        self.last_complaint_time = now;
    }

    /// Clears the flag once more than `window` seconds have passed since the
    /// last complaint. Returns true when it cleared something.
    pub fn expire(&mut self, now: f64, window: f64) -> bool {
        if self.is_recent() && now - self.last_complaint_time > window {
            self.recent_complaint = 0;
            true
        } else {
            false
        }
    }

    /// A recent complaint raised by someone other than `pid`.
    pub fn is_contagious_for(&self, pid: i32) -> bool {
        self.is_recent() && self.complaining_pid != pid
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Shortage {
    pub ingredient: usize,
    pub needed: i32,
    pub available: i32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Inventory {
    len: u32,
    quantities: [i32; MAX_INGREDIENTS],
}

impl Inventory {
    pub fn new(initial: &[i32]) -> Inventory {
        let mut inv = Inventory { len: initial.len().min(MAX_INGREDIENTS) as u32, ..Default::default() };
        for (slot, q) in inv.quantities.iter_mut().zip(initial) {
            *slot = (*q).max(0);
        }
        inv
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn get(&self, ingredient: usize) -> Option<i32> {
        self.as_slice().get(ingredient).copied()
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.quantities[..self.len()]
    }

    pub fn add(&mut self, ingredient: usize, quantity: i32) -> Result<()> {
        let len = self.len();
        match self.quantities[..len].get_mut(ingredient) {
            Some(q) if quantity >= 0 => {
                *q = q.saturating_add(quantity);
                Ok(())
            }
            _ => Err(BakeryError::Logic(format!("cannot add {} of ingredient {}", quantity, ingredient))),
        }
    }

    /// Deducts every `(ingredient, quantity)` pair or none of them.
    pub fn try_deduct(&mut self, needs: &[(usize, i32)]) -> std::result::Result<(), Shortage> {
        let mut after = self.quantities;
        for &(ingredient, needed) in needs {
            let available = self.get(ingredient).unwrap_or(0);
            let left = if ingredient < self.len() { after[ingredient] } else { 0 };
            if ingredient >= self.len() || needed < 0 || left < needed {
                return Err(Shortage { ingredient, needed, available });
            }
            after[ingredient] = left - needed;
        }
        self.quantities = after;
        Ok(())
    }

    /// First ingredient, in index order, whose stock is below `low_water`.
    pub fn first_below(&self, low_water: i32) -> Option<(usize, i32)> {
        self.as_slice().iter().copied().enumerate().find(|&(_, q)| q < low_water)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FulfillError {
    /// A requested product has no stock at all (or is not in the catalog).
    Missing { category: u8, product: u8 },
    Insufficient { category: u8, product: u8, requested: i32, available: i32 },
}

impl fmt::Display for FulfillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FulfillError::Missing { category, product } => {
                write!(f, "product {}/{} is missing", category, product)
            }
            FulfillError::Insufficient { category, product, requested, available } => write!(
                f,
                "product {}/{}: {} requested, {} available",
                category, product, requested, available
            ),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ReadyProducts {
    quantities: [[i32; MAX_PRODUCTS]; MAX_CATEGORIES],
}

impl ReadyProducts {
    pub fn get(&self, category: usize, product: usize) -> i32 {
        self.quantities
            .get(category)
            .and_then(|c| c.get(product))
            .copied()
            .unwrap_or(0)
    }

    pub fn add(&mut self, category: usize, product: usize, quantity: i32) -> Result<()> {
        match self.quantities.get_mut(category).and_then(|c| c.get_mut(product)) {
            Some(q) if quantity >= 0 => {
                *q = q.saturating_add(quantity);
                Ok(())
            }
            _ => Err(BakeryError::Logic(format!(
                "cannot add {} of product {}/{}",
                quantity, category, product
            ))),
        }
    }

    /// Takes every line of the order out of stock, or nothing at all.
    pub fn fulfill(&mut self, lines: &[OrderLine]) -> std::result::Result<(), FulfillError> {
        let mut after = self.quantities;
        for line in lines {
            let (c, p) = (line.category as usize, line.product as usize);
            if c >= MAX_CATEGORIES || p >= MAX_PRODUCTS || self.quantities[c][p] <= 0 {
                return Err(FulfillError::Missing { category: line.category, product: line.product });
            }
            let requested = line.quantity as i32;
            if after[c][p] < requested {
                return Err(FulfillError::Insufficient {
                    category: line.category,
                    product: line.product,
                    requested,
                    available: self.quantities[c][p],
                });
            }
            after[c][p] -= requested;
        }
        self.quantities = after;
        Ok(())
    }
}

#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct GameState {
    magic: u32,
    pub active_customers: u32,
    pub start_time: f64,
    pub elapsed_secs: f64,
    pub daily_profit: f64,
    pub counters: Counters,
    pub cascade: CascadeState,
    pub inventory: Inventory,
    pub ready: ReadyProducts,
}

unsafe impl ShmemCast for GameState {}

impl GameState {
    pub fn new(cfg: &BakeryConfig, start_time: f64) -> GameState {
        let initial: Vec<i32> = cfg.ingredients.iter().map(|i| i.initial).collect();
        let mut ready = ReadyProducts::default();
        for (c, category) in cfg.catalog.iter().enumerate().take(MAX_CATEGORIES) {
            for (p, product) in category.products.iter().enumerate().take(MAX_PRODUCTS) {
                // Indices are in range and the amount is clamped, so this cannot fail.
                let _ = ready.add(c, p, product.initial.max(0));
            }
        }
        GameState {
            magic: GAME_STATE_MAGIC,
            active_customers: 0,
            start_time,
            elapsed_secs: 0.0,
            daily_profit: 0.0,
            counters: Counters::default(),
            cascade: CascadeState::default(),
            inventory: Inventory::new(&initial),
            ready,
        }
    }
}

/// Attached game-state segment plus the three guards of its mutable regions.
pub struct SharedGame {
    segment: Segment,
    state: NonNull<GameState>,
    inventory_guard: NamedSemaphore,
    ready_guard: NamedSemaphore,
    cascade_guard: NamedSemaphore,
}

impl SharedGame {
    /// Creates and initialises the segment and (re)creates its guards.
    pub fn create(cfg: &BakeryConfig) -> Result<SharedGame> {
        let segment = Segment::create(&cfg.shmem, &cfg.shmem.game_state_file_name, mem::size_of::<GameState>())?;
        let names = cfg.guard_names();
        let game = SharedGame::from_parts(
            segment,
            NamedSemaphore::reset(&names.inventory)?,
            NamedSemaphore::reset(&names.ready_products)?,
            NamedSemaphore::reset(&names.cascade)?,
        )?;
        unsafe { game.state.as_ptr().write(GameState::new(cfg, now_secs())) };
        info!(size = mem::size_of::<GameState>(), "game state created");
        Ok(game)
    }

    pub fn open(cfg: &BakeryConfig) -> Result<SharedGame> {
        let segment = Segment::open(&cfg.shmem, &cfg.shmem.game_state_file_name)?;
        let names = cfg.guard_names();
        let game = SharedGame::from_parts(
            segment,
            NamedSemaphore::open(&names.inventory)?,
            NamedSemaphore::open(&names.ready_products)?,
            NamedSemaphore::open(&names.cascade)?,
        )?;
        if game.read().magic != GAME_STATE_MAGIC {
            return Err(BakeryError::Logic("game state segment is not initialised".to_string()));
        }
        Ok(game)
    }

    fn from_parts(
        segment: Segment,
        inventory_guard: NamedSemaphore,
        ready_guard: NamedSemaphore,
        cascade_guard: NamedSemaphore,
    ) -> Result<SharedGame> {
        if segment.len() < mem::size_of::<GameState>() {
            return Err(BakeryError::Logic(format!(
                "game state segment has {} bytes, {} required",
                segment.len(),
                mem::size_of::<GameState>()
            )));
        }
        let state = NonNull::new(segment.as_ptr() as *mut GameState)
            .ok_or_else(|| BakeryError::Logic("null game state mapping".to_string()))?;
        Ok(SharedGame { segment, state, inventory_guard, ready_guard, cascade_guard })
    }

    #[inline]
    fn raw(&self) -> *mut GameState {
        self.state.as_ptr()
    }

    /// Unlocked copy of the whole record, for display and for fields with a
    /// single writer.
    pub fn read(&self) -> GameState {
        unsafe { self.raw().read_volatile() }
    }

    pub fn with_inventory<R, F>(&self, f: F) -> Result<R>
        where F: FnOnce(&mut Inventory) -> R,
    {
        let _held = self.inventory_guard.acquire()?;
        Ok(f(unsafe { &mut (*self.raw()).inventory }))
    }

    /// Ready products and the daily profit they earn share one guard.
    pub fn with_ready<R, F>(&self, f: F) -> Result<R>
        where F: FnOnce(&mut ReadyProducts, &mut f64) -> R,
    {
        let _held = self.ready_guard.acquire()?;
        let state = unsafe { &mut *self.raw() };
        Ok(f(&mut state.ready, &mut state.daily_profit))
    }

    pub fn with_cascade<R, F>(&self, f: F) -> Result<R>
        where F: FnOnce(&mut CascadeState, &mut Counters) -> R,
    {
        let _held = self.cascade_guard.acquire()?;
        let state = unsafe { &mut *self.raw() };
        Ok(f(&mut state.cascade, &mut state.counters))
    }

    /// Fields owned by the customer manager. Only the manager may call this.
    pub fn with_manager_fields<R, F>(&self, f: F) -> R
        where F: FnOnce(&mut ManagerFields<'_>) -> R,
    {
        let state = unsafe { &mut *self.raw() };
        let mut fields = ManagerFields {
            served: &mut state.counters.served,
            frustrated: &mut state.counters.frustrated,
            missing_order: &mut state.counters.missing_order,
            active_customers: &mut state.active_customers,
            elapsed_secs: &mut state.elapsed_secs,
            start_time: state.start_time,
        };
        f(&mut fields)
    }
}

pub struct ManagerFields<'a> {
    pub served: &'a mut u32,
    pub frustrated: &'a mut u32,
    pub missing_order: &'a mut u32,
    pub active_customers: &'a mut u32,
    pub elapsed_secs: &'a mut f64,
    pub start_time: f64,
}
