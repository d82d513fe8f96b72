use std::error::Error;
use std::process::Child;
use std::thread;
use std::time::{Duration, Instant};

use bakery::guard::NamedSemaphore;
use bakery::launch::{Launcher, Role};
use bakery::queue::SharedQueue;
use bakery::state::{GameState, SharedGame};
use bakery::{send_signal, BakeryConfig, Channels, Shutdown};
use signal_hook::consts::SIGTERM;
use tracing::{debug, info, warn};

const REPORT_EVERY: Duration = Duration::from_secs(5);

fn load(path: &str) -> Result<BakeryConfig, Box<dyn Error>> {
    let cfg: BakeryConfig = confy::load_path(path)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Owns everything the simulation creates and releases it exactly once.
struct Bakery {
    cfg: BakeryConfig,
    game: Option<SharedGame>,
    channels: Channels,
    workers: Vec<(Role, Child)>,
}

impl Bakery {
    fn open(cfg: BakeryConfig) -> Result<Bakery, Box<dyn Error>> {
        let game = SharedGame::create(&cfg)?;
        let channels = match Channels::create() {
            Ok(channels) => channels,
            Err(e) => {
                drop(game);
                unlink_guards(&cfg);
                return Err(e.into());
            }
        };
        Ok(Bakery { cfg, game: Some(game), channels, workers: Vec::new() })
    }

    fn start_workers(&mut self) -> Result<(), Box<dyn Error>> {
        let launcher = Launcher::new(std::env::current_exe()?, &self.cfg, self.channels.ids())?;
        let mut roles = vec![Role::Manager, Role::Supply];
        roles.extend((0..self.cfg.chefs.count).map(Role::Chef));
        roles.extend((0..self.cfg.sellers.count).map(Role::Seller));
        for role in roles {
            let child = launcher.spawn(role)?;
            info!(?role, pid = child.id(), "worker started");
            self.workers.push((role, child));
        }
        Ok(())
    }

    /// Logs workers that stopped on their own. The day goes on without them.
    fn check_workers(&mut self) {
        self.workers.retain_mut(|(role, child)| match child.try_wait() {
            Ok(Some(status)) => {
                warn!(?role, %status, "worker stopped early");
                false
            }
            _ => true,
        });
    }

    fn close(&mut self) {
        let game = match self.game.take() {
            Some(game) => game,
            None => return,
        };
        for (role, child) in &self.workers {
            if let Err(e) = send_signal(child.id() as i32, SIGTERM) {
                debug!(?role, error = %e, "worker already gone");
            }
        }
        for (role, mut child) in self.workers.drain(..) {
            match child.wait() {
                Ok(status) => debug!(?role, %status, "worker stopped"),
                Err(e) => warn!(?role, error = %e, "could not wait for worker"),
            }
        }
        report(&game.read());
        if let Err(e) = self.channels.remove_all() {
            warn!(error = %e, "could not remove message channels");
        }
        drop(game);
        unlink_guards(&self.cfg);
        info!("bakery closed");
    }
}

impl Drop for Bakery {
    fn drop(&mut self) {
        self.close();
    }
}

fn unlink_guards(cfg: &BakeryConfig) {
    for name in cfg.guard_names().all() {
        if let Err(e) = NamedSemaphore::unlink(name) {
            warn!(name, error = %e, "could not remove guard");
        }
    }
}

fn report(state: &GameState) {
    let c = &state.counters;
    info!(
        elapsed = %format!("{:.1}s", state.elapsed_secs),
        active = state.active_customers,
        served = c.served,
        frustrated = c.frustrated,
        complained = c.complained,
        missing = c.missing_order,
        cascade = c.cascade,
        profit = %format!("{:.2}", state.daily_profit),
        "bakery"
    );
}

pub fn run(path: &str) -> Result<(), Box<dyn Error>> {
    let cfg = load(path)?;
    let shutdown = Shutdown::install()?;
    let tick = Duration::from_millis(cfg.simulation.tick_ms.max(1));
    let duration = match cfg.simulation.duration_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };

    let mut bakery = Bakery::open(cfg)?;
    bakery.start_workers()?;
    info!(?duration, "bakery open");

    let started = Instant::now();
    let mut last_report = Instant::now();
    while !shutdown.is_closing() {
        if duration.map_or(false, |d| started.elapsed() >= d) {
            info!("closing time");
            break;
        }
        bakery.check_workers();
        if last_report.elapsed() >= REPORT_EVERY {
            if let Some(game) = &bakery.game {
                report(&game.read());
            }
            last_report = Instant::now();
        }
        thread::sleep(tick);
    }
    bakery.close();
    Ok(())
}

pub fn status(path: &str) -> Result<(), Box<dyn Error>> {
    let cfg = load(path)?;
    let game = SharedGame::open(&cfg)?;
    let state = game.read();
    println!("elapsed        {:.1}s", state.elapsed_secs);
    println!("active         {}", state.active_customers);
    println!("served         {}", state.counters.served);
    println!("frustrated     {}", state.counters.frustrated);
    println!("complained     {}", state.counters.complained);
    println!("missing order  {}", state.counters.missing_order);
    println!("cascade        {}", state.counters.cascade);
    println!("daily profit   {:.2}", state.daily_profit);
    println!("recent complaint {}", state.cascade.is_recent());

    println!("inventory");
    for (ingredient, quantity) in cfg.ingredients.iter().zip(state.inventory.as_slice()) {
        println!("  {:<12} {}", ingredient.name, quantity);
    }
    println!("ready products");
    for (c, category) in cfg.catalog.iter().enumerate() {
        for (p, product) in category.products.iter().enumerate() {
            println!("  {:<18} {}", product.name, state.ready.get(c, p));
        }
    }
    match SharedQueue::open(&cfg).and_then(|queue| queue.snapshot()) {
        Ok(queue) => {
            println!("queue ({})", queue.len());
            for c in queue {
                println!("  #{:<4} pid {:<7} {:<18} patience {:.1}", c.id, c.pid, c.state().to_string(), c.patience);
            }
        }
        Err(e) => println!("queue unavailable: {}", e),
    }
    Ok(())
}
