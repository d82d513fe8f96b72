use clap::{Parser, Subcommand};

use std::error::Error;
use std::process;

use bakery::chef::ChefProcess;
use bakery::customer::{Customer, CustomerProcess};
use bakery::manager::CustomerManager;
use bakery::launch::Launcher;
use bakery::seller::Seller;
use bakery::supply::SupplyChain;
use bakery::{BakeryConfig, BakeryError, ChannelIds, Channels};
use tracing::error;

mod run;

#[derive(Parser)]
#[clap(name = "bakery-sim", about = "Multi-process bakery simulation")]
struct Opts {
    #[clap(subcommand)]
    command: Command,
}

/// What a spawned worker is handed on its command line.
#[derive(clap::Args)]
struct WorkerArgs {
    /// Encoded configuration record.
    #[clap(long)]
    config: String,
    /// Encoded message channel ids.
    #[clap(long)]
    channels: String,
}

impl WorkerArgs {
    fn decode(&self) -> Result<(BakeryConfig, ChannelIds), BakeryError> {
        Ok((BakeryConfig::decode(&self.config)?, self.channels.parse()?))
    }
}

#[derive(Subcommand)]
enum Command {
    /// Create the shared state, start every worker and run the day.
    Run {
        #[clap(short = 'c', long = "config", default_value = "bakery.toml")]
        config: String,
    },
    /// Print the shared game state of a running simulation.
    Status {
        #[clap(short = 'c', long = "config", default_value = "bakery.toml")]
        config: String,
    },
    #[clap(hide = true)]
    Manager(WorkerArgs),
    #[clap(hide = true)]
    Seller {
        #[clap(long)]
        id: u32,
        #[clap(flatten)]
        worker: WorkerArgs,
    },
    #[clap(hide = true)]
    Chef {
        #[clap(long)]
        id: u32,
        #[clap(flatten)]
        worker: WorkerArgs,
    },
    #[clap(hide = true)]
    Supply(WorkerArgs),
    #[clap(hide = true)]
    Customer {
        #[clap(long)]
        record: String,
        #[clap(long = "manager-pid")]
        manager_pid: i32,
        #[clap(flatten)]
        worker: WorkerArgs,
    },
}

impl Command {
    fn role(&self) -> &'static str {
        match self {
            Command::Run { .. } => "run",
            Command::Status { .. } => "status",
            Command::Manager(_) => "manager",
            Command::Seller { .. } => "seller",
            Command::Chef { .. } => "chef",
            Command::Supply(_) => "supply",
            Command::Customer { .. } => "customer",
        }
    }
}

fn main() {
    let opts: Opts = Opts::parse();
    bakery::init_tracing();
    let span = bakery::role_span(opts.command.role());
    let _entered = span.enter();
    if let Err(e) = dispatch(opts.command) {
        error!(error = %e, "exiting");
        process::exit(1);
    }
}

fn dispatch(command: Command) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Run { config } => run::run(&config),
        Command::Status { config } => run::status(&config),
        Command::Manager(worker) => {
            let (cfg, ids) = worker.decode()?;
            let launcher = Launcher::from_encoded(std::env::current_exe()?, worker.config, ids);
            CustomerManager::new(cfg, Channels::from_ids(&ids), launcher)?.run()?;
            Ok(())
        }
        Command::Seller { id, worker } => {
            let (cfg, ids) = worker.decode()?;
            Seller::new(id, cfg, Channels::from_ids(&ids))?.run()?;
            Ok(())
        }
        Command::Chef { id, worker } => {
            let (cfg, ids) = worker.decode()?;
            ChefProcess::new(id, cfg, Channels::from_ids(&ids))?.run()?;
            Ok(())
        }
        Command::Supply(worker) => {
            let (cfg, ids) = worker.decode()?;
            SupplyChain::new(cfg, Channels::from_ids(&ids))?.run()?;
            Ok(())
        }
        Command::Customer { record, manager_pid, worker } => {
            let (cfg, ids) = worker.decode()?;
            let record = Customer::decode(&record)?;
            CustomerProcess::new(cfg, record, Channels::from_ids(&ids), manager_pid)?.run()?;
            Ok(())
        }
    }
}
