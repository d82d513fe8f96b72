mod core;
mod errors;
mod trace;
pub mod channel;
pub mod chef;
pub mod config;
pub mod customer;
pub mod guard;
pub mod launch;
pub mod manager;
pub mod protocol;
pub mod queue;
pub mod seller;
pub mod state;
pub mod supply;

#[cfg(test)]
mod tests;

pub use crate::core::{now_secs, send_signal, Segment, ShmemCast, ShmemConfig, Shutdown};
pub use crate::errors::{BakeryError, Result};
pub use crate::trace::{init_tracing, role_span};
pub use config::BakeryConfig;
pub use protocol::{ChannelIds, Channels};
