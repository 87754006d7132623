//! Domus — a KNX/IP home-automation logic runtime.
//!
//! The core is a data-flow engine: user-configured blocks are wired to bus
//! addresses (external KNX group addresses and internal IKOs), value changes
//! propagate through a single-threaded scheduler, remanent block state
//! survives restarts, and every change fans out to telegram subscribers.

pub mod address;
pub mod bindings;
pub mod blocks;
pub mod bus;
pub mod config;
pub mod dpt;
pub mod gateway;
pub mod persist;
pub mod remanent;
pub mod scheduler;
pub mod server;
pub mod telegram;
pub mod types;
pub mod value;

pub use address::{AddressKey, GroupAddress};
pub use bus::{Address, AddressBus, AddressDescriptor};
pub use scheduler::{Runtime, RuntimeConfig, RuntimeHandle};
pub use telegram::{Telegram, TelegramBroadcaster};
pub use types::{Direction, Error, Origin, Result};
pub use value::{PortType, Value};
