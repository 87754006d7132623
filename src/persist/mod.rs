// Persistence
//
// Four artifacts live on disk: the address DB (sqlite), the logic config
// (blocks + bindings + pages, JSON), advisory editor positions (inside the
// same JSON), and the remanent snapshot (see `remanent`). All JSON writes
// are atomic; loads are lenient.

mod addr_db;
mod config;

pub use addr_db::AddressDb;
pub use config::{load_config, save_config_atomic, Backup, BlockConfig, LogicConfig, Page};
