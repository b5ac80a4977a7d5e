pub mod commands;
pub mod config;

pub use commands::{print_json, App};
pub use config::{Account, CliConfig};
