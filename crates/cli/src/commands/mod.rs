//! CLI command implementations

mod config;
mod run;
mod tree;

pub use config::{cmd_config_init, cmd_config_show};
pub use run::cmd_run;
pub use tree::cmd_tree;
