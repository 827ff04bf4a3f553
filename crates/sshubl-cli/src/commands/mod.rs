//! CLI command implementations

mod check;
mod config;
mod shell;
mod up;

pub use check::check_command;
pub use config::{config_init, config_show};
pub use shell::shell_command;
pub use up::{up_command, MountArg, UpArgs};
