//! Operating system implementations of the collaborator traits

mod listeners;
mod mount_table;
mod pty;
mod runner;

pub use listeners::ProcListenerQuery;
pub use mount_table::SystemMountTable;
pub use pty::NativePty;
pub use runner::SystemRunner;
