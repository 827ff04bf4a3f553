//! sshubl CLI library
//!
//! Command implementations, terminal prompts and output formatting for the
//! `sshubl` binary.

pub mod commands;
pub mod output;
pub mod prompt;
