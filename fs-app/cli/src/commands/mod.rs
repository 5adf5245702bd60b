//! Subcommands of the extfs CLI

pub mod mkfs;
pub mod shell;
