//! Subcommand implementations

pub mod import;
pub mod init;
pub mod tables;
