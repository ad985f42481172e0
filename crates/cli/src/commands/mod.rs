//! Subcommand implementations

pub mod glideins;
pub mod jobs;
pub mod observe;
