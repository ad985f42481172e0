//! Observer and submitter tool for a glidein pool

pub mod client;
pub mod commands;
pub mod config;
pub mod output;
