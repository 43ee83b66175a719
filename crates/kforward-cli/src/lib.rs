//! Command-line front end and daemon for kforward

pub mod config;
pub mod daemon;
pub mod ipc;
pub mod store;
