//! # topostore
//!
//! Application layer over `topostore-core`: configuration, the HTTP API and
//! the command line. `main.rs` only sets up logging and dispatches here.

pub mod api;
pub mod cli;
pub mod config;
pub mod topology;

pub use config::Config;
pub use topology::Topology;
