pub mod aggregator;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod orchestrator;
pub mod resource;
pub mod transport;

pub use error::{Error, Result};
