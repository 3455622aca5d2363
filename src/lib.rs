pub mod config;
pub mod convert;
pub mod db;
pub mod discord;
pub mod error;
pub mod indexer;
pub mod mirror;
pub mod model;
pub mod remote;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;

/// Shared state handed to the gateway event handler
pub struct Data {
    pub sync: std::sync::Arc<sync::SyncEngine>,
}

pub type Error = Box<dyn std::error::Error + Send + Sync>;
