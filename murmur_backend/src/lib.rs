pub mod actions;
pub mod config;
pub mod context;
pub mod database;
pub mod error;
pub mod events;
pub mod gate;
pub mod generation;
pub mod heartbeat;
pub mod llm_client;
pub mod model;
pub mod runtime;
pub mod server;
pub mod summary;

#[cfg(test)]
mod test_support;
