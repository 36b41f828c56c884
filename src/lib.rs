pub mod config;
pub mod errors;
pub mod phase;
pub mod pipeline;
pub mod server;
