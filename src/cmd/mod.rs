//! CLI command implementations.
//!
//! | Module    | Commands handled            |
//! |-----------|-----------------------------|
//! | `serve`   | `Serve`                     |
//! | `phases`  | `Phases`                    |
//! | `config`  | `Config show`, `Config init`|

pub mod config;
pub mod phases;
pub mod serve;

pub use config::cmd_config;
pub use phases::cmd_phases;
pub use serve::{ServeArgs, cmd_serve};
