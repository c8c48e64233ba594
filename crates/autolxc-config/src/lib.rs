//! Configuration parsing for autolxc
//!
//! This crate handles the global configuration (`~/.config/autolxc/config.toml`)
//! and the `source:target[:ro]` mount syntax shared by the config file and CLI.

mod error;
mod global;
mod mount;

pub use error::*;
pub use global::*;
pub use mount::*;
