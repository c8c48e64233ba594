//! autolxc CLI library
//!
//! The command implementations live here so they can be driven from tests
//! with a mocked runtime.

pub mod commands;
