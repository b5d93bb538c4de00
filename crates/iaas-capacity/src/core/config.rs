//! Capacity configuration.

pub mod capacity_config;
pub mod keys;
pub mod options;
pub mod resolver;
