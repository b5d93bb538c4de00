//! Capacity accounting and admission control.

pub mod admission;
pub mod allocator;
pub mod calculator;
pub mod common;
pub mod config;
pub mod directory;
pub mod error;
pub mod hypervisor;
pub mod ledger;
pub mod pool_admission;
pub mod reconciler;
pub mod store;
pub mod workload;
