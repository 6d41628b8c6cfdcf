//! SMT Pulse Library
//!
//! Smart-money divergence, liquidity and session analysis for index futures

pub mod analysis;
pub mod cache;
pub mod config;
pub mod error;
pub mod feed;
pub mod killzone;
pub mod notify;
pub mod orchestrator;
pub mod types;
