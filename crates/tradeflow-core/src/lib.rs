//! # Tradeflow Core
//!
//! Error taxonomy and configuration shared by the scheduler crate and the
//! `tradeflow` binary.

pub mod config;
pub mod error;

pub use config::{
    LoggingConfig, OverflowPolicy, SchedulerConfig, StateBackend, StateConfig, TradeflowConfig,
};
pub use error::{Result, TradeflowError};
