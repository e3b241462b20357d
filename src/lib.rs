//! Live terminal dashboard for an EVM chain: slot/epoch aggregation fed by
//! beacon and execution node subscriptions.

pub mod aggregator;
pub mod beacon;
pub mod config;
pub mod execution;
pub mod render;
pub mod source;
pub mod supervisor;
pub mod ui;
