//! Control/treatment experiments for coding agents.
//!
//! The orchestrator copies each repository into a throwaway workspace, runs
//! every task once per worker type, and turns the run results into group
//! statistics, a lift summary and a release-gate verdict.

pub mod classify;
pub mod config;
pub mod context;
pub mod executor;
pub mod gate;
pub mod log;
pub mod orchestrator;
pub mod paths;
pub mod prompt;
pub mod report;
pub mod selection;
pub mod stats;
pub mod supervisor;
pub mod task;
pub mod verification;
