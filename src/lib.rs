//! Agent Lifecycle Library
//!
//! Correlates coding-agent hook notifications to agent records, drives the
//! per-agent task state machine, and serializes all task mutation per agent.

pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod hooks;
pub mod lifecycle;
pub mod serve;
pub mod types;
