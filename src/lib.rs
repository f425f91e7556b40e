//! Submission and monitoring orchestrator for metered assessments.
//!
//! A [`Workflow`](orchestrator::Workflow) takes a scored assessment, reserves
//! its token cost, submits it at most once per idempotency key, then follows
//! the resulting job over a push channel and a polling fallback until it
//! completes, fails or is cancelled. Every timer it creates lives in a
//! [`TimerRegistry`](timer::TimerRegistry) and is cleared with the job.

pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod guard;
pub mod ledger;
pub mod monitor;
pub mod orchestrator;
pub mod reconcile;
pub mod sim;
pub mod state_machine;
pub mod timer;
pub mod ui;
