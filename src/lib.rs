//! Live log reconciliation and tab view state for test-execution drawers.
//!
//! A drawer shows one execution's terminal log, its artifacts, and its AI
//! analysis. The log arrives from two sources: a live stream of increments
//! and an on-demand historical snapshot. [`reconcile`] merges the two,
//! [`hydration`] decides when a snapshot is taken and which result is still
//! wanted, and [`tabs`] derives which tab is shown. [`drawer`] ties them into
//! one state machine with a threaded runtime around it.

pub mod config;
pub mod drawer;
pub mod error;
pub mod execution;
pub mod foreground;
pub mod hydration;
pub mod journal;
pub mod probes;
pub mod reconcile;
pub mod source;
pub mod tabs;
pub mod view;
