//! Integration test suite for workloop.
//!
//! These tests drive progress trees and process managers through their
//! public API only, the way an embedding application would.
//!
//! # Test Categories
//!
//! - `progress_tree`: aggregation, clamping, completion and leading tasks
//! - `auto_estimate`: auto task timing on a virtual clock and the shared ticker
//! - `orchestration`: fan-out/join, supersession, failure isolation, registry
//!
//! # CI Compatibility
//!
//! Deployments are in-process fakes and all timing uses either a manual
//! clock or paused tokio time, so nothing here touches the network.

mod fixtures;

mod auto_estimate;
mod progress_tree;
