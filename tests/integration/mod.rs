//! Integration test suite for conductor.
//!
//! These tests drive planning, checkpointing, decisions and execution
//! through the public API only, with a scripted skill backend standing in
//! for real skill execution.
//!
//! # Test Categories
//!
//! - `planning`: Dependency resolution and plan construction
//! - `execution_e2e`: Full runs from plan to result
//! - `checkpoint_rollback`: Checkpoint round trips, rollback and recovery
//! - `decisions`: Decision-gated steps and auto-resolution
//! - `halt_resume`: Halt, resume and abort control
//! - `parallel_groups`: Concurrent execution of parallel groups

mod fixtures;

mod planning;
mod parallel_groups;
