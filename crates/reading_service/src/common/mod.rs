//! src/common/mod.rs
//!
//! Utilities shared by the pool workers and the pipelines they run.

pub mod thread;
