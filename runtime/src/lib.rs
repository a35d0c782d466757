//! Execute simulation tasks with a deterministic discrete-event scheduler.
//!
//! This crate provides the runtime under every simulation in this workspace:
//! a single-threaded executor that advances a virtual clock, wakes sleeping
//! tasks in deadline order, and polls ready tasks in submission order. Given
//! the same seed, two runs of the same simulation observe the same event
//! interleaving.
//!
//! # Terminology
//!
//! The runtime is composed of an `Executor` and a `Context`. The `Executor`
//! implements the [Runner] trait and drives execution; the `Context`
//! implements the remaining traits ([Clock], [Spawner], [Metrics]) to provide
//! core functionality to tasks.

use prometheus_client::registry::Metric;
use std::{
    future::Future,
    time::{Duration, SystemTime},
};
use thiserror::Error;

pub mod deterministic;
mod utils;
pub use utils::*;

/// Prefix for runtime metrics.
const METRICS_PREFIX: &str = "runtime";

/// Errors that can occur when interacting with the runtime.
#[derive(Error, Debug)]
pub enum Error {
    #[error("closed")]
    Closed,
}

/// Interface that any task scheduler must implement to start running tasks.
pub trait Runner {
    /// Context defines the environment available to tasks.
    type Context;

    /// Start running a root task.
    ///
    /// When this function returns, all spawned tasks are dropped.
    fn start<F, Fut>(self, f: F) -> Fut::Output
    where
        F: FnOnce(Self::Context) -> Fut,
        Fut: Future;
}

/// Interface that any task scheduler must implement to spawn tasks.
pub trait Spawner: Clone + Send + Sync + 'static {
    /// Spawn a task with a child context.
    ///
    /// The task starts running (at the scheduler's discretion) even if the
    /// caller never awaits the returned [Handle].
    fn spawn<F, Fut, T>(self, f: F) -> Handle<T>
    where
        F: FnOnce(Self) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static;
}

/// Interface for time-based operations against the virtual clock.
pub trait Clock: Clone + Send + Sync + 'static {
    /// Returns the current virtual time.
    fn current(&self) -> SystemTime;

    /// Suspend the caller for `duration` of virtual time.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static;

    /// Suspend the caller until the virtual clock reaches `deadline`.
    fn sleep_until(&self, deadline: SystemTime) -> impl Future<Output = ()> + Send + 'static;
}

/// Interface for registering and encoding metrics.
pub trait Metrics: Clone + Send + Sync + 'static {
    /// Create a child context with the given label appended.
    ///
    /// Metrics registered by the child are prefixed with its label.
    fn with_label(&self, label: &str) -> Self;

    /// Return the current label.
    fn label(&self) -> String;

    /// Register a metric with the runtime registry.
    fn register<N: Into<String>, H: Into<String>>(&self, name: N, help: H, metric: impl Metric);

    /// Encode all registered metrics in the Prometheus text format.
    fn encode(&self) -> String;
}
