//! Helpers for working with asynchronous tasks.

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::{debug_span, Instrument as _};

/// Spawns a new named asynchronous task, returning a [`JoinHandle`] for it.
///
/// The task runs inside a `task` span carrying the given name, nested under the current span.
pub fn spawn_traced_named<S, F, T>(name: S, f: F) -> JoinHandle<T>
where
    S: Into<String>,
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let task_name = name.into();
    tokio::task::spawn(f.instrument(debug_span!("task", task_name = %task_name)))
}
