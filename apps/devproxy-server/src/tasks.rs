use futures_util::FutureExt;
use std::{
    borrow::Cow,
    time::{Duration, Instant},
};

use tokio::task::JoinHandle;
use tracing::{debug, trace};

#[derive(Debug)]
pub struct TaskHandle {
    name: Cow<'static, str>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(name: impl Into<Cow<'static, str>>, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Background loops owned by the server; aborted on shutdown.
#[derive(Default)]
pub struct TaskManager {
    tasks: Vec<TaskHandle>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: TaskHandle) {
        trace!(task = task.name(), "task registered");
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Wait until a shared deadline for the tasks to end on their own, then abort the rest.
    pub async fn shutdown_with_grace(self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        for TaskHandle { name, mut handle } in self.tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!(task = %name, "task finished"),
                Ok(Err(err)) => debug!(task = %name, ?err, "task exited with error"),
                Err(_) => {
                    handle.abort();
                    if let Err(err) = handle.await {
                        if !err.is_cancelled() {
                            debug!(task = %name, ?err, "task join after abort failed");
                        }
                    }
                    debug!(task = %name, "task aborted after grace period");
                }
            }
        }
    }
}

/// Spawn a background task that restarts on panic with exponential backoff.
/// Use for long-running loops that should survive transient failures.
pub fn spawn_supervised<F, Fut>(name: impl Into<Cow<'static, str>>, mut factory: F) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let name_cow = name.into();
    let name_for_task = name_cow.clone();
    let handle = tokio::spawn(async move {
        let mut backoff_ms: u64 = 200;
        // Thrash detection window
        let window = Duration::from_secs(30);
        let mut window_start = Instant::now();
        let mut restarts_in_window: u32 = 0;
        loop {
            let result = std::panic::AssertUnwindSafe(factory()).catch_unwind().await;
            if result.is_ok() {
                debug!(task = %name_for_task, "supervised task completed normally");
                break;
            }
            let now = Instant::now();
            if now.duration_since(window_start) > window {
                window_start = now;
                restarts_in_window = 0;
                backoff_ms = 200;
            }
            restarts_in_window = restarts_in_window.saturating_add(1);
            tracing::error!(task = %name_for_task, backoff_ms, restarts_in_window, "supervised task panicked; restarting");
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms = backoff_ms.saturating_mul(2).min(10_000);
        }
    });
    TaskHandle::new(name_cow, handle)
}
