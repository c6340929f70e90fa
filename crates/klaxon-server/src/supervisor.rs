use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Owns every worker task and the shared shutdown token.
///
/// Workers observe the token, finish their in-flight item and exit; the
/// supervisor joins them under one hard deadline and aborts stragglers.
pub struct Supervisor {
    token: CancellationToken,
    workers: Vec<(String, JoinHandle<()>)>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            workers: Vec::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn spawn<F>(&mut self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.workers.push((name.to_string(), tokio::spawn(future)));
    }

    /// Registers tasks spawned elsewhere (e.g. a worker pool).
    pub fn adopt(&mut self, name: &str, handles: Vec<JoinHandle<()>>) {
        for (index, handle) in handles.into_iter().enumerate() {
            self.workers.push((format!("{name}-{index}"), handle));
        }
    }

    /// Cancels the token and joins every worker. Workers still running at
    /// the deadline are aborted; the process exits regardless.
    pub async fn shutdown(mut self, deadline: Duration) {
        self.token.cancel();
        let deadline = tokio::time::Instant::now() + deadline;
        for (name, mut handle) in self.workers.drain(..) {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => tracing::debug!(worker = %name, "Worker stopped"),
                Ok(Err(e)) => tracing::error!(worker = %name, error = %e, "Worker panicked"),
                Err(_) => {
                    tracing::error!(worker = %name, "Worker missed the shutdown deadline, aborting");
                    handle.abort();
                }
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
