//! Service trait and host.
//!
//! The manager and dispatcher are process-wide singletons with explicit
//! init/teardown: construct → run → cancel → join. The host owns that
//! lifecycle and exposes `stop(deadline)` drain semantics.

use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A long-running loop with a cooperative shutdown.
#[async_trait::async_trait]
pub trait Service: Send {
    fn name(&self) -> &'static str;

    /// Run until the token is cancelled. Implementations drain their own
    /// in-flight work before returning.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

/// Builder for a set of services sharing one shutdown token.
#[derive(Default)]
pub struct ServiceHost {
    services: Vec<Box<dyn Service>>,
    shutdown: CancellationToken,
}

impl ServiceHost {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_service(mut self, service: impl Service + 'static) -> Self {
        self.services.push(Box::new(service));
        self
    }

    /// The token handed to every service.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn every service and return a handle for teardown.
    pub fn start(self) -> RunningHost {
        let mut handles = Vec::with_capacity(self.services.len());
        for service in self.services {
            let name = service.name();
            let token = self.shutdown.clone();
            info!(service = name, "starting service");
            let handle = tokio::spawn(async move {
                if let Err(e) = service.run(token).await {
                    error!(service = name, error = %e, "service exited with error");
                }
            });
            handles.push((name, handle));
        }
        RunningHost {
            handles,
            shutdown: self.shutdown,
        }
    }

    /// Convenience: start, wait for ctrl-c, then stop with the deadline.
    pub async fn run_until_shutdown(self, drain_deadline: Duration) -> Result<()> {
        let running = self.start();
        tokio::signal::ctrl_c().await?;
        info!("received shutdown signal");
        running.stop(drain_deadline).await;
        Ok(())
    }
}

/// Handle over spawned services.
pub struct RunningHost {
    handles: Vec<(&'static str, JoinHandle<()>)>,
    shutdown: CancellationToken,
}

impl RunningHost {
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel every service and wait up to `deadline` for each to drain;
    /// stragglers are aborted.
    pub async fn stop(self, deadline: Duration) {
        self.shutdown.cancel();
        for (name, mut handle) in self.handles {
            match tokio::time::timeout(deadline, &mut handle).await {
                Ok(Ok(())) => info!(service = name, "service stopped"),
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => error!(service = name, error = %e, "service task panicked"),
                Err(_) => {
                    warn!(service = name, "service missed the drain deadline, aborting");
                    handle.abort();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct Ticker {
        stopped: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl Service for Ticker {
        fn name(&self) -> &'static str {
            "ticker"
        }

        async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
            shutdown.cancelled().await;
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn stop_cancels_and_joins_services() {
        let stopped = Arc::new(AtomicBool::new(false));
        let host = ServiceHost::new().with_service(Ticker {
            stopped: stopped.clone(),
        });
        let running = host.start();
        running.stop(Duration::from_secs(1)).await;
        assert!(stopped.load(Ordering::SeqCst));
    }
}
