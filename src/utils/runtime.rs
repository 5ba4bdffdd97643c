//! Blocking bridge onto a dedicated background runtime.
//!
//! Blocking callers have no async context of their own, but connector
//! resolution and IAM authentication are async. A `BackgroundRuntime` owns one
//! OS thread driving a current-thread Tokio runtime; blocking callers submit a
//! future and wait on its join handle.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle as ThreadHandle;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::error::{EngineError, Result};

pub struct BackgroundRuntime {
    handle: Handle,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<ThreadHandle<()>>>,
}

impl BackgroundRuntime {
    pub fn start(name: &str) -> Result<Self> {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));

                // Drives every task spawned onto the handle until shutdown.
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                debug!("Background runtime stopped");
            })?;

        let handle = handle_rx
            .recv()
            .map_err(|_| {
                EngineError::Runtime("background runtime thread exited before starting".to_string())
            })??;

        info!("Started background runtime on thread {}", name);

        Ok(Self {
            handle,
            shutdown: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Runs `future` on the background thread and blocks the caller until it
    /// completes. Safe to call from inside another runtime, at the cost of
    /// parking that worker thread.
    pub fn block_on<F>(&self, future: F) -> Result<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.ensure_running()?;
        Ok(futures::executor::block_on(self.handle.spawn(future))?)
    }

    /// Runs `future` on the background thread and awaits it from the caller's
    /// runtime.
    pub async fn run<F>(&self, future: F) -> Result<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.ensure_running()?;
        Ok(self.handle.spawn(future).await?)
    }

    pub fn is_running(&self) -> bool {
        self.shutdown
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    pub fn shutdown(&self) {
        let sender = match self.shutdown.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(sender) = sender else {
            return;
        };
        let _ = sender.send(());

        let thread = match self.thread.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(thread) = thread {
            // Joining ourselves would deadlock.
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(EngineError::Runtime("background runtime has been shut down".to_string()))
        }
    }
}

impl Drop for BackgroundRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

static DEFAULT_RUNTIME: Mutex<Option<Arc<BackgroundRuntime>>> = Mutex::new(None);

/// Process-wide background runtime shared by every blocking construction.
pub fn default_runtime() -> Result<Arc<BackgroundRuntime>> {
    let mut slot = DEFAULT_RUNTIME
        .lock()
        .map_err(|_| EngineError::Runtime("default runtime lock poisoned".to_string()))?;

    if let Some(runtime) = slot.as_ref() {
        if runtime.is_running() {
            return Ok(Arc::clone(runtime));
        }
    }

    let runtime = Arc::new(BackgroundRuntime::start("cloudsql-engine-runtime")?);
    *slot = Some(Arc::clone(&runtime));
    Ok(runtime)
}
