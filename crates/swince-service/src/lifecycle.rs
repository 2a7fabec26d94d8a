//! Process lifecycle: `Starting -> Running -> Draining -> Stopped`, or
//! `Starting -> Failed` when initialization cannot complete.
//!
//! Initialization runs in its own task and publishes the application exactly
//! once through a oneshot channel. Errors from that task, or from anything the
//! application spawns later, arrive on a single error channel. Shutdown races a
//! graceful drain against the grace period; whichever path releases resources
//! first wins and the other becomes a no-op.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Resources owned by a running application.
#[async_trait]
pub trait Shutdown: Send + Sync + 'static {
    /// Stop accepting new work and wait for work in flight.
    async fn drain(&self);

    /// Release owned resources. Must be safe to call on resources that are
    /// already released.
    fn release(&self);
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("initialization failed: {0:#}")]
    Startup(anyhow::Error),
    #[error("application error: {0:#}")]
    Runtime(anyhow::Error),
    #[error("initialization stopped without reporting a result")]
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Running,
    Draining,
    Stopped,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The graceful path released everything within the grace period.
    Graceful,
    /// The grace period ran out and resources were released without waiting.
    Forced,
}

/// Sending side of the lifecycle error channel.
#[derive(Debug, Clone)]
pub struct ErrorSink {
    tx: mpsc::UnboundedSender<anyhow::Error>,
}

impl ErrorSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<anyhow::Error>) -> Self {
        Self { tx }
    }

    pub fn report(&self, err: anyhow::Error) {
        if let Err(mpsc::error::SendError(err)) = self.tx.send(err) {
            tracing::warn!(error = %format!("{err:#}"), "error reported after lifecycle ended");
        }
    }
}

/// Runs a closure at most once across every holder of the guard.
#[derive(Debug, Default)]
pub struct ReleaseOnce {
    done: AtomicBool,
}

impl ReleaseOnce {
    /// Returns whether this call ran `release`.
    pub fn run(&self, release: impl FnOnce()) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        release();
        true
    }

    pub fn has_run(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

fn enter(phase: Phase) {
    tracing::info!(%phase, "lifecycle phase");
}

/// Drive the application from initialization to shutdown.
///
/// `init` receives the error sink and returns the future that builds the
/// application; it is spawned immediately. A termination signal that arrives
/// before initialization settles is held until it does, so a half-built
/// application is never torn down.
///
/// # Errors
/// [`LifecycleError::Startup`] when initialization fails,
/// [`LifecycleError::Runtime`] when the application reports an error while
/// running (resources are released first), [`LifecycleError::Aborted`] when
/// the initialization task ends without a result.
pub async fn run<S, I, F, Sig>(
    init: I,
    shutdown_signal: Sig,
    grace: Duration,
) -> Result<ShutdownOutcome, LifecycleError>
where
    S: Shutdown,
    I: FnOnce(ErrorSink) -> F,
    F: Future<Output = anyhow::Result<Arc<S>>> + Send + 'static,
    Sig: Future<Output = ()>,
{
    let (tx, mut errors) = mpsc::unbounded_channel();
    let sink = ErrorSink::new(tx);
    let (ready_tx, mut ready_rx) = oneshot::channel::<Arc<S>>();

    enter(Phase::Starting);
    let starting = init(sink.clone());
    let init_sink = sink.clone();
    tokio::spawn(async move {
        match starting.await {
            Ok(app) => {
                if ready_tx.send(app).is_err() {
                    tracing::warn!("application finished starting after the lifecycle ended");
                }
            }
            Err(err) => init_sink.report(err),
        }
    });

    tokio::pin!(shutdown_signal);
    let mut stop_requested = false;
    let app = loop {
        tokio::select! {
            biased;
            Some(err) = errors.recv() => {
                enter(Phase::Failed);
                return Err(LifecycleError::Startup(err));
            }
            ready = &mut ready_rx => match ready {
                Ok(app) => break app,
                Err(_) => {
                    enter(Phase::Failed);
                    return Err(LifecycleError::Aborted);
                }
            },
            () = &mut shutdown_signal, if !stop_requested => {
                tracing::info!(
                    "shutdown requested during startup, waiting for initialization to settle"
                );
                stop_requested = true;
            }
        }
    };

    let guard = Arc::new(ReleaseOnce::default());
    if !stop_requested {
        enter(Phase::Running);
        tokio::select! {
            biased;
            Some(err) = errors.recv() => {
                tracing::error!(error = %format!("{err:#}"), "application error");
                guard.run(|| app.release());
                enter(Phase::Stopped);
                return Err(LifecycleError::Runtime(err));
            }
            () = &mut shutdown_signal => {
                tracing::info!("shutdown requested");
            }
        }
    }

    enter(Phase::Draining);
    let outcome = drain(app, guard, grace).await;
    enter(Phase::Stopped);
    Ok(outcome)
}

async fn drain<S: Shutdown>(
    app: Arc<S>,
    guard: Arc<ReleaseOnce>,
    grace: Duration,
) -> ShutdownOutcome {
    let (done_tx, done_rx) = oneshot::channel::<()>();
    let graceful = {
        let app = Arc::clone(&app);
        let guard = Arc::clone(&guard);
        tokio::spawn(async move {
            app.drain().await;
            guard.run(|| app.release());
            tracing::info!("application shutdown");
            let _ = done_tx.send(());
        })
    };

    tokio::select! {
        done = done_rx => {
            if done.is_ok() {
                return ShutdownOutcome::Graceful;
            }
            tracing::error!("graceful shutdown task ended early, releasing resources now");
            guard.run(|| app.release());
            ShutdownOutcome::Forced
        }
        () = tokio::time::sleep(grace) => {
            tracing::warn!(
                grace = %humantime::format_duration(grace),
                "graceful shutdown delay exceeded, shutting down now"
            );
            guard.run(|| app.release());
            graceful.abort();
            ShutdownOutcome::Forced
        }
    }
}

/// Resolves on SIGINT (ctrl-c) or, on Unix, SIGTERM.
pub async fn termination_signal() {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for interrupt signal");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for terminate signal");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => {}
        () = terminate => {}
    }
}
