//! Process runner for the device configuration service.
//!
//! Runs named processes concurrently, each with a child of one shared
//! cancellation token, and then runs every closer under a timeout:
//! - a shutdown signal (SIGINT, or SIGTERM on unix) cancels every process
//! - the first failing process cancels the rest
//! - a process that returns `Err` fails the run, even after cancellation
//! - closers run regardless of how the processes ended
//!
//! Processes may be long-running or one-shot. When all of them return `Ok`,
//! the runner proceeds to the closers without waiting for a signal.
//!
//! # Example
//!
//! ```no_run
//! use deviceconfig_runner::Runner;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Runner::new()
//!         .with_process("migrate", |ctx| async move {
//!             tokio::select! {
//!                 _ = ctx.cancelled() => tracing::info!("migration interrupted"),
//!                 _ = tokio::time::sleep(Duration::from_secs(1)) => tracing::info!("migrated"),
//!             }
//!             Ok(())
//!         })
//!         .with_closer("pool", || async move { Ok(()) })
//!         .with_closer_timeout(Duration::from_secs(5))
//!         .run()
//!         .await;
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type BoxFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A process body. Receives the cancellation token it must honour.
pub type Process = Box<dyn FnOnce(CancellationToken) -> BoxFuture + Send>;

/// A cleanup body, run once every process has stopped.
pub type Closer = Box<dyn FnOnce() -> BoxFuture + Send>;

/// How a run ended
#[derive(Debug)]
pub enum RunOutcome {
    /// Every process returned `Ok`
    Completed,
    /// A shutdown signal or external cancellation stopped the processes and
    /// every one of them returned `Ok`
    Cancelled,
    /// The named process failed or panicked first, before or after cancellation
    Failed {
        process: String,
        error: anyhow::Error,
    },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed | RunOutcome::Cancelled => 0,
            RunOutcome::Failed { .. } => 1,
        }
    }
}

pub struct Runner {
    processes: Vec<(String, Process)>,
    closers: Vec<(String, Closer)>,
    closer_timeout: Duration,
    ctx: CancellationToken,
    handle_signals: bool,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    /// Closer timeout defaults to 10 seconds; signal handling is on.
    pub fn new() -> Self {
        Self {
            processes: Vec::new(),
            closers: Vec::new(),
            closer_timeout: Duration::from_secs(10),
            ctx: CancellationToken::new(),
            handle_signals: true,
        }
    }

    pub fn with_process<F, Fut>(mut self, name: impl Into<String>, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.processes
            .push((name.into(), Box::new(move |ctx| Box::pin(process(ctx)))));
        self
    }

    /// Closers run concurrently; one failing does not stop the others.
    pub fn with_closer<F, Fut>(mut self, name: impl Into<String>, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.closers
            .push((name.into(), Box::new(move || Box::pin(closer()))));
        self
    }

    pub fn with_closer_timeout(mut self, timeout: Duration) -> Self {
        self.closer_timeout = timeout;
        self
    }

    /// Use an externally owned token; cancelling it stops every process.
    pub fn with_cancellation_token(mut self, ctx: CancellationToken) -> Self {
        self.ctx = ctx;
        self
    }

    /// Disable SIGINT/SIGTERM handling, for embedding and tests.
    pub fn without_signal_handlers(mut self) -> Self {
        self.handle_signals = false;
        self
    }

    /// Run to completion, then exit the process with the outcome's code.
    pub async fn run(self) {
        let outcome = self.execute().await;
        match &outcome {
            RunOutcome::Failed { process, error } => {
                error!(process = %process, "exiting with error: {:#}", error)
            }
            RunOutcome::Cancelled => info!("exiting after cancellation"),
            RunOutcome::Completed => info!("exiting normally"),
        }
        std::process::exit(outcome.exit_code());
    }

    /// Run every process and closer and report how the run ended.
    pub async fn execute(self) -> RunOutcome {
        let ctx = self.ctx;

        if self.handle_signals {
            let signal_ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown_signal() => signal_ctx.cancel(),
                    _ = signal_ctx.cancelled() => {}
                }
            });
        }

        let mut join_set = JoinSet::new();
        for (name, process) in self.processes {
            let process_ctx = ctx.child_token();
            join_set.spawn(async move {
                let result = process(process_ctx).await;
                (name, result)
            });
        }

        let mut failure = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => debug!(process = %name, "process finished"),
                Ok((name, Err(e))) => {
                    // Errors after cancellation still fail the run.
                    if ctx.is_cancelled() {
                        warn!(process = %name, "process failed after cancellation: {:#}", e);
                    } else {
                        error!(process = %name, "process failed: {:#}", e);
                        ctx.cancel();
                    }
                    if failure.is_none() {
                        failure = Some((name, e));
                    }
                }
                Err(e) => {
                    error!("process panicked: {}", e);
                    if failure.is_none() {
                        failure = Some(("<panicked>".to_string(), anyhow::anyhow!("{}", e)));
                    }
                    ctx.cancel();
                }
            }
        }

        let was_cancelled = ctx.is_cancelled();
        // Stops the signal task.
        ctx.cancel();

        run_closers(self.closers, self.closer_timeout).await;

        match failure {
            Some((process, error)) => RunOutcome::Failed { process, error },
            None if was_cancelled => RunOutcome::Cancelled,
            None => RunOutcome::Completed,
        }
    }
}

async fn run_closers(closers: Vec<(String, Closer)>, timeout: Duration) {
    if closers.is_empty() {
        return;
    }

    let mut closer_set = JoinSet::new();
    for (name, closer) in closers {
        closer_set.spawn(async move { (name, closer().await) });
    }

    let drain = async {
        while let Some(joined) = closer_set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => debug!(closer = %name, "closer finished"),
                Ok((name, Err(e))) => error!(closer = %name, "closer failed: {:#}", e),
                Err(e) => error!("closer panicked: {}", e),
            }
        }
    };

    if tokio::time::timeout(timeout, drain).await.is_err() {
        warn!("closers timed out after {:?}", timeout);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_one_shot_processes_complete_and_run_closers() {
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();

        let outcome = Runner::new()
            .without_signal_handlers()
            .with_process("one-shot", |_ctx| async { Ok(()) })
            .with_closer("flag", move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .execute()
            .await;

        assert!(matches!(outcome, RunOutcome::Completed));
        assert_eq!(outcome.exit_code(), 0);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failing_process_cancels_the_others() {
        let outcome = Runner::new()
            .without_signal_handlers()
            .with_process("waiter", |ctx| async move {
                ctx.cancelled().await;
                Ok(())
            })
            .with_process("broken", |_ctx| async { anyhow::bail!("boom") })
            .execute()
            .await;

        match &outcome {
            RunOutcome::Failed { process, error } => {
                assert_eq!(process, "broken");
                assert_eq!(error.to_string(), "boom");
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(outcome.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_external_cancellation_stops_processes() {
        let ctx = CancellationToken::new();
        let trigger = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = Runner::new()
            .without_signal_handlers()
            .with_cancellation_token(ctx)
            .with_process("long-running", |ctx| async move {
                ctx.cancelled().await;
                Ok(())
            })
            .execute()
            .await;

        assert!(matches!(outcome, RunOutcome::Cancelled));
        assert_eq!(outcome.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_process_interrupted_by_cancellation_fails_the_run() {
        let ctx = CancellationToken::new();
        let trigger = ctx.clone();

        let outcome = Runner::new()
            .without_signal_handlers()
            .with_cancellation_token(ctx)
            .with_process("migrate", move |ctx| async move {
                trigger.cancel();
                ctx.cancelled().await;
                anyhow::bail!("migration to 1.1.0 failed: operation cancelled")
            })
            .execute()
            .await;

        match &outcome {
            RunOutcome::Failed { process, error } => {
                assert_eq!(process, "migrate");
                assert!(error.to_string().contains("operation cancelled"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(outcome.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_first_failure_is_reported_when_others_fail_on_cancellation() {
        let outcome = Runner::new()
            .without_signal_handlers()
            .with_process("waiter", |ctx| async move {
                ctx.cancelled().await;
                anyhow::bail!("interrupted")
            })
            .with_process("broken", |_ctx| async { anyhow::bail!("boom") })
            .execute()
            .await;

        match &outcome {
            RunOutcome::Failed { process, .. } => assert_eq!(process, "broken"),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closers_all_run_even_when_one_fails() {
        let count = Arc::new(AtomicUsize::new(0));
        let first = count.clone();
        let second = count.clone();

        run_closers(
            vec![
                (
                    "failing".to_string(),
                    Box::new(move || -> BoxFuture {
                        Box::pin(async move {
                            first.fetch_add(1, Ordering::SeqCst);
                            anyhow::bail!("close failed")
                        })
                    }),
                ),
                (
                    "ok".to_string(),
                    Box::new(move || -> BoxFuture {
                        Box::pin(async move {
                            second.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        })
                    }),
                ),
            ],
            Duration::from_secs(1),
        )
        .await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_closer_timeout_does_not_hang() {
        let started = std::time::Instant::now();
        Runner::new()
            .without_signal_handlers()
            .with_closer("stuck", || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .with_closer_timeout(Duration::from_millis(20))
            .execute()
            .await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
