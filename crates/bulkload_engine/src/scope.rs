//! Task spawning and shutdown.
//!
//! [`TaskScopeProvider`] is the only place the engine spawns. It counts
//! in-flight tasks so shutdown can wait for them, and holds two tokens:
//! `signal` stops run-until-signalled tasks, `kill` stops everything.

use crate::task::{TaskLevel, Termination, WrappedTask};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

/// Spawns wrapped tasks and tears them down.
#[derive(Debug)]
pub struct TaskScopeProvider {
    signal: CancellationToken,
    kill: CancellationToken,
    in_flight: Arc<watch::Sender<usize>>,
}

struct InFlightGuard(Arc<watch::Sender<usize>>);

impl InFlightGuard {
    fn enter(counter: &Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl Default for TaskScopeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskScopeProvider {
    /// Creates an open scope.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            signal: CancellationToken::new(),
            kill: CancellationToken::new(),
            in_flight: Arc::new(tx),
        }
    }

    /// Spawns a task. Returns `false` if the scope was killed and the task
    /// was dropped without running.
    pub fn launch(&self, task: WrappedTask) -> bool {
        if self.kill.is_cancelled() {
            warn!(task = %task.kind, "scope killed, dropping task");
            return false;
        }

        let kind = task.kind;
        let termination = task.termination;
        let span = match &task.level {
            TaskLevel::Stream(stream) => info_span!("task", task = %kind, stream = %stream),
            TaskLevel::Sync => info_span!("task", task = %kind),
        };
        let guard = InFlightGuard::enter(&self.in_flight);
        let signal = self.signal.clone();
        let kill = self.kill.clone();
        let future = task.into_future();

        tokio::spawn(
            async move {
                let _guard = guard;
                debug!("task started");
                match termination {
                    Termination::SelfTerminating => {
                        tokio::select! {
                            _ = kill.cancelled() => debug!("task killed"),
                            _ = future => debug!("task finished"),
                        }
                    }
                    Termination::RunUntilSignalled => {
                        tokio::select! {
                            _ = kill.cancelled() => debug!("task killed"),
                            _ = signal.cancelled() => debug!("task signalled"),
                            _ = future => debug!("task finished"),
                        }
                    }
                }
            }
            .instrument(span),
        );
        true
    }

    /// Number of tasks still running.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Returns true once the scope was killed.
    pub fn is_killed(&self) -> bool {
        self.kill.is_cancelled()
    }

    /// Stops run-until-signalled tasks and waits for every task to finish.
    pub async fn close(&self) {
        self.signal.cancel();
        self.await_idle().await;
    }

    /// Cancels every task at its next suspension point and waits for them.
    pub async fn kill(&self) {
        self.kill.cancel();
        self.await_idle().await;
    }

    async fn await_idle(&self) {
        let mut rx = self.in_flight.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskKind;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn wrapped<F>(termination: Termination, future: F) -> WrappedTask
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        WrappedTask::new(TaskKind::Custom("test"), TaskLevel::Sync, termination, future)
    }

    #[tokio::test]
    async fn close_waits_for_self_terminating() {
        let scope = TaskScopeProvider::new();
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        scope.launch(wrapped(Termination::SelfTerminating, async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(true, Ordering::SeqCst);
        }));
        assert_eq!(scope.in_flight(), 1);

        tokio::time::timeout(Duration::from_secs(1), scope.close())
            .await
            .unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(scope.in_flight(), 0);
    }

    #[tokio::test]
    async fn close_signals_run_until_signalled() {
        let scope = TaskScopeProvider::new();
        scope.launch(wrapped(Termination::RunUntilSignalled, std::future::pending()));
        tokio::time::timeout(Duration::from_secs(1), scope.close())
            .await
            .unwrap();
        assert_eq!(scope.in_flight(), 0);
    }

    #[tokio::test]
    async fn kill_cancels_everything() {
        let scope = TaskScopeProvider::new();
        let (tx, rx) = oneshot::channel::<()>();
        scope.launch(wrapped(Termination::SelfTerminating, async move {
            let _ = rx.await;
        }));
        scope.launch(wrapped(Termination::RunUntilSignalled, std::future::pending()));

        tokio::time::timeout(Duration::from_secs(1), scope.kill())
            .await
            .unwrap();
        assert!(scope.is_killed());
        drop(tx);
    }

    #[tokio::test]
    async fn launch_after_kill_is_dropped() {
        let scope = TaskScopeProvider::new();
        scope.kill().await;
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        assert!(!scope.launch(wrapped(Termination::SelfTerminating, async move {
            flag.store(true, Ordering::SeqCst);
        })));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!ran.load(Ordering::SeqCst));
    }
}
