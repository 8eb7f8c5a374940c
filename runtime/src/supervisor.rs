//! Supervised background tasks and coordinated shutdown.
//!
//! Each consumer loop runs in its own task. A panic inside a loop must not silently stop
//! consumption for the rest of the process lifetime, so the loop is started through
//! [`supervise`], which restarts it after a delay until shutdown is signalled.

use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Default wait before restarting a panicked task.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Run `factory`'s task, restarting it after `restart_delay` whenever it panics.
///
/// The factory receives a fresh shutdown receiver on every start. The supervisor exits
/// when the task returns normally or when shutdown is signalled.
pub fn supervise<F, Fut>(
    name: impl Into<String>,
    shutdown: &broadcast::Sender<()>,
    restart_delay: Duration,
    factory: F,
) -> JoinHandle<()>
where
    F: Fn(broadcast::Receiver<()>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let name = name.into();
    let shutdown = shutdown.clone();
    let mut stopped = shutdown.subscribe();

    tokio::spawn(async move {
        let mut starts: u32 = 0;
        loop {
            starts += 1;
            info!(task = %name, starts, "Starting supervised task");
            let task = tokio::spawn(factory(shutdown.subscribe()));

            match task.await {
                Ok(()) => {
                    info!(task = %name, "Supervised task finished");
                    break;
                }
                Err(e) if e.is_panic() => {
                    error!(task = %name, "Supervised task panicked, restarting in {:?}", restart_delay);
                }
                Err(e) => {
                    warn!(task = %name, error = %e, "Supervised task cancelled");
                    break;
                }
            }

            tokio::select! {
                _ = stopped.recv() => break,
                () = tokio::time::sleep(restart_delay) => {}
            }
        }
    })
}

/// Wait up to `grace` for every task to finish, then abort the rest.
pub async fn shutdown_within(tasks: Vec<JoinHandle<()>>, grace: Duration) {
    let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
    if tokio::time::timeout(grace, futures::future::join_all(tasks)).await.is_err() {
        warn!(grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX), "Tasks did not stop in time, aborting");
        for abort in aborts {
            abort.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn panicked_task_is_restarted() {
        let (tx, _rx) = broadcast::channel(1);
        let starts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&starts);

        let handle = supervise("consumer", &tx, Duration::from_secs(5), move |mut shutdown| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run fails");
                }
                let _ = shutdown.recv().await;
            }
        });

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(starts.load(Ordering::SeqCst), 2);

        tx.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_restart_delay_stops_supervisor() {
        let (tx, _rx) = broadcast::channel(1);
        let handle = supervise("consumer", &tx, Duration::from_secs(60), |_shutdown| async {
            panic!("always fails");
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_tasks_are_aborted_after_grace() {
        let stuck = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let probe = stuck.abort_handle();

        shutdown_within(vec![stuck], Duration::from_secs(10)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(probe.is_finished());
    }
}
