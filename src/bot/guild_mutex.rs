//! Per-guild serialization of command handling.
//!
//! Every command for a guild runs through [`GuildMutex::run`]. Tasks for the
//! same key run one at a time in submission order; tasks for different keys
//! never wait on each other, so a slow guild only delays itself.
//!
//! The queue position is taken when `run` is *called*, not when the returned
//! future is first polled. A task that panics or whose future is dropped
//! releases the key to the next task.
//!
//! Calling `run` for a key from inside a task already holding that key would
//! wait on itself forever, so it panics at the call site instead.

use dashmap::DashMap;
use std::{collections::HashSet, future::Future, sync::Arc};
use tokio::{runtime::Handle, sync::oneshot};
use tracing::debug;

tokio::task_local! {
    static HELD_KEYS: HashSet<String>;
}

#[derive(Debug, Default)]
struct KeyQueue {
    /// Completion signal of the most recently submitted task
    tail: Option<oneshot::Receiver<()>>,
    /// Submitted tasks that haven't finished
    pending: usize,
}

type Queues = Arc<DashMap<String, KeyQueue>>;

/// Turno de una tarea en la cola de su clave
struct Ticket {
    queues: Queues,
    key: String,
    previous: Option<oneshot::Receiver<()>>,
    done: Option<oneshot::Sender<()>>,
}

impl Ticket {
    async fn wait_turn(&mut self) {
        if let Some(previous) = self.previous.as_mut() {
            // Err solo significa que la tarea anterior ya no existe
            let _ = previous.await;
        }
        self.previous = None;
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            match self.previous.take() {
                // Cancelled while waiting: the next task must still wait for ours
                Some(previous) => match Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            let _ = previous.await;
                            let _ = done.send(());
                        });
                    }
                    Err(_) => {
                        let _ = done.send(());
                    }
                },
                None => {
                    let _ = done.send(());
                }
            }
        }

        let idle = match self.queues.get_mut(&self.key) {
            Some(mut queue) => {
                queue.pending = queue.pending.saturating_sub(1);
                queue.pending == 0
            }
            None => false,
        };

        if idle {
            self.queues.remove_if(&self.key, |_, queue| queue.pending == 0);
            debug!(key = %self.key, "🧹 Cola de guild liberada");
        }
    }
}

/// Mutex asíncrono por clave (guild)
#[derive(Debug, Clone, Default)]
pub struct GuildMutex {
    queues: Queues,
}

impl GuildMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `task` behind every task already submitted for `key`.
    ///
    /// The returned future resolves to the task's own output, errors
    /// included; a failing task does not affect the ones queued after it.
    ///
    /// # Panics
    ///
    /// Panics if the current task is itself running under `key`.
    pub fn run<F, Fut, R>(&self, key: &str, task: F) -> impl Future<Output = R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let mut held = HELD_KEYS
            .try_with(|held| held.clone())
            .unwrap_or_default();
        if held.contains(key) {
            panic!("GuildMutex::run re-entrante: la tarea actual ya tiene la clave '{key}'");
        }
        held.insert(key.to_string());

        let (done_tx, done_rx) = oneshot::channel();
        let previous = {
            let mut queue = self.queues.entry(key.to_string()).or_default();
            queue.pending += 1;
            queue.tail.replace(done_rx)
        };

        let mut ticket = Ticket {
            queues: self.queues.clone(),
            key: key.to_string(),
            previous,
            done: Some(done_tx),
        };

        async move {
            ticket.wait_turn().await;
            let output = HELD_KEYS.scope(held, task()).await;
            drop(ticket);
            output
        }
    }

    /// Tareas enviadas para `key` que aún no terminan (incluida la activa)
    pub fn pending(&self, key: &str) -> usize {
        self.queues.get(key).map_or(0, |queue| queue.pending)
    }

    pub fn active_keys(&self) -> Vec<String> {
        self.queues.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn is_idle(&self) -> bool {
        self.queues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::time::sleep;

    type Log = Arc<parking_lot::Mutex<Vec<String>>>;

    fn record(log: &Log, entry: impl Into<String>) {
        log.lock().push(entry.into());
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_key_runs_one_at_a_time() {
        let mutex = GuildMutex::new();
        let log: Log = Arc::default();

        let a = mutex.run("guild-1", || {
            let log = log.clone();
            async move {
                record(&log, "a:start");
                sleep(Duration::from_millis(50)).await;
                record(&log, "a:end");
            }
        });
        let b = mutex.run("guild-1", || {
            let log = log.clone();
            async move {
                record(&log, "b:start");
                record(&log, "b:end");
            }
        });

        tokio::join!(a, b);
        assert_eq!(*log.lock(), vec!["a:start", "a:end", "b:start", "b:end"]);
        assert!(mutex.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_keys_overlap() {
        let mutex = GuildMutex::new();
        let log: Log = Arc::default();

        let a = mutex.run("guild-1", || {
            let log = log.clone();
            async move {
                record(&log, "a:start");
                sleep(Duration::from_millis(50)).await;
                record(&log, "a:end");
            }
        });
        let b = mutex.run("guild-2", || {
            let log = log.clone();
            async move {
                record(&log, "b:start");
                sleep(Duration::from_millis(10)).await;
                record(&log, "b:end");
            }
        });

        tokio::join!(a, b);
        assert_eq!(*log.lock(), vec!["a:start", "b:start", "b:end", "a:end"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submission_order_wins_over_poll_order() {
        let mutex = GuildMutex::new();
        let log: Log = Arc::default();

        let tasks: Vec<_> = (0..5)
            .map(|i| {
                let log = log.clone();
                mutex.run("guild-1", move || async move {
                    sleep(Duration::from_millis(5)).await;
                    record(&log, format!("task-{i}"));
                })
            })
            .collect();
        assert_eq!(mutex.pending("guild-1"), 5);

        join_all(tasks.into_iter().rev()).await;
        assert_eq!(
            *log.lock(),
            vec!["task-0", "task-1", "task-2", "task-3", "task-4"]
        );
        assert_eq!(mutex.pending("guild-1"), 0);
    }

    #[tokio::test]
    async fn test_error_does_not_block_queue() {
        let mutex = GuildMutex::new();

        let failing = mutex.run("guild-1", || async {
            Err::<u32, _>(anyhow::anyhow!("comando falló"))
        });
        let next = mutex.run("guild-1", || async { Ok::<_, anyhow::Error>(7) });

        let (failing, next) = tokio::join!(failing, next);
        assert!(failing.is_err());
        assert_eq!(next.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_panicking_task_releases_key() {
        let mutex = GuildMutex::new();

        let handle = tokio::spawn(mutex.run("guild-1", || async {
            panic!("boom");
        }));
        assert!(handle.await.unwrap_err().is_panic());

        let value = mutex.run("guild-1", || async { "siguiente" }).await;
        assert_eq!(value, "siguiente");
        assert!(mutex.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_waiter_keeps_order() {
        let mutex = GuildMutex::new();
        let log: Log = Arc::default();

        let first = mutex.run("guild-1", || {
            let log = log.clone();
            async move {
                sleep(Duration::from_millis(50)).await;
                record(&log, "first");
            }
        });
        let abandoned = mutex.run("guild-1", || async {});
        let third = mutex.run("guild-1", || {
            let log = log.clone();
            async move { record(&log, "third") }
        });
        drop(abandoned);

        tokio::join!(first, third);
        assert_eq!(*log.lock(), vec!["first", "third"]);
    }

    #[tokio::test]
    #[should_panic(expected = "re-entrante")]
    async fn test_reentrant_run_panics() {
        let mutex = GuildMutex::new();
        let inner = mutex.clone();

        mutex
            .run("guild-1", || async move {
                inner.run("guild-1", || async {}).await;
            })
            .await;
    }

    #[tokio::test]
    async fn test_nested_run_on_other_key_is_allowed() {
        let mutex = GuildMutex::new();
        let inner = mutex.clone();

        let value = mutex
            .run("guild-1", || async move { inner.run("guild-2", || async { 3 }).await })
            .await;
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_idle_keys_are_collected() {
        let mutex = GuildMutex::new();
        for guild in ["a", "b", "c"] {
            mutex.run(guild, || async {}).await;
        }
        assert!(mutex.active_keys().is_empty());
        assert_eq!(mutex.pending("a"), 0);
    }
}
