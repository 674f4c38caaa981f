use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Close-once stop signal shared by a loop and its handle.
///
/// `stop` may be called any number of times from any task; only the first
/// call has an effect.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    stopped: Arc<AtomicBool>,
    name: Arc<str>,
}

impl Shutdown {
    pub fn new(name: &str) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            stopped: Arc::new(AtomicBool::new(false)),
            name: Arc::from(name),
        }
    }

    /// Signal every listener. Returns `true` for the call that closed the signal.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!(worker = %self.name, "stop requested");
        self.tx.send_replace(true);
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> StopListener {
        StopListener {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving side of a [`Shutdown`].
#[derive(Debug, Clone)]
pub struct StopListener {
    rx: watch::Receiver<bool>,
}

impl StopListener {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the signal is closed (or its sender is gone).
    pub async fn stopped(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}

/// Handle to control and join a background loop.
///
/// `T` is the loop's statistics snapshot.
#[derive(Debug)]
pub struct WorkerHandle<T> {
    shutdown: Shutdown,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<T>>,
}

impl<T: Clone> WorkerHandle<T> {
    pub(crate) fn new(shutdown: Shutdown, joins: Vec<JoinHandle<()>>, stats: Arc<Mutex<T>>) -> Self {
        Self {
            shutdown,
            joins,
            stats,
        }
    }

    /// Ask the loop to stop taking new work. Does not wait.
    pub fn stop(&self) {
        self.shutdown.stop();
    }

    pub fn shutdown_signal(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Wait for every task of the loop to exit.
    pub async fn join(&mut self) {
        for join in self.joins.drain(..) {
            if let Err(err) = join.await {
                warn!(worker = %self.shutdown.name, error = %err, "worker task ended abnormally");
            }
        }
    }

    /// Request graceful shutdown and wait for the loop to stop.
    pub async fn shutdown(mut self) -> T {
        self.stop();
        self.join().await;
        self.stats()
    }

    pub fn stats(&self) -> T {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_is_close_once() {
        let shutdown = Shutdown::new("test");
        let listener = shutdown.subscribe();
        assert!(!listener.is_stopped());

        let racers: Vec<_> = (0..8)
            .map(|_| {
                let shutdown = shutdown.clone();
                tokio::spawn(async move { shutdown.stop() })
            })
            .collect();
        let mut winners = 0;
        for racer in racers {
            if racer.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert!(shutdown.is_stopped());
        assert!(listener.is_stopped());
        assert!(!shutdown.stop());
    }

    #[tokio::test]
    async fn listeners_wake_on_stop() {
        let shutdown = Shutdown::new("test");
        let mut listener = shutdown.subscribe();
        let waiter = tokio::spawn(async move { listener.stopped().await });

        shutdown.stop();
        waiter.await.unwrap();

        // Subscribing after the fact still observes the stop.
        let mut late = shutdown.subscribe();
        late.stopped().await;
    }

    #[tokio::test]
    async fn handle_shutdown_joins_tasks() {
        let shutdown = Shutdown::new("test");
        let mut listener = shutdown.subscribe();
        let stats = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&stats);
        let join = tokio::spawn(async move {
            listener.stopped().await;
            *counter.lock().unwrap() += 1;
        });

        let handle = WorkerHandle::new(shutdown, vec![join], stats);
        assert_eq!(handle.shutdown().await, 1);
    }
}
