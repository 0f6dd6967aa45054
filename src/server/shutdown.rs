use tokio::sync::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};

// Notifier lets background tasks of a gate know that it is shutting down.
#[derive(Debug)]
pub(crate) struct Notifier {
    shutdown_tx: RwLock<Option<broadcast::Sender<()>>>,
    shutdown_complete_tx: RwLock<Option<mpsc::Sender<()>>>,
    shutdown_complete_rx: Mutex<mpsc::Receiver<()>>,
}

impl Notifier {
    pub(crate) fn new() -> Notifier {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        Notifier {
            shutdown_tx: RwLock::new(Some(shutdown_tx)),
            shutdown_complete_tx: RwLock::new(Some(shutdown_complete_tx)),
            shutdown_complete_rx: Mutex::new(shutdown_complete_rx),
        }
    }

    // Tells listeners that shutdown is commencing. They signal that they are done by dropping
    // their Listener.
    pub(crate) async fn notify(&self) {
        drop(self.shutdown_tx.write().await.take());
        drop(self.shutdown_complete_tx.write().await.take())
    }

    // Waits for the tasks holding listeners to finish.
    pub(crate) async fn linger(&self) {
        let _ = self.shutdown_complete_rx.lock().await.recv().await;
    }

    pub(crate) async fn subscribe(&self) -> Listener {
        let sender_opt = self.shutdown_tx.read().await;
        let complete_sender_opt = self.shutdown_complete_tx.read().await;
        Listener {
            shutdown: sender_opt.is_none(),
            shutdown_rx: sender_opt.as_ref().map(|tx| tx.subscribe()),
            _shutdown_complete_tx: complete_sender_opt.clone(),
        }
    }
}

// Listener receives the shutdown notification.
#[derive(Debug)]
pub(crate) struct Listener {
    shutdown: bool,
    shutdown_rx: Option<broadcast::Receiver<()>>,
    _shutdown_complete_tx: Option<mpsc::Sender<()>>,
}

impl Listener {
    // Waits for the shutdown notice, returning immediately if it was already received.
    pub(crate) async fn listen(&mut self) {
        if self.shutdown {
            return;
        }
        if let Some(rx) = self.shutdown_rx.as_mut() {
            // Only one value is ever sent so lagging is impossible; a closed channel is the signal.
            let _ = rx.recv().await;
        }
        self.shutdown = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn listeners_are_woken_and_lingered_for() {
        let notifier = Arc::new(Notifier::new());
        let mut listener = notifier.subscribe().await;
        let task = tokio::spawn(async move {
            listener.listen().await;
        });
        notifier.notify().await;
        tokio::time::timeout(Duration::from_secs(1), notifier.linger()).await.unwrap();
        task.await.unwrap();

        let mut late = notifier.subscribe().await;
        tokio::time::timeout(Duration::from_millis(100), late.listen()).await.unwrap();
    }
}
