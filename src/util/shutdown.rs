use tokio::sync::watch;

/// Receiving half of a process-wide cancellation signal.
///
/// Cloned into every component that may block on the network so a shutdown
/// request interrupts in-flight fetches and retry backoffs instead of
/// waiting for them to finish.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Sending half of the cancellation signal, held by whoever owns shutdown.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    /// Creates a connected trigger/signal pair.
    pub fn channel() -> (ShutdownTrigger, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { tx }, Shutdown { rx })
    }

    /// A signal that never fires. Used by tests and one-shot commands.
    pub fn never() -> Shutdown {
        let (_trigger, shutdown) = Self::channel();
        shutdown
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once shutdown has been requested.
    ///
    /// If the trigger is dropped without firing, this never completes.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        tracing::info!("Shutdown requested, cancelling in-flight work");
        // send_replace never fails, even with no receivers left
        self.tx.send_replace(true);
    }
}
