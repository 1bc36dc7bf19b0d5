use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handle to a background service loop.
/// - `request_shutdown` で停止を要求（実行中の 1 サイクルは最後まで走る）
/// - `shutdown_and_join` で停止を待つ
/// - handle を drop すると sender も drop され、ループは停止する
pub struct ServiceHandle {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ServiceHandle {
    /// Spawn `run` with a fresh shutdown receiver.
    pub fn spawn<F, Fut>(name: &'static str, run: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(run(shutdown_rx));
        Self {
            name,
            shutdown_tx,
            join,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn request_shutdown(&self) {
        // ignore send error: the loop may already have exited
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(e) = self.join.await {
            tracing::warn!(service = self.name, error = %e, "service task ended abnormally");
        }
    }
}

/// Resolves once shutdown is requested or every sender is gone.
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    // wait_for returns Err only when the sender was dropped, which also means stop.
    let _ = rx.wait_for(|stop| *stop).await;
}
