use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handler invoked once per services-refreshed publication, on a worker
/// owned by the bus.
#[async_trait]
pub trait RefreshedHandler: Send + Sync + 'static {
    async fn handle(&self) -> anyhow::Result<()>;
}

#[derive(thiserror::Error, Debug)]
#[error("cannot subscribe after the bus has started")]
pub struct SubscribeError;

/// Single-topic fan-out for "services refreshed" notifications.
///
/// Publishing never blocks. Each subscriber drains its own queue on a
/// dedicated worker, so notifications are serialized per subscriber while
/// distinct subscribers run independently. There is no replay: subscribers
/// only observe publications that happen after `start`, and a subscriber
/// that falls behind the buffer coalesces the missed publications into its
/// next run.
pub struct EventBus {
    tx: broadcast::Sender<()>,
    handlers: Mutex<Vec<Arc<dyn RefreshedHandler>>>,
    started: AtomicBool,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        EventBus {
            tx,
            handlers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Registers a handler. Must happen before `start`; the set of workers is
    /// fixed once the bus is running.
    pub fn subscribe(&self, handler: Arc<dyn RefreshedHandler>) -> Result<(), SubscribeError> {
        if self.started.load(Ordering::Acquire) {
            return Err(SubscribeError);
        }
        self.handlers.lock().expect("handler lock poisoned").push(handler);
        Ok(())
    }

    /// Enqueues one notification for every subscriber.
    pub fn publish(&self) {
        if self.tx.send(()).is_err() {
            debug!("publishing services-refreshed event with no subscribers");
        }
    }

    /// Spawns one worker per subscriber. Workers stop when the token is
    /// cancelled. Receivers are attached before this returns, so any
    /// publication after `start` is observed.
    pub fn start(&self, token: CancellationToken) {
        self.started.store(true, Ordering::Release);
        let handlers = self.handlers.lock().expect("handler lock poisoned").clone();
        for handler in handlers {
            let mut rx = self.tx.subscribe();
            let token = token.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => {
                            debug!("event bus worker stopped");
                            return;
                        },
                        event = rx.recv() => match event {
                            Ok(()) => {
                                if let Err(e) = handler.handle().await {
                                    warn!(error = %e, "services-refreshed handler failed");
                                }
                            },
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "event bus worker lagged; coalescing missed notifications");
                            },
                            Err(broadcast::error::RecvError::Closed) => return,
                        },
                    }
                }
            });
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
