use std::{future::Future, time::Duration};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{Error, Result};

/// Receiving end of a delivery loop.
#[async_trait]
pub trait Subscriber<T: Send + 'static>: Send {
    async fn push(&mut self, message: T) -> Result<()>;

    /// Non-blocking check made once per iteration, after the wait.
    fn is_cancelled(&self) -> bool;
}

#[async_trait]
impl<T: Send + 'static> Subscriber<T> for mpsc::Sender<T> {
    async fn push(&mut self, message: T) -> Result<()> {
        self.send(message).await.map_err(|_| Error::SubscriberGone)
    }

    fn is_cancelled(&self) -> bool {
        self.is_closed()
    }
}

/// Produces and pushes a fresh message every `interval` until the subscriber
/// is cancelled. A failed push or a failed `produce` ends the loop with that
/// error; a message that is being produced is never interrupted.
pub async fn deliver<T, S, F, Fut>(interval: Duration, mut subscriber: S, mut produce: F) -> Result<()>
where
    T: Send + 'static,
    S: Subscriber<T>,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        let message = produce().await?;
        subscriber.push(message).await?;

        tokio::time::sleep(interval).await;

        if subscriber.is_cancelled() {
            debug!("Subscriber cancelled, stopping delivery");
            return Ok(());
        }
    }
}
