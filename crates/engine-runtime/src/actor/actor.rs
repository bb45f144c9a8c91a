use crate::error::ActorError;
use async_trait::async_trait;
use std::{fmt::Debug, sync::Arc};
use tokio::sync::{mpsc, oneshot};

/// A mailbox-driven task that owns its state.
///
/// Messages are handled one at a time in arrival order, so an actor is the
/// single writer for whatever it owns. An error from `handle` is logged and
/// the loop moves on to the next message.
#[async_trait]
pub trait Actor: Send + 'static {
    type Msg: Send + Debug + 'static;

    fn name(&self) -> &str;

    async fn handle(&mut self, msg: Self::Msg) -> Result<(), ActorError>;

    /// Called once after the last sender is gone and the mailbox drained.
    async fn on_stop(&mut self, _handled: u64) {}
}

/// Sending side of an actor mailbox.
#[derive(Debug)]
pub struct ActorRef<M> {
    name: Arc<str>,
    tx: mpsc::Sender<M>,
}

impl<M> Clone for ActorRef<M> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<M: Send + Debug + 'static> ActorRef<M> {
    pub(crate) fn new(name: &str, tx: mpsc::Sender<M>) -> Self {
        Self {
            name: Arc::from(name),
            tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues `msg`, waiting for mailbox capacity.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.send(msg).await.map_err(|_| ActorError::MailboxClosed)
    }

    /// Sends a message carrying a reply channel and waits for the answer.
    pub async fn request<R, F>(&self, build: F) -> Result<R, ActorError>
    where
        F: FnOnce(oneshot::Sender<R>) -> M,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(build(reply_tx)).await?;
        reply_rx
            .await
            .map_err(|_| ActorError::Internal(format!("{} dropped the reply", self.name)))
    }
}
