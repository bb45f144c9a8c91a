use crate::actor::{Actor, ActorRef};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

/// Runs `actor` on its own task. The loop drains the mailbox and ends once
/// every [`ActorRef`] has been dropped.
pub fn spawn_actor<A: Actor>(mailbox_capacity: usize, mut actor: A) -> (ActorRef<A::Msg>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<A::Msg>(mailbox_capacity.max(1));
    let actor_ref = ActorRef::new(actor.name(), tx);

    let handle = tokio::spawn(async move {
        let mut handled = 0u64;
        while let Some(msg) = rx.recv().await {
            handled += 1;
            if let Err(e) = actor.handle(msg).await {
                warn!(actor = actor.name(), error = %e, "Message handling failed");
            }
        }
        actor.on_stop(handled).await;
        debug!(actor = actor.name(), handled, "Mailbox closed");
    });

    (actor_ref, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ActorError;
    use async_trait::async_trait;
    use tokio::sync::oneshot;

    #[derive(Debug)]
    enum Msg {
        Push(u32),
        Drain(oneshot::Sender<Vec<u32>>),
        Reject,
    }

    struct Recorder {
        seen: Vec<u32>,
        stopped: Option<oneshot::Sender<u64>>,
    }

    #[async_trait]
    impl Actor for Recorder {
        type Msg = Msg;

        fn name(&self) -> &str {
            "recorder"
        }

        async fn handle(&mut self, msg: Msg) -> Result<(), ActorError> {
            match msg {
                Msg::Push(n) => self.seen.push(n),
                Msg::Drain(reply) => {
                    let _ = reply.send(std::mem::take(&mut self.seen));
                }
                Msg::Reject => return Err(ActorError::Internal("rejected".into())),
            }
            Ok(())
        }

        async fn on_stop(&mut self, handled: u64) {
            if let Some(tx) = self.stopped.take() {
                let _ = tx.send(handled);
            }
        }
    }

    #[tokio::test]
    async fn messages_are_handled_in_order_and_errors_do_not_stop_the_loop() {
        let (stopped_tx, stopped_rx) = oneshot::channel();
        let (actor, handle) = spawn_actor(
            4,
            Recorder {
                seen: Vec::new(),
                stopped: Some(stopped_tx),
            },
        );
        assert_eq!(actor.name(), "recorder");

        for n in 1..=3 {
            actor.send(Msg::Push(n)).await.unwrap();
        }
        actor.send(Msg::Reject).await.unwrap();
        actor.send(Msg::Push(4)).await.unwrap();

        let seen = actor.request(Msg::Drain).await.unwrap();
        assert_eq!(seen, vec![1, 2, 3, 4]);

        drop(actor);
        handle.await.unwrap();
        assert_eq!(stopped_rx.await.unwrap(), 6);
    }
}
