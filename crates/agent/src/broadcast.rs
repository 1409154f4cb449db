//! Latest-value fan-out: one dispatch task owns the subscriber list and
//! hands each published value to every subscriber that has room for it.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

enum Command<T> {
    Publish(T),
    Subscribe(mpsc::Sender<T>),
    Count(oneshot::Sender<usize>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("broadcast dispatch loop has stopped")]
pub struct BroadcastClosed;

/// Handle to a running broadcast. Cloned handles share the same loop.
pub struct Broadcast<T> {
    commands: mpsc::Sender<Command<T>>,
}

impl<T> Clone for Broadcast<T> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Broadcast<T> {
    /// Spawn the dispatch loop. It runs until `cancel` fires or every handle
    /// is dropped.
    pub fn start(cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (commands, rx) = mpsc::channel(16);
        let handle = tokio::spawn(dispatch(rx, cancel));
        (Self { commands }, handle)
    }

    pub async fn publish(&self, value: T) -> Result<(), BroadcastClosed> {
        self.commands
            .send(Command::Publish(value))
            .await
            .map_err(|_| BroadcastClosed)
    }

    /// Register a new subscriber. The receiver holds at most one undelivered
    /// value; values published while it is full are skipped for it.
    pub async fn subscribe(&self) -> Result<mpsc::Receiver<T>, BroadcastClosed> {
        let (tx, rx) = mpsc::channel(1);
        self.commands
            .send(Command::Subscribe(tx))
            .await
            .map_err(|_| BroadcastClosed)?;
        Ok(rx)
    }

    /// Number of live subscribers, as seen by the dispatch loop.
    pub async fn subscriber_count(&self) -> Result<usize, BroadcastClosed> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Count(tx))
            .await
            .map_err(|_| BroadcastClosed)?;
        rx.await.map_err(|_| BroadcastClosed)
    }
}

async fn dispatch<T: Clone>(mut rx: mpsc::Receiver<Command<T>>, cancel: CancellationToken) {
    let mut subscribers: Vec<mpsc::Sender<T>> = Vec::new();
    loop {
        let cmd = tokio::select! {
            _ = cancel.cancelled() => break,
            cmd = rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
        };
        match cmd {
            Command::Publish(value) => {
                subscribers.retain(|sub| match sub.try_send(value.clone()) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
            Command::Subscribe(tx) => subscribers.push(tx),
            Command::Count(reply) => {
                subscribers.retain(|sub| !sub.is_closed());
                let _ = reply.send(subscribers.len());
            }
        }
    }
    tracing::debug!("Broadcast dispatch loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn every_subscriber_gets_the_value() {
        let (bc, _h) = Broadcast::start(CancellationToken::new());
        let mut a = bc.subscribe().await.unwrap();
        let mut b = bc.subscribe().await.unwrap();
        bc.publish(7u32).await.unwrap();
        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[tokio::test]
    async fn full_subscriber_is_skipped_not_awaited() {
        let (bc, _h) = Broadcast::start(CancellationToken::new());
        let mut slow = bc.subscribe().await.unwrap();
        let mut fast = bc.subscribe().await.unwrap();

        for v in 1..=3u32 {
            bc.publish(v).await.unwrap();
            let got = tokio::time::timeout(Duration::from_secs(1), fast.recv())
                .await
                .expect("publisher stalled behind the slow subscriber");
            assert_eq!(got, Some(v));
        }
        // The slow subscriber kept only the first value it had room for.
        assert_eq!(slow.recv().await, Some(1));
        assert!(slow.try_recv().is_err());
    }

    #[tokio::test]
    async fn late_subscriber_sees_only_later_values() {
        let (bc, _h) = Broadcast::start(CancellationToken::new());
        bc.publish("early").await.unwrap();
        let mut sub = bc.subscribe().await.unwrap();
        bc.publish("late").await.unwrap();
        assert_eq!(sub.recv().await, Some("late"));
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let (bc, _h) = Broadcast::start(CancellationToken::new());
        let keep = bc.subscribe().await.unwrap();
        let gone = bc.subscribe().await.unwrap();
        assert_eq!(bc.subscriber_count().await.unwrap(), 2);
        drop(gone);
        bc.publish(1u8).await.unwrap();
        assert_eq!(bc.subscriber_count().await.unwrap(), 1);
        drop(keep);
    }

    #[tokio::test]
    async fn cancel_stops_the_loop() {
        let cancel = CancellationToken::new();
        let (bc, handle) = Broadcast::<u8>::start(cancel.clone());
        let mut sub = bc.subscribe().await.unwrap();
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(sub.recv().await, None);
        assert_eq!(bc.publish(1).await, Err(BroadcastClosed));
    }
}
