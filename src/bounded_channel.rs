// SPDX-License-Identifier: Apache-2.0

//! Bounded MPMC channel used between the tailer, the transform pipeline and
//! the indexer mailbox. Backed by flume so senders get backpressure instead
//! of unbounded queue growth when the indexer falls behind.

use flume::{Receiver, Sender};
use std::fmt;

pub struct BoundedSender<T> {
    tx: Sender<T>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    Disconnected,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Disconnected => write!(f, "channel disconnected"),
        }
    }
}

impl std::error::Error for SendError {}

impl<T> BoundedSender<T> {
    pub async fn send(&self, item: T) -> Result<(), SendError> {
        match self.tx.send_async(item).await {
            Ok(()) => Ok(()),
            Err(_e) => Err(SendError::Disconnected), // receiver closed
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

impl<T> Clone for BoundedSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

pub struct BoundedReceiver<T> {
    rx: Receiver<T>,
}

impl<T> BoundedReceiver<T> {
    pub async fn next(&mut self) -> Option<T> {
        match self.rx.recv_async().await {
            Ok(item) => Some(item),
            Err(_e) => None, // disconnected
        }
    }

    /// Non-blocking receive. Returns None when no item is ready or the
    /// channel is disconnected.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

pub fn bounded<T>(size: usize) -> (BoundedSender<T>, BoundedReceiver<T>) {
    let (tx, rx) = flume::bounded::<T>(size);

    (BoundedSender { tx }, BoundedReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::{bounded, SendError};
    use tokio_test::{assert_ok, assert_pending, assert_ready, task::spawn};

    #[tokio::test]
    async fn send_and_receive() {
        let (tx, mut rx) = bounded(2);

        assert_ok!(tx.send(1).await);
        assert_ok!(tx.send(2).await);
        assert_eq!(Some(1), rx.next().await);
        assert_eq!(Some(2), rx.next().await);

        drop(tx);
        assert_eq!(None, rx.next().await);
    }

    #[tokio::test]
    async fn sender_blocks_on_full() {
        let (tx, mut rx) = bounded(1);

        let mut send1 = spawn(async { tx.send(10).await });
        assert_ok!(assert_ready!(send1.poll()));
        drop(send1);

        let mut send2 = spawn(async { tx.send(20).await });
        assert_pending!(send2.poll());

        assert_eq!(Some(10), rx.next().await);
        assert_ok!(assert_ready!(send2.poll()));
    }

    #[tokio::test]
    async fn sender_fails_on_rx_close() {
        let (tx, rx) = bounded::<u32>(1);
        drop(rx);
        assert_eq!(Err(SendError::Disconnected), tx.send(1).await);
    }

    #[tokio::test]
    async fn try_recv_is_non_blocking() {
        let (tx, rx) = bounded(1);
        assert_eq!(None, rx.try_recv());
        assert_ok!(tx.send(5).await);
        assert_eq!(Some(5), rx.try_recv());
    }
}
