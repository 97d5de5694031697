//! Multi-subscriber event channel.

use std::time::Duration;

use crossbeam_channel::{self, RecvTimeoutError, Sender, TrySendError};
use log::warn;
use parking_lot::RwLock;

pub struct Channel<T> {
    buffer_size: usize,
    txs: RwLock<Vec<Sender<T>>>,
}

pub struct Receiver<T> {
    rx: crossbeam_channel::Receiver<T>,
}

impl<T> Channel<T>
where
    T: Clone,
{
    pub fn new(buffer_size: usize) -> Channel<T> {
        Channel {
            buffer_size: buffer_size,
            txs: RwLock::new(Vec::new()),
        }
    }

    /// Delivers `data` to every subscriber without blocking. A subscriber
    /// whose buffer is full misses this event; one that has hung up is
    /// removed.
    pub fn publish(&self, data: T) {
        let mut dead_txs = Vec::new();

        {
            let txs = self.txs.read();

            for (index, tx) in txs.iter().enumerate() {
                match tx.try_send(data.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => warn!("event subscriber {} is lagging, dropping event", index),
                    Err(TrySendError::Disconnected(_)) => dead_txs.push(index),
                }
            }
        }

        if !dead_txs.is_empty() {
            let mut txs = self.txs.write();

            // highest index first so swap_remove cannot move a dead entry
            for dead_tx_index in dead_txs.into_iter().rev() {
                txs.swap_remove(dead_tx_index);
            }
        }
    }

    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = crossbeam_channel::bounded(self.buffer_size);

        self.txs.write().push(tx);

        Receiver { rx: rx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.txs.read().len()
    }
}

impl<T> Receiver<T> {
    /// Blocks for the next event; `None` once the channel is gone.
    pub fn recv(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(data) => Some(data),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.rx.iter()
    }
}
