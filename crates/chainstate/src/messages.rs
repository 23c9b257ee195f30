//! Chain event fan-out: observers get a bare "tip changed" callback, message
//! queues receive the structured event stream in chain-lock order.

use crossbeam_channel::Sender;
use umbrad_crypto::Hash;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BlockchainMessage {
    NewBlock(Hash),
    NewAlternativeBlock(Hash),
    /// Hashes from the common ancestor (inclusive) to the new tip after a
    /// reorganization.
    ChainSwitch(Vec<Hash>),
}

pub trait BlockchainObserver: Send + Sync {
    fn blockchain_updated(&self);
}

pub(crate) struct MessageQueues {
    queues: Vec<(usize, Sender<BlockchainMessage>)>,
    next_id: usize,
}

impl MessageQueues {
    pub fn new() -> Self {
        Self {
            queues: Vec::new(),
            next_id: 0,
        }
    }

    pub fn add(&mut self, sender: Sender<BlockchainMessage>) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        self.queues.push((id, sender));
        id
    }

    pub fn remove(&mut self, id: usize) -> bool {
        let before = self.queues.len();
        self.queues.retain(|(queue_id, _)| *queue_id != id);
        self.queues.len() != before
    }

    /// Sends to every queue, dropping queues whose receiver is gone.
    pub fn send(&mut self, message: &BlockchainMessage) {
        self.queues
            .retain(|(_, sender)| sender.send(message.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn send_reaches_all_live_queues() {
        let mut queues = MessageQueues::new();
        let (tx_a, rx_a) = unbounded();
        let (tx_b, rx_b) = unbounded();
        let id_a = queues.add(tx_a);
        queues.add(tx_b);

        queues.send(&BlockchainMessage::NewBlock([1u8; 32]));
        assert_eq!(rx_a.try_recv().ok(), Some(BlockchainMessage::NewBlock([1u8; 32])));
        assert_eq!(rx_b.try_recv().ok(), Some(BlockchainMessage::NewBlock([1u8; 32])));

        assert!(queues.remove(id_a));
        assert!(!queues.remove(id_a));
        queues.send(&BlockchainMessage::NewAlternativeBlock([2u8; 32]));
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn disconnected_queues_are_pruned() {
        let mut queues = MessageQueues::new();
        let (tx, rx) = unbounded();
        queues.add(tx);
        drop(rx);
        queues.send(&BlockchainMessage::NewBlock([3u8; 32]));
        queues.send(&BlockchainMessage::NewBlock([4u8; 32]));
    }
}
