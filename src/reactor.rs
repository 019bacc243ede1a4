//! A small publish/subscribe bus. Every subscriber gets its own bounded channel and publishing
//! blocks while a subscriber's channel is full, so a slow consumer slows the producer down instead
//! of losing events.
use std::collections::hash_map::HashMap;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::block::Block;
use crate::error::TxError;
use crate::state_transition::Message;
use crate::tx::Tx;

pub mod topics {
    pub const NEW_BLOCK: &str = "newBlock";
    pub const NEW_TX_PRE: &str = "newTx:pre";
    pub const NEW_TX_PRE_FAIL: &str = "newTx:pre:fail";
    pub const NEW_TX_POST: &str = "newTx:post";
    pub const NEW_TX_POST_FAIL: &str = "newTx:post:fail";
    pub const CHAIN_READY: &str = "chainReady";
    pub const CHAIN_SYNC: &str = "chainSync";
    pub const MESSAGES: &str = "messages";
}

#[derive(Clone, Debug)]
pub enum Event {
    Block(Arc<Block>),
    Tx(Arc<Tx>),
    TxFailed(Arc<Tx>, TxError),
    Ready,
    /// true while the node is catching up with its peers
    Sync(bool),
    Messages(Arc<Vec<Message>>),
}

/// Events collected while a lock is held, posted in order once it is released.
pub type Events = Vec<(&'static str, Event)>;

pub struct Reactor {
    subscribers: Mutex<HashMap<String, Vec<SyncSender<Event>>>>,
    capacity: usize,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Reactor {
    /// `capacity` is the number of events buffered per subscriber before `post` blocks; zero
    /// makes every delivery a rendezvous.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn subscribe(&self, topic: &str) -> Receiver<Event> {
        let (tx, rx) = sync_channel(self.capacity);
        self.subscribers
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Deliver `event` to every subscriber of `topic`, waiting for room in each channel.
    /// Subscribers whose receiver is gone are dropped.
    pub fn post(&self, topic: &str, event: Event) {
        let senders = match self.subscribers.lock().get(topic) {
            Some(s) if !s.is_empty() => s.clone(),
            _ => return,
        };
        trace!("posting to {} subscriber(s) of {}", senders.len(), topic);
        let mut dead = Vec::new();
        for (i, s) in senders.iter().enumerate() {
            if s.send(event.clone()).is_err() {
                dead.push(i);
            }
        }
        if dead.is_empty() {
            return
        }
        debug!("dropping {} closed subscriber(s) of {}", dead.len(), topic);
        let mut subs = self.subscribers.lock();
        if let Some(list) = subs.get_mut(topic) {
            // senders are only ever appended, so indices below the snapshot length still match
            for i in dead.into_iter().rev() {
                if i < list.len() {
                    list.remove(i);
                }
            }
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers.lock().get(topic).map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fan_out() {
        let r = Reactor::new(4);
        let a = r.subscribe(topics::CHAIN_SYNC);
        let b = r.subscribe(topics::CHAIN_SYNC);
        let c = r.subscribe(topics::CHAIN_READY);
        r.post(topics::CHAIN_SYNC, Event::Sync(true));
        assert!(matches!(a.try_recv(), Ok(Event::Sync(true))));
        assert!(matches!(b.try_recv(), Ok(Event::Sync(true))));
        assert!(c.try_recv().is_err());
        drop(a);
        r.post(topics::CHAIN_SYNC, Event::Sync(false));
        assert_eq!(r.subscriber_count(topics::CHAIN_SYNC), 1);
        // nobody listening is fine
        r.post(topics::NEW_BLOCK, Event::Ready);
    }

    #[test]
    fn test_post_blocks_on_full_channel() {
        let r = Arc::new(Reactor::new(0));
        let rx = r.subscribe(topics::CHAIN_READY);
        let r2 = r.clone();
        let h = std::thread::spawn(move || {
            r2.post(topics::CHAIN_READY, Event::Ready);
            r2.post(topics::CHAIN_READY, Event::Ready);
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(!h.is_finished());
        assert!(rx.recv().is_ok());
        assert!(rx.recv().is_ok());
        h.join().unwrap();
    }
}
