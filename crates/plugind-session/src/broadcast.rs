use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

/// One-producer, N-consumer fan-out. `send` never blocks on an individual
/// slow consumer: once a subscriber's queue exceeds `watermark` buffered
/// items, it is dropped and its `on_close` callback fires.
pub struct Broadcaster<T> {
    watermark: usize,
    subscribers: RwLock<HashMap<u64, Subscriber<T>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

struct Subscriber<T> {
    tx: mpsc::Sender<T>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

pub struct BroadcastReceiver<T> {
    id: u64,
    rx: mpsc::Receiver<T>,
}

impl<T> BroadcastReceiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    pub fn new(watermark: usize) -> Self {
        Self {
            watermark: watermark.max(1),
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn subscribe(&self) -> BroadcastReceiver<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.watermark);
        self.subscribers
            .write()
            .await
            .insert(id, Subscriber { tx, on_close: None });
        BroadcastReceiver { id, rx }
    }

    pub async fn on_close(&self, id: u64, f: impl FnOnce() + Send + 'static) {
        if let Some(sub) = self.subscribers.write().await.get_mut(&id) {
            sub.on_close = Some(Box::new(f));
        }
    }

    /// Delivers `value` to every currently subscribed sink. A subscriber
    /// whose queue is full (at or beyond `watermark`) is dropped instead of
    /// blocking the sender.
    pub async fn send(&self, value: T) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut dead = Vec::new();
        {
            let subs = self.subscribers.read().await;
            for (id, sub) in subs.iter() {
                if sub.tx.try_send(value.clone()).is_err() {
                    dead.push(*id);
                }
            }
        }
        if !dead.is_empty() {
            let mut subs = self.subscribers.write().await;
            for id in dead {
                if let Some(sub) = subs.remove(&id) {
                    if let Some(cb) = sub.on_close {
                        cb();
                    }
                }
            }
        }
    }

    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut subs = self.subscribers.write().await;
        for (_, sub) in subs.drain() {
            if let Some(cb) = sub.on_close {
                cb();
            }
        }
    }
}
