use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};

struct Shared {
    closed: AtomicBool,
    closed_notify: Notify,
    on_close: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    close_fired: AtomicBool,
}

impl Shared {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.closed_notify.notify_waiters();
        if self
            .close_fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let callbacks = std::mem::take(&mut *self.on_close.lock().unwrap());
            for cb in callbacks {
                cb();
            }
        }
    }
}

/// One-producer, one-consumer stream with a fixed capacity. Writes block
/// until a slot is free; once closed, writers observe a no-op and readers
/// drain whatever was already buffered before seeing end-of-stream.
pub fn bounded_stream<T: Send + 'static>(
    capacity: usize,
) -> (BoundedStreamWriter<T>, BoundedStreamReader<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let shared = Arc::new(Shared {
        closed: AtomicBool::new(false),
        closed_notify: Notify::new(),
        on_close: Mutex::new(Vec::new()),
        close_fired: AtomicBool::new(false),
    });
    (
        BoundedStreamWriter {
            tx,
            shared: shared.clone(),
        },
        BoundedStreamReader {
            rx,
            pending: None,
            shared,
        },
    )
}

type Item<T> = Result<T, String>;

pub struct BoundedStreamWriter<T> {
    tx: mpsc::Sender<Item<T>>,
    shared: Arc<Shared>,
}

impl<T: Send + 'static> BoundedStreamWriter<T> {
    /// Blocks until capacity is available; a no-op if the stream is closed.
    pub async fn write(&self, value: T) {
        self.send(Ok(value)).await;
    }

    pub async fn write_error(&self, error: impl Into<String>) {
        self.send(Err(error.into())).await;
    }

    async fn send(&self, item: Item<T>) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        tokio::select! {
            biased;
            _ = self.shared.closed_notify.notified() => {}
            res = self.tx.send(item) => { let _ = res; }
        }
    }

    pub fn close(&self) {
        self.shared.close();
    }
}

impl<T> Clone for BoundedStreamWriter<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: self.shared.clone(),
        }
    }
}

pub struct BoundedStreamReader<T> {
    rx: mpsc::Receiver<Item<T>>,
    pending: Option<Item<T>>,
    shared: Arc<Shared>,
}

impl<T> BoundedStreamReader<T> {
    /// Advances to the next item. Returns `false` once the stream is closed
    /// and fully drained.
    pub async fn next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(item) => {
                self.pending = Some(item);
                true
            }
            None => false,
        }
    }

    /// Takes the item staged by the last successful `next()` call.
    pub fn read(&mut self) -> (Option<T>, Option<String>) {
        match self.pending.take() {
            Some(Ok(v)) => (Some(v), None),
            Some(Err(e)) => (None, Some(e)),
            None => (None, None),
        }
    }

    pub fn on_close(&self, f: impl FnOnce() + Send + 'static) {
        self.shared.on_close.lock().unwrap().push(Box::new(f));
    }

    pub fn close(&self) {
        self.shared.close();
    }
}
