//! Restartable configuration streams for live reload
//!
//! A [`ConfigSource`] is the producer side: resource handlers publish the
//! current options of a live resource on every pass. Any number of
//! [`ConfigStream`]s consume it. Each new stream starts from the latest value,
//! intermediate values may be skipped, and a stream never terminates on its own
//! until the source is dropped or the consumer is cancelled.

use crate::cancel::Cancellation;
use std::sync::Arc;
use tokio::sync::watch;

/// Producer of configuration values
#[derive(Debug)]
pub struct ConfigSource<T> {
    tx: Arc<watch::Sender<Option<T>>>,
}

impl<T> Clone for ConfigSource<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T: Clone + Send + Sync> Default for ConfigSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync> ConfigSource<T> {
    /// A source with no value yet
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn with_value(value: T) -> Self {
        let (tx, _rx) = watch::channel(Some(value));
        Self { tx: Arc::new(tx) }
    }

    /// Replace the current value and wake consumers
    pub fn publish(&self, value: T) {
        self.tx.send_replace(Some(value));
    }

    pub fn current(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// A new consumer starting at the current value
    pub fn subscribe(&self) -> ConfigStream<T> {
        ConfigStream {
            rx: self.tx.subscribe(),
            primed: false,
        }
    }
}

/// Consumer of a [`ConfigSource`]
#[derive(Debug)]
pub struct ConfigStream<T> {
    rx: watch::Receiver<Option<T>>,
    primed: bool,
}

impl<T: Clone + Send + Sync> ConfigStream<T> {
    /// Wait for the next value. `None` once cancelled or the source is gone.
    pub async fn next(&mut self, cancel: &Cancellation) -> Option<T> {
        if cancel.is_cancelled() {
            return None;
        }

        if !self.primed {
            self.primed = true;
            if let Some(value) = self.rx.borrow_and_update().clone() {
                return Some(value);
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                    if let Some(value) = self.rx.borrow_and_update().clone() {
                        return Some(value);
                    }
                }
            }
        }
    }
}
