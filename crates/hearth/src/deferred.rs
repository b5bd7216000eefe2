//! Correlation primitive
//!
//! A `Deferred` is the resolving half of a one-shot reply; `Pending` is the
//! future its single consumer awaits. Completing consumes the `Deferred`, so a
//! second resolve or reject cannot be written. Dropping an uncompleted
//! `Deferred` rejects its `Pending` instead of leaving it hanging.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// Create a linked resolver/future pair
pub fn channel<T>() -> (Deferred<T>, Pending<T>) {
    let (tx, rx) = oneshot::channel();
    (Deferred { tx: Some(tx) }, Pending { rx })
}

/// Resolving half of a reply
#[derive(Debug)]
pub struct Deferred<T> {
    tx: Option<oneshot::Sender<Result<T>>>,
}

impl<T> Deferred<T> {
    pub fn resolve(mut self, value: T) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Ok(value));
        }
    }

    pub fn reject(mut self, error: Error) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(error));
        }
    }

    /// Resolve or reject from a result
    pub fn settle(self, result: Result<T>) {
        match result {
            Ok(value) => self.resolve(value),
            Err(e) => self.reject(e),
        }
    }
}

impl<T> Drop for Deferred<T> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(Error::Abandoned("resolver dropped".to_string())));
        }
    }
}

/// Future side of a reply
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Pending<T> {
    /// A pending reply that has already failed
    pub fn failed(error: Error) -> Self {
        let (deferred, pending) = channel();
        deferred.reject(error);
        pending
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Abandoned(
                "resolver dropped".to_string(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Correlation table
// ─────────────────────────────────────────────────────────────────────────────

/// Outstanding requests keyed by correlation id
#[derive(Debug)]
pub struct CorrelationTable<T> {
    entries: HashMap<u64, Deferred<T>>,
}

impl<T> Default for CorrelationTable<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> CorrelationTable<T> {
    pub fn insert(&mut self, id: u64, deferred: Deferred<T>) {
        if let Some(previous) = self.entries.insert(id, deferred) {
            previous.reject(Error::Abandoned(format!("correlation id {} reused", id)));
        }
    }

    pub fn take(&mut self, id: u64) -> Option<Deferred<T>> {
        self.entries.remove(&id)
    }

    /// Reject every outstanding entry
    pub fn reject_all(&mut self, reason: &str) {
        for (_, deferred) in self.entries.drain() {
            deferred.reject(Error::Abandoned(reason.to_string()));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Slot
// ─────────────────────────────────────────────────────────────────────────────

/// Holds at most one in-flight request
#[derive(Debug)]
pub struct Slot<T> {
    what: &'static str,
    inner: Mutex<Option<Deferred<T>>>,
}

impl<T> Slot<T> {
    pub fn new(what: &'static str) -> Self {
        Self {
            what,
            inner: Mutex::new(None),
        }
    }

    /// Claim the slot. Fails while another request is in flight.
    pub fn claim(&self) -> Result<Pending<T>> {
        let mut inner = self.inner.lock();
        if inner.is_some() {
            return Err(Error::Busy(self.what.to_string()));
        }
        let (deferred, pending) = channel();
        *inner = Some(deferred);
        Ok(pending)
    }

    pub fn take(&self) -> Option<Deferred<T>> {
        self.inner.lock().take()
    }

    pub fn is_claimed(&self) -> bool {
        self.inner.lock().is_some()
    }

    pub fn reject(&self, reason: &str) {
        if let Some(deferred) = self.take() {
            deferred.reject(Error::Abandoned(reason.to_string()));
        }
    }
}
