use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct UploadQueue<T> {
    inner: Mutex<VecDeque<T>>,
    available: Notify,
}

impl<T> Default for UploadQueue<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            available: Notify::new(),
        }
    }
}

impl<T> UploadQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: T) {
        self.lock().push_back(item);
        self.available.notify_one();
    }

    /// Returns an item taken by a consumer that could not process it.
    pub fn push_front(&self, item: T) {
        self.lock().push_front(item);
        self.available.notify_one();
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    pub async fn pop(&self, cancel: &CancellationToken) -> Option<T> {
        loop {
            let notified = self.available.notified();
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = notified => {}
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
