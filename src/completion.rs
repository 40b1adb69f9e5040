//! Pending-completion handoff
//!
//! A single-slot rendezvous between an asynchronous operation and the one
//! caller waiting on it. The slot holds the sending half of a oneshot
//! channel; `put` arms it and hands back the receiving future, `post`
//! delivers the completion value from any thread and clears the slot.

use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::ServerError;

pub struct HandlerStorage<A> {
    target: Mutex<Option<oneshot::Sender<A>>>,
}

impl<A: Send> HandlerStorage<A> {
    pub fn new() -> Self {
        Self {
            target: Mutex::new(None),
        }
    }

    /// Arms the slot and returns the future that resolves when the value is
    /// posted. At most one handler may be resident: a second `put` before
    /// `post` or `cancel` fails with `invalid_state`.
    pub fn put(&self) -> Result<oneshot::Receiver<A>, ServerError> {
        let mut target = self.target.lock().unwrap();
        if target.is_some() {
            return Err(ServerError::InvalidState);
        }
        let (tx, rx) = oneshot::channel();
        *target = Some(tx);
        Ok(rx)
    }

    /// Moves the handler out and delivers `value` to it. Returns false when
    /// no handler was resident or the waiter has already gone away; the
    /// value is dropped in that case.
    pub fn post(&self, value: A) -> bool {
        let target = self.target.lock().unwrap().take();
        match target {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Drops the resident handler, if any, without invoking it. The waiter
    /// observes a canceled channel.
    pub fn cancel(&self) {
        self.target.lock().unwrap().take();
    }

    pub fn has_target(&self) -> bool {
        self.target.lock().unwrap().is_some()
    }
}

impl<A: Send> Default for HandlerStorage<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_then_post_delivers_value() {
        let storage = HandlerStorage::new();
        let rx = storage.put().unwrap();
        assert!(storage.has_target());
        assert!(storage.post(42u32));
        assert!(!storage.has_target());
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_second_put_is_invalid_state() {
        let storage = HandlerStorage::<u32>::new();
        let _rx = storage.put().unwrap();
        assert_eq!(storage.put().unwrap_err(), ServerError::InvalidState);
    }

    #[tokio::test]
    async fn test_post_without_target_is_lost() {
        let storage = HandlerStorage::<u32>::new();
        assert!(!storage.post(1));
    }

    #[tokio::test]
    async fn test_cancel_drops_handler_uninvoked() {
        let storage = HandlerStorage::<u32>::new();
        let rx = storage.put().unwrap();
        storage.cancel();
        assert!(!storage.has_target());
        assert!(rx.await.is_err());

        // Slot is reusable after cancel.
        let _rx = storage.put().unwrap();
    }

    #[tokio::test]
    async fn test_post_from_other_thread() {
        let storage = std::sync::Arc::new(HandlerStorage::new());
        let rx = storage.put().unwrap();
        let poster = std::sync::Arc::clone(&storage);
        std::thread::spawn(move || {
            poster.post(7u32);
        });
        assert_eq!(rx.await.unwrap(), 7);
    }
}
