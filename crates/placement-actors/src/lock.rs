//! Actor turn lock
//!
//! One caller executes inside an actor at a time. A call chain carrying the
//! same request id may re-enter up to `max_stack_depth` frames; any other
//! caller queues on the underlying mutex in FIFO order.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::{ActorError, Result};

pub const DEFAULT_MAX_STACK_DEPTH: u32 = 32;

#[derive(Default)]
struct Holder {
    request_id: Option<String>,
    stack_depth: u32,
    guard: Option<OwnedMutexGuard<()>>,
}

pub struct ActorLock {
    method_lock: Arc<AsyncMutex<()>>,
    holder: Mutex<Holder>,
    max_stack_depth: u32,
}

impl std::fmt::Debug for ActorLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let holder = self.holder.lock();
        f.debug_struct("ActorLock")
            .field("request_id", &holder.request_id)
            .field("stack_depth", &holder.stack_depth)
            .field("max_stack_depth", &self.max_stack_depth)
            .finish()
    }
}

impl ActorLock {
    pub fn new(max_stack_depth: u32) -> Self {
        Self {
            method_lock: Arc::new(AsyncMutex::new(())),
            holder: Mutex::new(Holder::default()),
            max_stack_depth: max_stack_depth.max(1),
        }
    }

    /// Acquire the turn. `None` never re-enters.
    pub async fn lock(&self, request_id: Option<&str>) -> Result<()> {
        if let Some(id) = request_id {
            let mut holder = self.holder.lock();
            if holder.request_id.as_deref() == Some(id) {
                if holder.stack_depth >= self.max_stack_depth {
                    return Err(ActorError::MaxStackDepthExceeded);
                }
                holder.stack_depth += 1;
                return Ok(());
            }
        }

        let guard = self.method_lock.clone().lock_owned().await;
        let mut holder = self.holder.lock();
        holder.request_id = request_id.map(str::to_string);
        holder.stack_depth = 1;
        holder.guard = Some(guard);
        Ok(())
    }

    /// Pop one frame; the last frame releases the turn
    pub fn unlock(&self) {
        let mut holder = self.holder.lock();
        if holder.stack_depth == 0 {
            log::error!("Actor lock released while not held");
            return;
        }
        holder.stack_depth -= 1;
        if holder.stack_depth == 0 {
            holder.request_id = None;
            holder.guard = None;
        }
    }

    pub fn stack_depth(&self) -> u32 {
        self.holder.lock().stack_depth
    }

    pub fn is_locked(&self) -> bool {
        self.stack_depth() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reentrant_same_request() {
        let lock = ActorLock::new(3);
        lock.lock(Some("req-1")).await.unwrap();
        lock.lock(Some("req-1")).await.unwrap();
        lock.lock(Some("req-1")).await.unwrap();
        assert_eq!(lock.stack_depth(), 3);

        assert_eq!(
            lock.lock(Some("req-1")).await,
            Err(ActorError::MaxStackDepthExceeded)
        );
        assert_eq!(lock.stack_depth(), 3);

        lock.unlock();
        lock.unlock();
        lock.unlock();
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn test_other_request_waits_for_release() {
        let lock = Arc::new(ActorLock::new(8));
        lock.lock(Some("req-1")).await.unwrap();

        let l = lock.clone();
        let mut waiter = tokio::spawn(async move {
            l.lock(Some("req-2")).await.unwrap();
            l.unlock();
        });
        assert!(tokio::time::timeout(Duration::from_millis(50), &mut waiter)
            .await
            .is_err());

        lock.unlock();
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_none_request_is_not_reentrant() {
        let lock = Arc::new(ActorLock::new(8));
        lock.lock(None).await.unwrap();

        let l = lock.clone();
        let second = tokio::spawn(async move { l.lock(None).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!second.is_finished());

        lock.unlock();
        second.await.unwrap().unwrap();
        assert_eq!(lock.stack_depth(), 1);
        lock.unlock();
    }

    #[test]
    fn test_unbalanced_unlock_is_ignored() {
        let lock = ActorLock::new(1);
        lock.unlock();
        assert_eq!(lock.stack_depth(), 0);
    }
}
