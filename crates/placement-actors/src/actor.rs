//! A single activated actor on this host

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::{ActorError, Result};
use crate::lock::ActorLock;

#[derive(Debug)]
pub struct Actor {
    actor_type: String,
    actor_id: String,

    lock: ActorLock,

    /// Callers waiting for or holding the turn
    pending_calls: AtomicI32,
    last_used_time: Mutex<Instant>,

    disposed: RwLock<bool>,
    /// Set by `drain`; only then does the last `unlock` dispose the actor
    drain_requested: AtomicBool,
    /// Cancelled once, when the actor is disposed
    dispose_token: CancellationToken,
}

/// Counts one caller in `pending_calls` until disarmed; a dropped `lock`
/// future gives its slot back.
struct PendingCall<'a> {
    pending: &'a AtomicI32,
    armed: bool,
}

impl<'a> PendingCall<'a> {
    fn enter(pending: &'a AtomicI32) -> Self {
        pending.fetch_add(1, Ordering::SeqCst);
        Self { pending, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Actor {
    pub fn new(actor_type: impl Into<String>, actor_id: impl Into<String>, max_stack_depth: u32) -> Self {
        Self {
            actor_type: actor_type.into(),
            actor_id: actor_id.into(),
            lock: ActorLock::new(max_stack_depth),
            pending_calls: AtomicI32::new(0),
            last_used_time: Mutex::new(Instant::now()),
            disposed: RwLock::new(false),
            drain_requested: AtomicBool::new(false),
            dispose_token: CancellationToken::new(),
        }
    }

    pub fn actor_type(&self) -> &str {
        &self.actor_type
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    pub fn pending_calls(&self) -> i32 {
        self.pending_calls.load(Ordering::SeqCst)
    }

    pub fn last_used_time(&self) -> Instant {
        *self.last_used_time.lock()
    }

    pub fn is_disposed(&self) -> bool {
        *self.disposed.read()
    }

    pub fn is_busy(&self) -> bool {
        !self.is_disposed() && self.pending_calls() > 0
    }

    /// Listener cancelled once the actor is disposed. Subscribing has no
    /// effect on the actor itself.
    pub fn dispose_token(&self) -> CancellationToken {
        self.dispose_token.clone()
    }

    /// Take a turn. Fails with [`ActorError::ActorDisposed`] once the actor
    /// has been drained.
    pub async fn lock(&self, request_id: Option<&str>) -> Result<()> {
        let pending = PendingCall::enter(&self.pending_calls);
        self.lock.lock(request_id).await?;
        pending.disarm();

        if self.is_disposed() {
            self.unlock();
            return Err(ActorError::ActorDisposed);
        }

        let mut last = self.last_used_time.lock();
        let now = Instant::now();
        *last = if now > *last { now } else { *last + Duration::from_nanos(1) };
        Ok(())
    }

    pub fn unlock(&self) {
        let pending = self.pending_calls.fetch_sub(1, Ordering::SeqCst) - 1;
        if pending < 0 {
            log::error!(
                "BUGBUG: tried to unlock actor {}||{} before locking it",
                self.actor_type,
                self.actor_id
            );
            debug_assert!(pending >= 0, "actor unlocked more times than locked");
            return;
        }
        if pending == 0 && self.drain_requested.load(Ordering::SeqCst) {
            self.dispose();
        }
        self.lock.unlock();
    }

    /// Wait for in-flight calls to finish, then dispose. Returns false if
    /// `timeout` elapsed first; the actor is disposed either way.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.drain_requested.store(true, Ordering::SeqCst);

        let quiesced = tokio::time::timeout(timeout, async {
            // Idle is only observed while holding the turn
            if self.lock.lock(None).await.is_ok() {
                if self.pending_calls() == 0 {
                    self.dispose();
                }
                self.lock.unlock();
            }
            self.dispose_token.cancelled().await;
        })
        .await
        .is_ok();

        if !quiesced {
            log::warn!(
                "Actor {}||{} still busy after {:?}, disposing",
                self.actor_type,
                self.actor_id,
                timeout
            );
            self.dispose();
        }
        quiesced
    }

    fn dispose(&self) {
        let mut disposed = self.disposed.write();
        if !*disposed {
            *disposed = true;
            self.dispose_token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::lock::DEFAULT_MAX_STACK_DEPTH;

    fn actor() -> Arc<Actor> {
        Arc::new(Actor::new("Dog", "rex", DEFAULT_MAX_STACK_DEPTH))
    }

    #[tokio::test]
    async fn test_parallel_turns_are_serialized() {
        let actor = actor();
        let acquisitions = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let actor = actor.clone();
            let acquisitions = acquisitions.clone();
            handles.push(tokio::spawn(async move {
                actor.lock(None).await.unwrap();
                let pending = actor.pending_calls();
                assert!(pending >= 1 && pending <= 10);
                assert!(actor.is_busy());
                acquisitions.lock().push(actor.last_used_time());
                tokio::time::sleep(Duration::from_millis(2)).await;
                actor.unlock();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(actor.pending_calls(), 0);
        assert!(!actor.is_busy());
        let times = acquisitions.lock();
        assert_eq!(times.len(), 10);
        assert!(times.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_drain_idle_actor_disposes_immediately() {
        let actor = actor();
        assert!(actor.drain(Duration::from_millis(100)).await);
        assert!(actor.is_disposed());
        assert!(actor.dispose_token().is_cancelled());

        assert_eq!(actor.lock(None).await, Err(ActorError::ActorDisposed));
        assert_eq!(actor.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_drain_waits_for_last_unlock() {
        let actor = actor();
        actor.lock(Some("req-1")).await.unwrap();

        let a = actor.clone();
        let drain = tokio::spawn(async move { a.drain(Duration::from_secs(2)).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!drain.is_finished());
        assert!(!actor.is_disposed());

        actor.unlock();
        assert!(drain.await.unwrap());
        assert!(actor.is_disposed());
        assert!(!actor.is_busy());
    }

    #[tokio::test]
    async fn test_drain_timeout_still_disposes() {
        let actor = actor();
        actor.lock(None).await.unwrap();

        assert!(!actor.drain(Duration::from_millis(30)).await);
        assert!(actor.is_disposed());

        // Unlocking after a forced dispose is still balanced
        actor.unlock();
        assert_eq!(actor.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_listener_does_not_dispose() {
        let actor = actor();
        actor.lock(None).await.unwrap();
        let first = actor.dispose_token();
        let second = actor.dispose_token();
        actor.unlock();

        assert!(!actor.is_disposed());
        assert!(!first.is_cancelled());
        actor.lock(None).await.unwrap();
        actor.unlock();

        assert!(actor.drain(Duration::from_millis(100)).await);
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_lock_releases_pending_slot() {
        let actor = actor();
        actor.lock(Some("a")).await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_millis(20), actor.lock(Some("b"))).await;
        assert!(waiting.is_err());
        assert_eq!(actor.pending_calls(), 1);

        actor.unlock();
        assert_eq!(actor.pending_calls(), 0);
        assert!(!actor.is_busy());
        assert!(actor.drain(Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn test_calls_queued_before_drain_finish_first() {
        let actor = actor();
        actor.lock(Some("a")).await.unwrap();

        let a = actor.clone();
        let drain = tokio::spawn(async move { a.drain(Duration::from_secs(2)).await });
        let b = actor.clone();
        let queued = tokio::spawn(async move {
            b.lock(Some("b")).await?;
            let disposed = b.is_disposed();
            b.unlock();
            Ok::<bool, ActorError>(disposed)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        actor.unlock();
        assert_eq!(queued.await.unwrap(), Ok(false));
        assert!(drain.await.unwrap());
        assert_eq!(actor.lock(None).await, Err(ActorError::ActorDisposed));
        assert_eq!(actor.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_no_turn_runs_after_dispose() {
        let actor = actor();
        let mut handles = Vec::new();
        for i in 0..20 {
            let actor = actor.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("req-{}", i);
                if actor.lock(Some(&id)).await.is_ok() {
                    assert!(!actor.is_disposed());
                    tokio::task::yield_now().await;
                    assert!(!actor.is_disposed());
                    actor.unlock();
                }
            }));
        }
        assert!(actor.drain(Duration::from_secs(2)).await);
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(actor.is_disposed());
        assert_eq!(actor.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_depth_error_leaves_pending_unchanged() {
        let actor = Arc::new(Actor::new("Dog", "rex", 1));
        actor.lock(Some("req-1")).await.unwrap();
        assert_eq!(
            actor.lock(Some("req-1")).await,
            Err(ActorError::MaxStackDepthExceeded)
        );
        assert_eq!(actor.pending_calls(), 1);
        actor.unlock();
        assert_eq!(actor.pending_calls(), 0);
    }
}
