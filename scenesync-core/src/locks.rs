//! Lock/Ownership Manager: advisory "who is editing what".
//!
//! Locks are a UX hint only. A denied acquire means "show locked by X",
//! never "refuse the edit"; the conflict resolver still decides every
//! outcome, so stale locks (expired, holder gone) are harmless.
//!
//! A lock on an entity also covers its descendants for display purposes,
//! see [`LockManager::effective_owner`].
//!
//! Each session-scoped instance owns its table. There is no global lock
//! state, so several editing sessions in one process stay independent.

use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};

use crate::entity::{EntityId, SessionId};
use crate::tree::SceneTree;

/// Default inactivity timeout.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lock {
    pub owner: SessionId,
    pub expires_at: Instant,
}

#[derive(Debug)]
pub struct LockManager {
    locks: FxHashMap<EntityId, Lock>,
    timeout: Duration,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl LockManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: FxHashMap::default(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Try to take (or refresh) the lock on `entity`.
    pub fn acquire(&mut self, entity: EntityId, session: SessionId) -> bool {
        self.acquire_at(entity, session, Instant::now())
    }

    pub fn acquire_at(&mut self, entity: EntityId, session: SessionId, now: Instant) -> bool {
        if let Some(lock) = self.locks.get(&entity) {
            if lock.owner != session && lock.expires_at > now {
                return false;
            }
        }
        self.locks.insert(
            entity,
            Lock {
                owner: session,
                expires_at: now + self.timeout,
            },
        );
        true
    }

    /// Release `entity` if `session` holds it. Returns whether it did.
    pub fn release(&mut self, entity: EntityId, session: SessionId) -> bool {
        match self.locks.get(&entity) {
            Some(lock) if lock.owner == session => {
                self.locks.remove(&entity);
                true
            }
            _ => false,
        }
    }

    /// Current owner of `entity`, ignoring expired locks.
    pub fn owner(&self, entity: EntityId) -> Option<SessionId> {
        self.owner_at(entity, Instant::now())
    }

    pub fn owner_at(&self, entity: EntityId, now: Instant) -> Option<SessionId> {
        self.locks
            .get(&entity)
            .filter(|lock| lock.expires_at > now)
            .map(|lock| lock.owner)
    }

    /// Every live lock, sorted by entity.
    pub fn held(&self) -> Vec<(EntityId, SessionId)> {
        let now = Instant::now();
        let mut held: Vec<(EntityId, SessionId)> = self
            .locks
            .iter()
            .filter(|(_, lock)| lock.expires_at > now)
            .map(|(id, lock)| (*id, lock.owner))
            .collect();
        held.sort();
        held
    }

    /// Owner of `entity` or of its nearest locked ancestor, with the
    /// entity that actually carries the lock.
    pub fn effective_owner(&self, entity: EntityId, tree: &SceneTree) -> Option<(EntityId, SessionId)> {
        let now = Instant::now();
        std::iter::once(entity)
            .chain(tree.ancestors(&entity))
            .find_map(|id| self.owner_at(id, now).map(|owner| (id, owner)))
    }

    /// Push the expiry of a held lock forward. Called on each edit.
    pub fn touch(&mut self, entity: EntityId, session: SessionId) -> bool {
        self.touch_at(entity, session, Instant::now())
    }

    pub fn touch_at(&mut self, entity: EntityId, session: SessionId, now: Instant) -> bool {
        match self.locks.get_mut(&entity) {
            Some(lock) if lock.owner == session => {
                lock.expires_at = now + self.timeout;
                true
            }
            _ => false,
        }
    }

    /// Record an ownership change reported by the server.
    pub fn record(&mut self, entity: EntityId, owner: Option<SessionId>) {
        match owner {
            Some(owner) => {
                self.locks.insert(
                    entity,
                    Lock {
                        owner,
                        expires_at: Instant::now() + self.timeout,
                    },
                );
            }
            None => {
                self.locks.remove(&entity);
            }
        }
    }

    /// Drop every lock held by `session`. Returns the released entities, sorted.
    pub fn release_session(&mut self, session: SessionId) -> Vec<EntityId> {
        let mut released: Vec<EntityId> = self
            .locks
            .iter()
            .filter(|(_, lock)| lock.owner == session)
            .map(|(id, _)| *id)
            .collect();
        released.sort();
        for id in &released {
            self.locks.remove(id);
        }
        released
    }

    /// Remove locks whose holder has been inactive too long.
    pub fn expire(&mut self) -> Vec<(EntityId, SessionId)> {
        self.expire_at(Instant::now())
    }

    pub fn expire_at(&mut self, now: Instant) -> Vec<(EntityId, SessionId)> {
        let mut expired: Vec<(EntityId, SessionId)> = self
            .locks
            .iter()
            .filter(|(_, lock)| lock.expires_at <= now)
            .map(|(id, lock)| (*id, lock.owner))
            .collect();
        expired.sort();
        for (id, _) in &expired {
            self.locks.remove(id);
        }
        if !expired.is_empty() {
            log::debug!("expired {} locks", expired.len());
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{OpId, OpKind, Operation};

    const A: SessionId = SessionId::from_u128(0xA);
    const B: SessionId = SessionId::from_u128(0xB);

    fn e(n: u128) -> EntityId {
        EntityId::from_u128(n)
    }

    #[test]
    fn test_acquire_is_exclusive_until_release() {
        let mut locks = LockManager::default();
        assert!(locks.acquire(e(1), A));
        assert!(locks.acquire(e(1), A), "re-acquire by the holder refreshes");
        assert!(!locks.acquire(e(1), B));
        assert_eq!(locks.owner(e(1)), Some(A));

        assert!(!locks.release(e(1), B));
        assert!(locks.release(e(1), A));
        assert_eq!(locks.owner(e(1)), None);
        assert!(locks.acquire(e(1), B));
    }

    #[test]
    fn test_expired_lock_can_be_taken() {
        let mut locks = LockManager::new(Duration::from_secs(10));
        let t0 = Instant::now();
        assert!(locks.acquire_at(e(1), A, t0));
        assert!(!locks.acquire_at(e(1), B, t0 + Duration::from_secs(5)));
        assert!(locks.acquire_at(e(1), B, t0 + Duration::from_secs(11)));
        assert_eq!(locks.owner_at(e(1), t0 + Duration::from_secs(12)), Some(B));
    }

    #[test]
    fn test_touch_extends_expiry() {
        let mut locks = LockManager::new(Duration::from_secs(10));
        let t0 = Instant::now();
        locks.acquire_at(e(1), A, t0);
        assert!(locks.touch_at(e(1), A, t0 + Duration::from_secs(8)));
        assert!(!locks.touch_at(e(1), B, t0 + Duration::from_secs(8)));
        assert!(locks.expire_at(t0 + Duration::from_secs(12)).is_empty());
        assert_eq!(locks.expire_at(t0 + Duration::from_secs(19)), vec![(e(1), A)]);
        assert!(locks.is_empty());
    }

    #[test]
    fn test_release_session() {
        let mut locks = LockManager::default();
        locks.acquire(e(3), A);
        locks.acquire(e(1), A);
        locks.acquire(e(2), B);
        assert_eq!(locks.held(), vec![(e(1), A), (e(2), B), (e(3), A)]);
        assert_eq!(locks.release_session(A), vec![e(1), e(3)]);
        assert_eq!(locks.len(), 1);
        assert_eq!(locks.owner(e(2)), Some(B));
    }

    #[test]
    fn test_ancestor_lock_covers_descendants() {
        let mut tree = SceneTree::new();
        let id = |clock| OpId { session: A, clock };
        tree.apply(&Operation::new(id(1), e(1), 0, OpKind::create_root())).unwrap();
        tree.apply(&Operation::new(id(2), e(2), 0, OpKind::create_under(e(1)))).unwrap();
        tree.apply(&Operation::new(id(3), e(3), 0, OpKind::create_under(e(2)))).unwrap();

        let mut locks = LockManager::default();
        assert_eq!(locks.effective_owner(e(3), &tree), None);
        locks.acquire(e(1), B);
        assert_eq!(locks.effective_owner(e(3), &tree), Some((e(1), B)));
        locks.acquire(e(3), A);
        assert_eq!(locks.effective_owner(e(3), &tree), Some((e(3), A)));
    }

    #[test]
    fn test_record_server_changes() {
        let mut locks = LockManager::default();
        locks.record(e(1), Some(B));
        assert_eq!(locks.owner(e(1)), Some(B));
        locks.record(e(1), None);
        assert_eq!(locks.owner(e(1)), None);
    }
}
