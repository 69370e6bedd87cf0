use parking_lot::{lock_api::RawRwLock, RwLock};

/// Page latch for crabbing. The raw lock is used directly because descent
/// acquires a latch in one scope and the release happens from the
/// transaction's page set much later.
#[derive(Debug, Default)]
pub struct Latch {
    lock: RwLock<()>,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            lock: RwLock::new(()),
        }
    }

    pub fn rlock(&self) {
        unsafe { self.lock.raw() }.lock_shared();
    }

    pub fn runlock(&self) {
        unsafe { self.lock.raw().unlock_shared() };
    }

    pub fn wlock(&self) {
        unsafe { self.lock.raw() }.lock_exclusive();
    }

    pub fn wunlock(&self) {
        unsafe { self.lock.raw().unlock_exclusive() };
    }

    #[cfg(test)]
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}
