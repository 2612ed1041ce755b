//! Per-client serialization.
//!
//! Every credit-affecting sequence for a client runs while holding that
//! client's [`ClientGuard`]. Different clients never contend. A client whose
//! accounting produced an invariant violation is halted here and every later
//! entry fails with [`Error::ClientHalted`] until an operator resumes it.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

/// Exclusive hold on one client's accounting.
#[derive(Debug)]
pub struct ClientGuard {
    _guard: OwnedMutexGuard<()>,
}

/// Per-client async locks plus the halted set.
#[derive(Debug)]
pub struct ClientGate<C> {
    locks: Mutex<HashMap<C, Arc<tokio::sync::Mutex<()>>>>,
    halted: Mutex<HashMap<C, String>>,
}

impl<C> Default for ClientGate<C> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            halted: Mutex::new(HashMap::new()),
        }
    }
}

impl<C> ClientGate<C>
where
    C: Clone + Eq + Hash + Display,
{
    /// Create a gate with no clients.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `client`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientHalted`] if the client is halted, either before
    /// waiting or once the lock is acquired.
    pub async fn enter(&self, client: &C) -> Result<ClientGuard> {
        self.check_halted(client)?;
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(client.clone()).or_default())
        };
        let guard = lock.lock_owned().await;
        self.check_halted(client)?;
        Ok(ClientGuard { _guard: guard })
    }

    /// Halt `client` with the given reason.
    pub fn halt(&self, client: &C, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("Halting client {client}: {reason}");
        self.halted.lock().insert(client.clone(), reason);
    }

    /// Lift a halt. Returns true if the client was halted.
    pub fn resume(&self, client: &C) -> bool {
        let was_halted = self.halted.lock().remove(client).is_some();
        if was_halted {
            info!("Resumed client {client}");
        }
        was_halted
    }

    /// Returns true if the client is halted.
    #[must_use]
    pub fn is_halted(&self, client: &C) -> bool {
        self.halted.lock().contains_key(client)
    }

    /// Reason recorded for a halt.
    #[must_use]
    pub fn halt_reason(&self, client: &C) -> Option<String> {
        self.halted.lock().get(client).cloned()
    }

    /// Drop locks nobody holds or waits on. Returns how many were dropped.
    pub fn prune(&self) -> usize {
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    /// Number of clients with a lock entry.
    #[must_use]
    pub fn tracked_clients(&self) -> usize {
        self.locks.lock().len()
    }

    fn check_halted(&self, client: &C) -> Result<()> {
        match self.halted.lock().get(client) {
            Some(reason) => Err(Error::ClientHalted(format!("{client}: {reason}"))),
            None => Ok(()),
        }
    }
}
