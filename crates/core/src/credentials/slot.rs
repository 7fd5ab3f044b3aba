// Copyright © 2026 Kirky.X
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use super::{CredentialError, CredentialResult};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// A value tagged with the reload generation that produced it.
#[derive(Debug)]
pub struct Versioned<T> {
    generation: u64,
    value: T,
}

impl<T> Versioned<T> {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl<T> Deref for Versioned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

/// Single-writer, many-reader holder of hot-reloadable material.
///
/// Installing and announcing are separate steps so that a composite owner can
/// publish its own derived state before waiters are released.
pub(crate) struct MaterialSlot<T> {
    current: ArcSwap<Versioned<T>>,
    install_lock: Mutex<()>,
    reloaded: watch::Sender<u64>,
}

impl<T> MaterialSlot<T> {
    pub(crate) fn new(initial: T) -> Self {
        let (reloaded, _) = watch::channel(0);
        Self {
            current: ArcSwap::from_pointee(Versioned {
                generation: 0,
                value: initial,
            }),
            install_lock: Mutex::new(()),
            reloaded,
        }
    }

    pub(crate) fn load(&self) -> Arc<Versioned<T>> {
        self.current.load_full()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.current.load().generation
    }

    pub(crate) fn install(&self, value: T) -> Arc<Versioned<T>> {
        let _guard = self.install_lock.lock();
        let next = Arc::new(Versioned {
            generation: self.current.load().generation + 1,
            value,
        });
        self.current.store(next.clone());
        next
    }

    pub(crate) fn announce(&self, generation: u64) {
        self.reloaded.send_replace(generation);
    }

    /// Resolves with the new generation once the next reload is announced.
    pub(crate) async fn wait_for_reload(
        &self,
        cancel: &CancellationToken,
    ) -> CredentialResult<u64> {
        let mut reloaded = self.reloaded.subscribe();
        tokio::select! {
            changed = reloaded.changed() => {
                changed.map_err(|_| CredentialError::Cancelled)?;
                let generation = *reloaded.borrow();
                Ok(generation)
            }
            _ = cancel.cancelled() => Err(CredentialError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_install_increments_generation() {
        let slot = MaterialSlot::new("initial");
        assert_eq!(slot.generation(), 0);

        let next = slot.install("next");
        assert_eq!(next.generation(), 1);
        assert_eq!(**slot.load(), "next");
        assert_eq!(slot.generation(), 1);
    }

    #[tokio::test]
    async fn test_announce_releases_all_waiters() {
        let slot = Arc::new(MaterialSlot::new(0u32));
        let cancel = CancellationToken::new();

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let slot = slot.clone();
            let cancel = cancel.clone();
            waiters.push(tokio::spawn(async move { slot.wait_for_reload(&cancel).await }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let installed = slot.install(7);
        slot.announce(installed.generation());

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Ok(1));
        }
    }

    #[tokio::test]
    async fn test_wait_returns_on_cancel() {
        let slot = MaterialSlot::new(());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), slot.wait_for_reload(&cancel))
            .await
            .unwrap();
        assert_eq!(result, Err(CredentialError::Cancelled));
    }
}
