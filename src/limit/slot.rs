use super::{LimitError, Store};
use crate::{
    internal_events::{SlotReleaseFailed, SlotReleased},
    store::LockStore,
};
use snafu::ResultExt;
use std::{future::Future, sync::Arc};
use tokio::{runtime::Handle, time::Instant};

/// A held execution slot.
///
/// Release it with [`Slot::release`]. A slot that is simply dropped releases
/// itself in the background on the current Tokio runtime.
#[derive(Debug)]
pub struct Slot<S: LockStore + 'static> {
    store: Arc<S>,
    key: String,
    id: String,
    count: usize,
    acquired_at: Instant,
    released: bool,
}

impl<S: LockStore + 'static> Slot<S> {
    fn new(store: Arc<S>, key: String, id: String, count: usize) -> Self {
        Self {
            store,
            key,
            id,
            count,
            acquired_at: Instant::now(),
            released: false,
        }
    }

    /// Number of holders right after this one registered, itself included.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Holder id stored in the hash.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) -> Result<(), LimitError> {
        self.released = true;
        unregister(&*self.store, &self.key, &self.id, self.acquired_at)
            .await
            .context(Store)
    }
}

/// A holder id that may already be written to the store but is not handed
/// out as a [`Slot`] yet.
///
/// Dropping it, which happens when the acquiring future is cancelled,
/// removes the holder in the background.
#[derive(Debug)]
pub(super) struct PendingHolder<S: LockStore + 'static> {
    store: Arc<S>,
    key: String,
    id: String,
    armed: bool,
}

impl<S: LockStore + 'static> PendingHolder<S> {
    pub(super) fn new(store: Arc<S>, key: String, id: String) -> Self {
        Self {
            store,
            key,
            id,
            armed: true,
        }
    }

    pub(super) fn id(&self) -> &str {
        &self.id
    }

    pub(super) fn into_slot(mut self, count: usize) -> Slot<S> {
        self.armed = false;
        Slot::new(
            Arc::clone(&self.store),
            std::mem::take(&mut self.key),
            std::mem::take(&mut self.id),
            count,
        )
    }

    /// Removes the holder. Failures are reported through `SlotReleaseFailed`.
    pub(super) async fn discard(mut self) {
        if let Err(error) = self.store.unregister(&self.key, &self.id).await {
            emit!(SlotReleaseFailed {
                key: &self.key,
                id: &self.id,
                error: &error,
            });
        }
        // Disarmed last: a cancelled discard still cleans up on drop.
        self.armed = false;
    }
}

impl<S: LockStore + 'static> Drop for PendingHolder<S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let id = std::mem::take(&mut self.id);
        spawn_or_warn(key, id, move |key, id| async move {
            if let Err(error) = store.unregister(&key, &id).await {
                emit!(SlotReleaseFailed {
                    key: &key,
                    id: &id,
                    error: &error,
                });
            }
        });
    }
}

async fn unregister<S>(
    store: &S,
    key: &str,
    id: &str,
    acquired_at: Instant,
) -> Result<(), crate::store::StoreError>
where
    S: LockStore + ?Sized,
{
    match store.unregister(key, id).await {
        Ok(_) => {
            emit!(SlotReleased {
                key,
                id,
                held: acquired_at.elapsed(),
            });
            Ok(())
        }
        Err(error) => {
            emit!(SlotReleaseFailed {
                key,
                id,
                error: &error,
            });
            Err(error)
        }
    }
}

/// Runs the removal of a holder on the current Tokio runtime, or warns when
/// there is none.
fn spawn_or_warn<F, Fut>(key: String, id: String, f: F)
where
    F: FnOnce(String, String) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(f(key, id));
        }
        Err(_) => {
            warn!(
                message = "Holder dropped outside of a Tokio runtime; it stays taken until cleaned or expired.",
                key = %key,
                id = %id,
            );
        }
    }
}

impl<S: LockStore + 'static> Drop for Slot<S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let id = std::mem::take(&mut self.id);
        let acquired_at = self.acquired_at;

        spawn_or_warn(key, id, move |key, id| async move {
            let _ = unregister(&*store, &key, &id, acquired_at).await;
        });
    }
}
