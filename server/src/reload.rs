//! Two-phase reload coordination
//!
//! Every [`Component`] registered with a [`System`] is locked in registration order, the
//! mutation runs, then the locked components are unlocked in reverse order.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, warn};

use crate::errors::HostError;

/// A part of the server that must be quiesced while live state is replaced
#[async_trait]
pub trait Component: Send + Sync {
    /// Lock the component so its dependencies can be mutated safely
    async fn lock_for_reload(&self) -> Result<(), HostError>;

    /// Unlock the component and pick up the new dependencies.
    ///
    /// May be called again for a component whose unlock was interrupted.
    async fn unlock_and_reload(&self) -> Result<(), HostError>;

    /// Name used in logs
    fn name(&self) -> &str {
        "component"
    }
}

type Components = Vec<Arc<dyn Component>>;

/// Ordered registry of components reloaded together
#[derive(Default)]
pub struct System {
    components: Arc<Mutex<Components>>,
}

/// Components locked by one reload, unlocked in reverse order.
///
/// Dropped with components still locked, it unlocks them on a spawned task that keeps the
/// registry mutex, so the next reload waits for it.
struct Locked {
    components: Option<OwnedMutexGuard<Components>>,
    count: usize,
}

impl Locked {
    async fn unlock_all(&mut self) -> Result<(), HostError> {
        let mut result = Ok(());
        while self.count > 0 {
            let component = match &self.components {
                Some(components) => components[self.count - 1].clone(),
                None => break,
            };
            let unlocked = component.unlock_and_reload().await;
            self.count -= 1;
            if let Err(e) = unlocked {
                error!("Failed to unlock {} after reload: {}", component.name(), e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}

impl Drop for Locked {
    fn drop(&mut self) {
        if self.count == 0 {
            return;
        }
        let Some(components) = self.components.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!("Reload abandoned outside a runtime, {} components left locked", self.count);
            return;
        };

        warn!("Reload abandoned, unlocking {} components in the background", self.count);
        let count = self.count;
        runtime.spawn(async move {
            for component in components[..count].iter().rev() {
                if let Err(e) = component.unlock_and_reload().await {
                    error!("Failed to unlock {} after reload: {}", component.name(), e);
                }
            }
        });
    }
}

impl System {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a component. Components are locked in the order they were registered.
    pub async fn register(&self, component: Arc<dyn Component>) {
        self.components.lock().await.push(component);
    }

    pub async fn len(&self) -> usize {
        self.components.lock().await.len()
    }

    /// Lock every component, run `f`, then unlock whatever was locked in reverse order.
    ///
    /// `f` runs only when every lock succeeded. Unlocking always happens, even when this
    /// future is dropped part way, and the first error from locking, `f` or unlocking is
    /// returned. Reloads never overlap.
    pub async fn reload<F, Fut>(&self, f: F) -> Result<(), HostError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<(), HostError>> + Send,
    {
        let components = self.components.clone().lock_owned().await;
        let registered = components.to_vec();
        let mut locked = Locked {
            components: Some(components),
            count: 0,
        };

        let mut result = Ok(());
        for component in registered.iter() {
            if let Err(e) = component.lock_for_reload().await {
                error!("Failed to lock {} for reload: {}", component.name(), e);
                result = Err(e);
                break;
            }
            debug!("Locked {} for reload", component.name());
            locked.count += 1;
        }

        if result.is_ok() {
            result = f().await;
        }

        let unlocked = locked.unlock_all().await;
        result.and(unlocked)
    }
}
