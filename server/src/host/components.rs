//! Reload components owned by the host

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::errors::HostError;
use crate::handler::RequestHandler;
use crate::reload::Component;
use crate::srvman::{Color, Group};

/// What requests are served with: handler, service group and color, always replaced together
pub struct ActiveState {
    pub handler: Arc<dyn RequestHandler>,
    pub group: Option<Arc<Group>>,
    pub color: Option<Color>,
}

/// The request router as a reload component.
///
/// Locking takes the write side of the active state lock, which waits for in-flight
/// requests to finish. While locked, [`ServingComponent::replace`] swaps the whole triple.
pub struct ServingComponent {
    active: Arc<RwLock<ActiveState>>,
    guard: Mutex<Option<OwnedRwLockWriteGuard<ActiveState>>>,
}

impl ServingComponent {
    pub fn new(active: Arc<RwLock<ActiveState>>) -> Self {
        Self {
            active,
            guard: Mutex::new(None),
        }
    }

    fn slot(&self) -> Result<std::sync::MutexGuard<'_, Option<OwnedRwLockWriteGuard<ActiveState>>>, HostError> {
        self.guard
            .lock()
            .map_err(|_| HostError::Internal("serving lock slot poisoned".to_string()))
    }

    pub fn is_locked(&self) -> bool {
        self.slot().map(|slot| slot.is_some()).unwrap_or(false)
    }

    /// Replace the active state, returning the one it superseded. Only valid while locked.
    pub fn replace(&self, next: ActiveState) -> Result<ActiveState, HostError> {
        let mut slot = self.slot()?;
        let guard = slot
            .as_mut()
            .ok_or_else(|| HostError::LockFailure("serving state is not locked".to_string()))?;
        Ok(std::mem::replace(&mut **guard, next))
    }
}

#[async_trait]
impl Component for ServingComponent {
    async fn lock_for_reload(&self) -> Result<(), HostError> {
        if self.is_locked() {
            return Err(HostError::LockFailure("serving state already locked".to_string()));
        }

        let guard = self.active.clone().write_owned().await;
        *self.slot()? = Some(guard);
        Ok(())
    }

    async fn unlock_and_reload(&self) -> Result<(), HostError> {
        let guard = self.slot()?.take();
        drop(guard);
        Ok(())
    }

    fn name(&self) -> &str {
        "serving"
    }
}

/// The process supervisor as a reload component.
///
/// Groups retired during a reload are stopped in the background once it unlocks.
#[derive(Default)]
pub struct DrainComponent {
    reloading: AtomicBool,
    retired: Mutex<Vec<Arc<Group>>>,
    draining: Mutex<Vec<JoinHandle<()>>>,
}

impl DrainComponent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a superseded group to be stopped. Only valid while locked.
    pub fn retire(&self, group: Arc<Group>) -> Result<(), HostError> {
        if !self.reloading.load(Ordering::SeqCst) {
            return Err(HostError::LockFailure("no reload in progress".to_string()));
        }
        self.retired
            .lock()
            .map_err(|_| HostError::Internal("retired groups poisoned".to_string()))?
            .push(group);
        Ok(())
    }

    /// Wait for every background stop started so far
    pub async fn wait_for_drains(&self) {
        let handles: Vec<JoinHandle<()>> = match self.draining.lock() {
            Ok(mut draining) => draining.drain(..).collect(),
            Err(_) => return,
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Drain task failed: {}", e);
            }
        }
    }
}

#[async_trait]
impl Component for DrainComponent {
    async fn lock_for_reload(&self) -> Result<(), HostError> {
        if self.reloading.swap(true, Ordering::SeqCst) {
            return Err(HostError::LockFailure("reload already in progress".to_string()));
        }
        Ok(())
    }

    async fn unlock_and_reload(&self) -> Result<(), HostError> {
        let retired: Vec<Arc<Group>> = self
            .retired
            .lock()
            .map_err(|_| HostError::Internal("retired groups poisoned".to_string()))?
            .drain(..)
            .collect();

        let mut handles = Vec::with_capacity(retired.len());
        for group in retired {
            handles.push(tokio::spawn(async move {
                let color = group.color();
                match group.stop().await {
                    Ok(()) => info!("Superseded service group {:?} stopped", color),
                    Err(e) => error!("Failed to stop superseded service group {:?}: {}", color, e),
                }
            }));
        }

        if let Ok(mut draining) = self.draining.lock() {
            draining.retain(|handle| !handle.is_finished());
            draining.extend(handles);
        }

        self.reloading.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "drain"
    }
}
