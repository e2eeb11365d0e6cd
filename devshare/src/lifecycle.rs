//! Process-wide accelerator resources shared by every solver instance.

use crate::error::{Error, Result};
use devshare_accel::{check, Accelerator, HandleKind, HostAccelerator, OwnedHandle, RawHandle};
use devshare_core::{Communicator, DeviceInventory, FixedInventory};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

struct SharedResources {
    resources: OwnedHandle,
    config: OwnedHandle,
}

#[derive(Default)]
struct ManagerState {
    count: usize,
    shared: Option<SharedResources>,
}

/// Reference-counted owner of the accelerator library and its resource
/// context.
///
/// Each solver instance acquires once at initialize and releases once at
/// finalize. The library is brought up with the first GPU-capable acquire
/// and torn down when the last instance releases.
pub struct ResourceManager {
    accel: Arc<dyn Accelerator>,
    state: Mutex<ManagerState>,
}

impl fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state.try_lock() {
            Ok(state) => f
                .debug_struct("ResourceManager")
                .field("count", &state.count)
                .field("active", &state.shared.is_some())
                .finish(),
            Err(_) => f.debug_struct("ResourceManager").finish_non_exhaustive(),
        }
    }
}

impl ResourceManager {
    pub fn new(accel: Arc<dyn Accelerator>) -> Self {
        Self {
            accel,
            state: Mutex::new(ManagerState::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ManagerState>> {
        self.state
            .lock()
            .map_err(|_| Error::Lifecycle("resource manager lock poisoned".to_string()))
    }

    /// Number of live instances.
    pub fn count(&self) -> Result<usize> {
        Ok(self.lock()?.count)
    }

    /// Whether the shared resource context currently exists.
    pub fn is_active(&self) -> Result<bool> {
        Ok(self.lock()?.shared.is_some())
    }

    /// Registers one instance. GPU-capable processes pass their gpu
    /// communicator and device and get the shared resource handle back.
    pub fn acquire(
        &self,
        config_path: &Path,
        gpu: Option<(&dyn Communicator, usize)>,
    ) -> Result<Option<RawHandle>> {
        let mut state = self.lock()?;
        let existing = state.shared.as_ref().map(|shared| shared.resources.raw());
        let resources = match (gpu, existing) {
            (None, _) => None,
            (Some(_), Some(raw)) => Some(raw),
            (Some((comm, device)), None) => {
                let shared = self.create_shared(config_path, comm, device)?;
                let raw = shared.resources.raw();
                state.shared = Some(shared);
                Some(raw)
            }
        };
        state.count += 1;
        log::debug!("Resource count -> {}", state.count);
        Ok(resources)
    }

    fn create_shared(
        &self,
        config_path: &Path,
        comm: &dyn Communicator,
        device: usize,
    ) -> Result<SharedResources> {
        // The only collective step; every owner reaches it before any local
        // step can fail.
        let comm = comm.duplicate()?;
        check(self.accel.initialize(), "initialize")?;
        let created = (|| -> Result<SharedResources> {
            let config = OwnedHandle::new(
                self.accel.clone(),
                HandleKind::Config,
                check(self.accel.create_config(config_path), "config_create")?,
            );
            let resources = OwnedHandle::new(
                self.accel.clone(),
                HandleKind::Resources,
                check(
                    self.accel
                        .create_resources(config.raw(), comm, device),
                    "resources_create",
                )?,
            );
            Ok(SharedResources { resources, config })
        })();
        match created {
            Ok(shared) => {
                log::info!("Shared accelerator resources created on device {}", device);
                Ok(shared)
            }
            Err(err) => {
                // Handles created so far are gone by now; undo the library init.
                if let Err(status) = self.accel.finalize() {
                    log::warn!("Rolling back accelerator initialization failed: {}", status);
                }
                Err(err)
            }
        }
    }

    /// Unregisters one instance, tearing the shared context down with the
    /// last one.
    pub fn release(&self) -> Result<()> {
        let mut state = self.lock()?;
        if state.count == 0 {
            return Err(Error::Lifecycle(
                "release called without a matching acquire".to_string(),
            ));
        }
        state.count -= 1;
        log::debug!("Resource count -> {}", state.count);
        if state.count > 0 {
            return Ok(());
        }
        let Some(shared) = state.shared.take() else {
            return Ok(());
        };
        let resources = shared.resources.release();
        let config = shared.config.release();
        let library = check(self.accel.finalize(), "finalize");
        resources?;
        config?;
        library?;
        log::info!("Shared accelerator resources destroyed");
        Ok(())
    }
}

/// Everything one process shares between its solver instances: the
/// accelerator library, its resource manager and the device inventory.
#[derive(Debug, Clone)]
pub struct Runtime {
    accel: Arc<dyn Accelerator>,
    resources: Arc<ResourceManager>,
    inventory: Arc<dyn DeviceInventory>,
}

impl Runtime {
    pub fn new(accel: Arc<dyn Accelerator>, inventory: Arc<dyn DeviceInventory>) -> Self {
        let resources = Arc::new(ResourceManager::new(accel.clone()));
        Self {
            accel,
            resources,
            inventory,
        }
    }

    /// Host accelerator with `devices` simulated devices per node.
    pub fn host(devices: usize) -> Self {
        Self::new(
            Arc::new(HostAccelerator::new()),
            Arc::new(FixedInventory::new(devices)),
        )
    }

    pub fn accelerator(&self) -> &Arc<dyn Accelerator> {
        &self.accel
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn inventory(&self) -> &dyn DeviceInventory {
        self.inventory.as_ref()
    }
}
