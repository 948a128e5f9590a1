//! In-memory device host and layer driver for tests.
//!
//! Both fakes count every call per operation and can be told to fail the
//! n-th call of an operation, which is how rollback and teardown paths are
//! exercised without a hypervisor.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use strata_common::error::{HostError, HostResult};
use strata_common::types::{AttachmentKind, RequestType, ScsiLocation};

use crate::driver::HostLayerDriver;
use crate::hotplug::DeviceHost;
use crate::schema::{ModifyRequest, ShareFlags};

/// Device host operation that can be counted and failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    /// [`DeviceHost::hot_add_share`].
    ShareAdd,
    /// [`DeviceHost::hot_remove_share`].
    ShareRemove,
    /// [`DeviceHost::hot_add_pmem`].
    PmemAdd,
    /// [`DeviceHost::hot_remove_pmem`].
    PmemRemove,
    /// [`DeviceHost::hot_add_scsi`].
    ScsiAdd,
    /// [`DeviceHost::hot_remove_scsi`].
    ScsiRemove,
    /// [`DeviceHost::modify`] with [`RequestType::Add`].
    ModifyAdd,
    /// [`DeviceHost::modify`] with [`RequestType::Remove`].
    ModifyRemove,
}

impl FailurePoint {
    const fn operation(self) -> &'static str {
        match self {
            Self::ShareAdd => "add share",
            Self::ShareRemove => "remove share",
            Self::PmemAdd => "add pmem device",
            Self::PmemRemove => "remove pmem device",
            Self::ScsiAdd => "add scsi disk",
            Self::ScsiRemove => "remove scsi disk",
            Self::ModifyAdd => "add modify request",
            Self::ModifyRemove => "remove modify request",
        }
    }
}

#[derive(Debug)]
struct Faults<K> {
    calls: HashMap<K, usize>,
    fail_at: HashMap<K, HashSet<usize>>,
    always: HashSet<K>,
}

impl<K> Default for Faults<K> {
    fn default() -> Self {
        Self {
            calls: HashMap::new(),
            fail_at: HashMap::new(),
            always: HashSet::new(),
        }
    }
}

impl<K: Copy + Eq + std::hash::Hash> Faults<K> {
    /// Counts a call and reports whether it should fail.
    fn hit(&mut self, key: K) -> Option<usize> {
        let n = self.calls.entry(key).or_insert(0);
        *n += 1;
        let n = *n;
        let fail = self.always.contains(&key) || self.fail_at.get(&key).is_some_and(|s| s.contains(&n));
        fail.then_some(n)
    }

    fn count(&self, key: K) -> usize {
        self.calls.get(&key).copied().unwrap_or(0)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct Devices {
    shares: HashMap<String, PathBuf>,
    pmem: BTreeMap<u32, PathBuf>,
    scsi: BTreeMap<ScsiLocation, PathBuf>,
    composed: Vec<String>,
    requests: Vec<ModifyRequest>,
}

/// Device host that keeps its devices in memory.
#[derive(Debug, Default)]
pub struct FakeDeviceHost {
    faults: Mutex<Faults<FailurePoint>>,
    devices: Mutex<Devices>,
}

impl FakeDeviceHost {
    /// Creates a host with no devices and no injected failures.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the `nth` (1-based) call of `point` fail.
    pub fn fail_on(&self, point: FailurePoint, nth: usize) {
        let _ = lock(&self.faults)
            .fail_at
            .entry(point)
            .or_default()
            .insert(nth);
    }

    /// Makes every call of `point` fail.
    pub fn fail_always(&self, point: FailurePoint) {
        let _ = lock(&self.faults).always.insert(point);
    }

    /// Number of calls made to `point`, failed ones included.
    #[must_use]
    pub fn calls(&self, point: FailurePoint) -> usize {
        lock(&self.faults).count(point)
    }

    /// Number of shares currently added.
    #[must_use]
    pub fn live_shares(&self) -> usize {
        lock(&self.devices).shares.len()
    }

    /// Number of persistent-memory slots currently plugged.
    #[must_use]
    pub fn live_pmem(&self) -> usize {
        lock(&self.devices).pmem.len()
    }

    /// Number of block-storage disks currently attached.
    #[must_use]
    pub fn live_scsi(&self) -> usize {
        lock(&self.devices).scsi.len()
    }

    /// Total number of live devices of every class.
    #[must_use]
    pub fn live_devices(&self) -> usize {
        self.live_shares() + self.live_pmem() + self.live_scsi()
    }

    /// Container roots the guest currently composes.
    #[must_use]
    pub fn composed_roots(&self) -> Vec<String> {
        lock(&self.devices).composed.clone()
    }

    /// Every modify request received, failed ones excluded.
    #[must_use]
    pub fn requests(&self) -> Vec<ModifyRequest> {
        lock(&self.devices).requests.clone()
    }

    fn check(&self, point: FailurePoint) -> HostResult<()> {
        match lock(&self.faults).hit(point) {
            Some(n) => Err(HostError::Rejected {
                operation: point.operation(),
                message: format!("injected failure on call {n}"),
            }),
            None => Ok(()),
        }
    }
}

impl DeviceHost for FakeDeviceHost {
    fn hot_add_share(&self, name: &str, host_path: &Path, _flags: ShareFlags) -> HostResult<()> {
        self.check(FailurePoint::ShareAdd)?;
        let mut devices = lock(&self.devices);
        if devices.shares.contains_key(name) {
            return Err(HostError::Rejected {
                operation: "add share",
                message: format!("share {name} already exists"),
            });
        }
        let _ = devices.shares.insert(name.to_string(), host_path.to_path_buf());
        Ok(())
    }

    fn hot_remove_share(&self, name: &str) -> HostResult<()> {
        self.check(FailurePoint::ShareRemove)?;
        lock(&self.devices)
            .shares
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| HostError::NotAttached {
                kind: AttachmentKind::SharedFolder,
                path: PathBuf::from(name),
            })
    }

    fn hot_add_pmem(&self, slot: u32, host_path: &Path, _read_only: bool) -> HostResult<()> {
        self.check(FailurePoint::PmemAdd)?;
        let mut devices = lock(&self.devices);
        if devices.pmem.contains_key(&slot) {
            return Err(HostError::Rejected {
                operation: "add pmem device",
                message: format!("slot {slot} in use"),
            });
        }
        let _ = devices.pmem.insert(slot, host_path.to_path_buf());
        Ok(())
    }

    fn hot_remove_pmem(&self, slot: u32) -> HostResult<()> {
        self.check(FailurePoint::PmemRemove)?;
        lock(&self.devices)
            .pmem
            .remove(&slot)
            .map(|_| ())
            .ok_or_else(|| HostError::NotAttached {
                kind: AttachmentKind::MemoryMappedDevice,
                path: PathBuf::from(format!("slot {slot}")),
            })
    }

    fn hot_add_scsi(
        &self,
        location: ScsiLocation,
        host_path: &Path,
        _guest_path: &str,
    ) -> HostResult<()> {
        self.check(FailurePoint::ScsiAdd)?;
        let mut devices = lock(&self.devices);
        if devices.scsi.contains_key(&location) {
            return Err(HostError::Rejected {
                operation: "add scsi disk",
                message: format!("location {location} in use"),
            });
        }
        let _ = devices.scsi.insert(location, host_path.to_path_buf());
        Ok(())
    }

    fn hot_remove_scsi(&self, location: ScsiLocation) -> HostResult<()> {
        self.check(FailurePoint::ScsiRemove)?;
        lock(&self.devices)
            .scsi
            .remove(&location)
            .map(|_| ())
            .ok_or_else(|| HostError::NotAttached {
                kind: AttachmentKind::BlockDevice,
                path: PathBuf::from(format!("location {location}")),
            })
    }

    fn modify(&self, request: &ModifyRequest) -> HostResult<()> {
        let point = match request.request_type {
            RequestType::Add => FailurePoint::ModifyAdd,
            RequestType::Remove => FailurePoint::ModifyRemove,
        };
        self.check(point)?;
        let mut devices = lock(&self.devices);
        if let Some(settings) = request.combined_layers() {
            let root = settings.container_root_path.clone();
            match request.request_type {
                RequestType::Add => devices.composed.push(root),
                RequestType::Remove => {
                    let Some(pos) = devices.composed.iter().position(|r| *r == root) else {
                        return Err(HostError::Rejected {
                            operation: point.operation(),
                            message: format!("no composition at {root}"),
                        });
                    };
                    let _ = devices.composed.remove(pos);
                }
            }
        }
        devices.requests.push(request.clone());
        Ok(())
    }
}

/// Host layer driver operation that can be counted and failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverOp {
    /// [`HostLayerDriver::activate`].
    Activate,
    /// [`HostLayerDriver::deactivate`].
    Deactivate,
    /// [`HostLayerDriver::prepare`].
    Prepare,
    /// [`HostLayerDriver::unprepare`].
    Unprepare,
    /// [`HostLayerDriver::mount_path`].
    MountPath,
    /// [`HostLayerDriver::grant_vm_access`].
    GrantVmAccess,
}

#[derive(Debug, Default)]
struct Layers {
    active: HashSet<PathBuf>,
    prepared: HashMap<PathBuf, Vec<PathBuf>>,
    grants: Vec<(String, PathBuf)>,
    log: Vec<DriverOp>,
}

/// Layer driver that tracks activation and preparation in memory.
#[derive(Debug, Default)]
pub struct FakeLayerDriver {
    faults: Mutex<Faults<DriverOp>>,
    layers: Mutex<Layers>,
}

impl FakeLayerDriver {
    /// Creates a driver with no active layers and no injected failures.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call of `op` fail.
    pub fn fail_always(&self, op: DriverOp) {
        let _ = lock(&self.faults).always.insert(op);
    }

    /// Number of calls made to `op`, failed ones included.
    #[must_use]
    pub fn calls(&self, op: DriverOp) -> usize {
        lock(&self.faults).count(op)
    }

    /// Every successful operation, in call order.
    #[must_use]
    pub fn log(&self) -> Vec<DriverOp> {
        lock(&self.layers).log.clone()
    }

    /// Number of currently activated layers.
    #[must_use]
    pub fn active(&self) -> usize {
        lock(&self.layers).active.len()
    }

    /// Number of currently prepared layers.
    #[must_use]
    pub fn prepared(&self) -> usize {
        lock(&self.layers).prepared.len()
    }

    /// Parents linked beneath the prepared layer at `path`.
    #[must_use]
    pub fn parents_of(&self, path: &Path) -> Option<Vec<PathBuf>> {
        lock(&self.layers).prepared.get(path).cloned()
    }

    /// Access grants made so far, as `(vm_id, path)` pairs.
    #[must_use]
    pub fn grants(&self) -> Vec<(String, PathBuf)> {
        lock(&self.layers).grants.clone()
    }

    fn check(&self, op: DriverOp) -> HostResult<MutexGuard<'_, Layers>> {
        if let Some(n) = lock(&self.faults).hit(op) {
            return Err(HostError::Rejected {
                operation: "layer driver",
                message: format!("injected {op:?} failure on call {n}"),
            });
        }
        let mut layers = lock(&self.layers);
        layers.log.push(op);
        Ok(layers)
    }
}

impl HostLayerDriver for FakeLayerDriver {
    fn activate(&self, path: &Path) -> HostResult<()> {
        let _ = self.check(DriverOp::Activate)?.active.insert(path.to_path_buf());
        Ok(())
    }

    fn deactivate(&self, path: &Path) -> HostResult<()> {
        if self.check(DriverOp::Deactivate)?.active.remove(path) {
            Ok(())
        } else {
            Err(HostError::NotAttached {
                kind: AttachmentKind::HostLayer,
                path: path.to_path_buf(),
            })
        }
    }

    fn prepare(&self, path: &Path, parents: &[PathBuf]) -> HostResult<()> {
        let mut layers = self.check(DriverOp::Prepare)?;
        if !layers.active.contains(path) {
            return Err(HostError::NotAttached {
                kind: AttachmentKind::HostLayer,
                path: path.to_path_buf(),
            });
        }
        let _ = layers.prepared.insert(path.to_path_buf(), parents.to_vec());
        Ok(())
    }

    fn unprepare(&self, path: &Path) -> HostResult<()> {
        self.check(DriverOp::Unprepare)?
            .prepared
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| HostError::NotAttached {
                kind: AttachmentKind::HostLayer,
                path: path.to_path_buf(),
            })
    }

    fn mount_path(&self, path: &Path) -> HostResult<PathBuf> {
        let layers = self.check(DriverOp::MountPath)?;
        if !layers.prepared.contains_key(path) {
            return Err(HostError::NotAttached {
                kind: AttachmentKind::HostLayer,
                path: path.to_path_buf(),
            });
        }
        let id = crate::layer_id::layer_id(path)?;
        Ok(PathBuf::from(format!("/volumes/{id}")))
    }

    fn grant_vm_access(&self, vm_id: &str, path: &Path) -> HostResult<()> {
        self.check(DriverOp::GrantVmAccess)?
            .grants
            .push((vm_id.to_string(), path.to_path_buf()));
        Ok(())
    }
}
