//! Deduplicated polling registry for live values
//!
//! The [`ValueRegistry`] owns a set of shared [`HeldValue`] entries, one per
//! distinct (address, size) pair, and refreshes them on a fixed interval
//! while the link is connected. Any number of observers can register
//! interest in the same remote object; the registry guarantees at most one
//! outstanding read per object regardless of how many observers watch it.
//!
//! # Refresh cycle
//!
//! A control thread drives the cycle. On every tick it emits
//! [`RegistryEvent::UpdateBegin`] to registry subscribers, then issues one
//! read for every entry that was not freshly read since the previous tick.
//! An entry whose read completed out of band (an explicit
//! [`HeldValue::read`]) counts as fresh and is skipped; an entry whose read
//! is still in flight is skipped as well, not reissued. A cancelled periodic
//! read is not an error: the entry is simply retried on the next tick.
//!
//! # Lifecycle
//!
//! The registry listens to link events: updating is enabled on `Connected`
//! and disabled on `Disconnected` (cancellation of in-flight reads on
//! disconnect is the link scheduler's job). [`ValueRegistry::enable_updating`]
//! and [`ValueRegistry::disable_updating`] give the same control manually.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{never, select, tick, unbounded, Receiver, Sender};

use crate::config::AppConfig;
use crate::error::{CanVisError, Result};
use crate::link::{LinkEvent, LinkHandle};
use crate::transfer::{SdoTransfer, TransferError, TransferEvent, TransferState};
use crate::types::{CoValueType, ObjectAddress, Scalar};

/// Event emitted by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A refresh pass is starting; observers can sample stale values now
    UpdateBegin,
}

/// Dedup key of a registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ValueKey {
    /// Addressed object
    pub address: ObjectAddress,
    /// Declared value size in bytes
    pub size: usize,
}

/// A registry-owned, shared, periodically refreshed copy of one remote object
pub struct HeldValue {
    key: ValueKey,
    ty: Option<CoValueType>,
    transfer: Mutex<SdoTransfer>,
    fresh: Arc<AtomicBool>,
}

impl HeldValue {
    /// Address of the held object
    pub fn address(&self) -> ObjectAddress {
        self.key.address
    }

    /// Declared value size in bytes
    pub fn data_size(&self) -> usize {
        self.key.size
    }

    /// The encoding this value was registered with, if any
    pub fn value_type(&self) -> Option<CoValueType> {
        self.ty
    }

    /// Snapshot of the raw bytes
    pub fn data(&self) -> Vec<u8> {
        self.lock_transfer().data()
    }

    /// Decode with the registered encoding
    pub fn value(&self) -> Result<f64> {
        let ty = self.ty.ok_or_else(|| {
            CanVisError::UnsupportedType(format!(
                "value {} was registered by size only",
                self.key.address
            ))
        })?;
        self.value_as(ty)
    }

    /// Decode with an explicit encoding
    pub fn value_as(&self, ty: CoValueType) -> Result<f64> {
        self.lock_transfer().value_as(ty)
    }

    /// Read the value as a scalar of exactly matching width
    pub fn value_scalar<T: Scalar>(&self) -> Result<T> {
        self.lock_transfer().value()
    }

    /// Encode a value into the buffer with the registered encoding
    pub fn set_value(&self, value: f64) -> Result<()> {
        let ty = self.ty.ok_or_else(|| {
            CanVisError::UnsupportedType(format!(
                "value {} was registered by size only",
                self.key.address
            ))
        })?;
        self.lock_transfer().set_value_as(ty, value)
    }

    /// Issue an explicit out-of-band read; `false` if one is running or the
    /// link is down
    pub fn read(&self) -> bool {
        self.lock_transfer().read()
    }

    /// Write the buffer to the device
    pub fn write(&self) -> bool {
        self.lock_transfer().write()
    }

    /// State of the underlying transfer
    pub fn state(&self) -> TransferState {
        self.lock_transfer().state()
    }

    /// Terminal error of the last operation, `None` after success
    pub fn error(&self) -> Option<TransferError> {
        self.lock_transfer().error()
    }

    /// Bytes exchanged by the last completed operation
    pub fn transferred_data_size(&self) -> usize {
        self.lock_transfer().transferred_data_size()
    }

    /// Register an event channel on the underlying transfer
    pub fn subscribe(&self) -> Receiver<TransferEvent> {
        self.lock_transfer().subscribe()
    }

    fn lock_transfer(&self) -> MutexGuard<'_, SdoTransfer> {
        self.transfer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Entry {
    value: Arc<HeldValue>,
    observers: usize,
}

struct RegistryInner {
    entries: BTreeMap<ValueKey, Entry>,
    subscribers: Vec<Sender<RegistryEvent>>,
    interval: Duration,
    enabled: bool,
}

enum RegistryCommand {
    Enable,
    Disable,
    SetInterval(Duration),
    RefreshNow,
    Shutdown,
}

/// Deduplicating registry of periodically refreshed values
pub struct ValueRegistry {
    link: LinkHandle,
    inner: Arc<Mutex<RegistryInner>>,
    ctrl_tx: Sender<RegistryCommand>,
    worker: Option<thread::JoinHandle<()>>,
    default_timeout: Duration,
}

impl ValueRegistry {
    /// Create a registry on a link.
    ///
    /// The registry subscribes to the link's events and enables updating
    /// while the link is connected.
    pub fn new(link: LinkHandle, config: &AppConfig) -> Self {
        let inner = Arc::new(Mutex::new(RegistryInner {
            entries: BTreeMap::new(),
            subscribers: Vec::new(),
            interval: config.registry.update_interval(),
            enabled: false,
        }));
        let (ctrl_tx, ctrl_rx) = unbounded();
        let link_events = link.subscribe();

        let worker_inner = inner.clone();
        let worker = thread::spawn(move || control_loop(worker_inner, ctrl_rx, link_events));

        let registry = Self {
            link,
            inner,
            ctrl_tx,
            worker: Some(worker),
            default_timeout: config.sdo.timeout(),
        };
        if registry.link.is_connected() {
            registry.enable_updating();
        }
        registry
    }

    /// Get or create the shared value for an address and encoding.
    ///
    /// Str/mem have no fixed width; register those with
    /// [`ValueRegistry::add_value_sized`].
    pub fn add_value(&self, address: ObjectAddress, ty: CoValueType) -> Result<Arc<HeldValue>> {
        let size = ty.size_bytes().ok_or_else(|| {
            CanVisError::UnsupportedType(format!("{ty} values must be registered by size"))
        })?;
        self.add_entry(address, size, Some(ty))
    }

    /// Get or create the shared value for an address and explicit size
    pub fn add_value_sized(&self, address: ObjectAddress, size: usize) -> Result<Arc<HeldValue>> {
        if size == 0 {
            return Err(CanVisError::Validation(
                "value size must not be zero".to_string(),
            ));
        }
        self.add_entry(address, size, None)
    }

    fn add_entry(
        &self,
        address: ObjectAddress,
        size: usize,
        ty: Option<CoValueType>,
    ) -> Result<Arc<HeldValue>> {
        let key = ValueKey { address, size };
        let mut inner = lock(&self.inner);
        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.observers += 1;
            return Ok(entry.value.clone());
        }

        let mut transfer = SdoTransfer::with_link(self.link.clone());
        transfer.set_address(address);
        transfer.set_data_size(size);
        transfer.set_timeout(self.default_timeout);

        let fresh = Arc::new(AtomicBool::new(false));
        let hook_fresh = fresh.clone();
        transfer.add_hook(Box::new(move |event| {
            if matches!(event, TransferEvent::ReadCompleted) {
                hook_fresh.store(true, Ordering::Release);
            }
        }));

        let value = Arc::new(HeldValue {
            key,
            ty,
            transfer: Mutex::new(transfer),
            fresh,
        });
        inner.entries.insert(
            key,
            Entry {
                value: value.clone(),
                observers: 1,
            },
        );
        tracing::debug!("registered value {} ({} bytes)", address, size);
        Ok(value)
    }

    /// Release one observer's interest; at zero the entry is torn down,
    /// cancelling its transfer if running. Returns `false` for a value this
    /// registry does not hold.
    pub fn remove_value(&self, value: &Arc<HeldValue>) -> bool {
        let mut inner = lock(&self.inner);
        let Some(entry) = inner.entries.get_mut(&value.key) else {
            return false;
        };
        if !Arc::ptr_eq(&entry.value, value) {
            return false;
        }
        entry.observers -= 1;
        if entry.observers == 0 {
            inner.entries.remove(&value.key);
            drop(inner);
            value.lock_transfer().cancel();
            tracing::debug!("released value {}", value.key.address);
        }
        true
    }

    /// Observer count for a held value, 0 if not held here
    pub fn observer_count(&self, value: &Arc<HeldValue>) -> usize {
        lock(&self.inner)
            .entries
            .get(&value.key)
            .filter(|e| Arc::ptr_eq(&e.value, value))
            .map_or(0, |e| e.observers)
    }

    /// Number of distinct held values
    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    /// Whether the registry holds no values
    pub fn is_empty(&self) -> bool {
        lock(&self.inner).entries.is_empty()
    }

    /// Whether the periodic refresh is running
    pub fn is_updating(&self) -> bool {
        lock(&self.inner).enabled
    }

    /// Current refresh interval
    pub fn update_interval(&self) -> Duration {
        lock(&self.inner).interval
    }

    /// Change the refresh interval
    pub fn set_update_interval(&self, interval: Duration) {
        let _ = self.ctrl_tx.send(RegistryCommand::SetInterval(interval));
    }

    /// Start the periodic refresh
    pub fn enable_updating(&self) {
        let _ = self.ctrl_tx.send(RegistryCommand::Enable);
    }

    /// Stop the periodic refresh; in-flight reads are left to complete
    pub fn disable_updating(&self) {
        let _ = self.ctrl_tx.send(RegistryCommand::Disable);
    }

    /// Run one refresh pass immediately, regardless of the timer
    pub fn refresh_now(&self) {
        let _ = self.ctrl_tx.send(RegistryCommand::RefreshNow);
    }

    /// Register an event channel
    pub fn subscribe(&self) -> Receiver<RegistryEvent> {
        let (tx, rx) = unbounded();
        lock(&self.inner).subscribers.push(tx);
        rx
    }

    /// The link this registry polls through
    pub fn link(&self) -> &LinkHandle {
        &self.link
    }
}

impl Drop for ValueRegistry {
    fn drop(&mut self) {
        let _ = self.ctrl_tx.send(RegistryCommand::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn lock(inner: &Mutex<RegistryInner>) -> MutexGuard<'_, RegistryInner> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

fn control_loop(
    inner: Arc<Mutex<RegistryInner>>,
    ctrl_rx: Receiver<RegistryCommand>,
    link_events: Receiver<LinkEvent>,
) {
    let mut link_events = link_events;
    let mut ticker = never();

    loop {
        select! {
            recv(ctrl_rx) -> cmd => match cmd {
                Ok(RegistryCommand::Enable) => {
                    let mut guard = lock(&inner);
                    guard.enabled = true;
                    let interval = guard.interval;
                    drop(guard);
                    ticker = tick(interval);
                }
                Ok(RegistryCommand::Disable) => {
                    lock(&inner).enabled = false;
                    ticker = never();
                }
                Ok(RegistryCommand::SetInterval(interval)) => {
                    let mut guard = lock(&inner);
                    guard.interval = interval;
                    let enabled = guard.enabled;
                    drop(guard);
                    if enabled {
                        ticker = tick(interval);
                    }
                }
                Ok(RegistryCommand::RefreshNow) => refresh_pass(&inner, true),
                Ok(RegistryCommand::Shutdown) | Err(_) => break,
            },
            recv(link_events) -> event => match event {
                Ok(LinkEvent::Connected) => {
                    let mut guard = lock(&inner);
                    guard.enabled = true;
                    let interval = guard.interval;
                    drop(guard);
                    ticker = tick(interval);
                    tracing::debug!("link connected, updating enabled");
                }
                Ok(LinkEvent::Disconnected) => {
                    lock(&inner).enabled = false;
                    ticker = never();
                    tracing::debug!("link disconnected, updating disabled");
                }
                Ok(LinkEvent::TransportFault { .. }) => {}
                Err(_) => {
                    // Link worker is gone; stop listening but keep serving
                    // registry commands until shutdown
                    link_events = never();
                }
            },
            recv(ticker) -> _ => refresh_pass(&inner, false),
        }
    }
}

/// One refresh pass: announce the cycle, then read every non-fresh idle value
fn refresh_pass(inner: &Mutex<RegistryInner>, force: bool) {
    let values: Vec<Arc<HeldValue>> = {
        let mut guard = lock(inner);
        if !force && !guard.enabled {
            return;
        }
        guard
            .subscribers
            .retain(|tx| tx.send(RegistryEvent::UpdateBegin).is_ok());
        guard.entries.values().map(|e| e.value.clone()).collect()
    };

    for value in values {
        if value.fresh.swap(false, Ordering::AcqRel) {
            // Updated since the previous tick, no need to poll it again
            continue;
        }
        let mut transfer = value.transfer.lock().unwrap_or_else(|e| e.into_inner());
        if transfer.running() {
            // Still in flight from an earlier cycle: skip, never reissue
            continue;
        }
        if !transfer.read() {
            tracing::trace!("periodic read for {} not issued", value.key.address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_key_ordering_groups_by_node() {
        let a = ValueKey {
            address: ObjectAddress::new(1, 0x2000, 0).unwrap(),
            size: 4,
        };
        let b = ValueKey {
            address: ObjectAddress::new(1, 0x2000, 1).unwrap(),
            size: 4,
        };
        let c = ValueKey {
            address: ObjectAddress::new(2, 0x2000, 0).unwrap(),
            size: 4,
        };
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_same_address_different_size_is_distinct() {
        let address = ObjectAddress::new(1, 0x2000, 0).unwrap();
        let a = ValueKey { address, size: 2 };
        let b = ValueKey { address, size: 4 };
        assert_ne!(a, b);
    }
}
