//! SDO transfer state machine
//!
//! An [`SdoTransfer`] is one in-flight read or write of a single remote
//! object. It owns its data buffer, timeout and outcome, but no transport:
//! accepted operations are handed to the link worker through a [`LinkHandle`]
//! and completed asynchronously.
//!
//! # Lifecycle
//!
//! A transfer starts `Idle`. [`SdoTransfer::read`]/[`SdoTransfer::write`]
//! move it to `Queued` and submit it to the link; the scheduler moves it to
//! `InFlight` when dispatched and to `Finished` when the operation reaches a
//! terminal outcome. Exactly one terminal outcome is delivered per accepted
//! operation, even when [`SdoTransfer::cancel`] races a completing response.
//!
//! # Events
//!
//! Observers register a channel with [`SdoTransfer::subscribe`]. On
//! completion the specific event fires first (`ReadCompleted`,
//! `WriteCompleted`, `Cancelled` for a locally requested cancel, or
//! `Failed`), followed by the generic `Finished`.
//!
//! # Ownership
//!
//! The mutable transfer state lives behind an `Arc` shared with the link
//! worker for the duration of an operation. Dropping the `SdoTransfer` while
//! an operation is running is safe: the worker keeps the buffer alive until
//! the terminal outcome is delivered and retains no reference afterwards.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{CanVisError, Result};
use crate::link::{LinkHandle, Operation};
use crate::types::{self, CoValueType, Direction, ObjectAddress, Scalar};

/// State of an SDO transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferState {
    /// No operation accepted yet, or the previous one finished
    #[default]
    Idle,
    /// Accepted and waiting in the link queue
    Queued,
    /// Dispatched onto the wire, awaiting the response
    InFlight,
    /// Terminal outcome delivered
    Finished,
}

impl TransferState {
    /// Whether an operation is currently accepted and not yet terminal
    pub fn is_running(&self) -> bool {
        matches!(self, TransferState::Queued | TransferState::InFlight)
    }
}

/// Terminal failure of an SDO operation
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// No response arrived within the configured timeout
    #[error("timed out")]
    Timeout,
    /// The operation was aborted, either locally or by a disconnect
    #[error("cancelled")]
    Cancelled,
    /// The lower layer failed while the operation was on the wire
    #[error("transport error: {0}")]
    Transport(String),
    /// The remote node rejected the address or size
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Event emitted by a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// An upload finished successfully; the buffer holds the fresh bytes
    ReadCompleted,
    /// A download finished successfully
    WriteCompleted,
    /// A locally requested cancel completed
    Cancelled,
    /// The operation failed (including disconnect-induced cancellation)
    Failed(TransferError),
    /// Generic completion, emitted after the specific event in all cases
    Finished,
}

pub(crate) struct TransferInner {
    pub address: ObjectAddress,
    pub direction: Direction,
    pub data: Vec<u8>,
    pub transfer_size: usize,
    pub timeout: Duration,
    pub state: TransferState,
    pub error: Option<TransferError>,
    pub transferred: usize,
    /// Sequence number of the currently accepted operation
    pub op_seq: u64,
    /// Whether the current operation's cancellation was requested locally
    pub cancel_requested: bool,
}

pub(crate) type EventHook = Box<dyn Fn(&TransferEvent) + Send + Sync>;

/// Transfer state shared between the owning handle and the link worker
pub(crate) struct TransferShared {
    inner: Mutex<TransferInner>,
    subscribers: Mutex<Vec<Sender<TransferEvent>>>,
    hooks: Mutex<Vec<EventHook>>,
}

impl TransferShared {
    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, TransferInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, Vec<Sender<TransferEvent>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_hooks(&self) -> MutexGuard<'_, Vec<EventHook>> {
        self.hooks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, event: &TransferEvent) {
        for hook in self.lock_hooks().iter() {
            hook(event);
        }
        self.lock_subscribers()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Snapshot of an accepted operation, taken by the scheduler at dispatch
pub(crate) struct OpSnapshot {
    pub address: ObjectAddress,
    pub direction: Direction,
    /// Bytes to send for a download; empty for uploads
    pub data: Vec<u8>,
    pub size: usize,
    pub timeout: Duration,
}

/// Move a queued operation in flight and snapshot its request parameters.
///
/// Returns `None` if the operation is stale (already finalized by a cancel
/// or disconnect that overtook the dispatch).
pub(crate) fn begin_snapshot(shared: &TransferShared, seq: u64) -> Option<OpSnapshot> {
    let mut inner = shared.lock_inner();
    if inner.op_seq != seq || inner.state != TransferState::Queued {
        return None;
    }
    inner.state = TransferState::InFlight;
    let size = inner.transfer_size.min(inner.data.len());
    let data = match inner.direction {
        Direction::Download => inner.data[..size].to_vec(),
        Direction::Upload => Vec::new(),
    };
    Some(OpSnapshot {
        address: inner.address,
        direction: inner.direction,
        data,
        size,
        timeout: inner.timeout,
    })
}

/// Deliver the terminal outcome for one accepted operation.
///
/// The link worker is the only caller, which together with the sequence
/// check makes delivery exactly-once: a cancel racing a completed response
/// finds the state already `Finished` and does nothing.
pub(crate) fn finalize(
    shared: &TransferShared,
    seq: u64,
    result: std::result::Result<usize, TransferError>,
    payload: Option<&[u8]>,
) {
    let specific = {
        let mut inner = shared.lock_inner();
        if inner.op_seq != seq || !inner.state.is_running() {
            return;
        }
        let specific = match result {
            Ok(n) => {
                let n = n.min(inner.data.len());
                if let Some(bytes) = payload {
                    let copy = n.min(bytes.len());
                    inner.data[..copy].copy_from_slice(&bytes[..copy]);
                }
                inner.transferred = n;
                inner.error = None;
                match inner.direction {
                    Direction::Upload => TransferEvent::ReadCompleted,
                    Direction::Download => TransferEvent::WriteCompleted,
                }
            }
            Err(err) => {
                inner.transferred = 0;
                let event = if err == TransferError::Cancelled && inner.cancel_requested {
                    TransferEvent::Cancelled
                } else {
                    TransferEvent::Failed(err.clone())
                };
                inner.error = Some(err);
                event
            }
        };
        inner.state = TransferState::Finished;
        specific
    };
    shared.notify(&specific);
    shared.notify(&TransferEvent::Finished);
}

/// One read/write request for a single remote object
pub struct SdoTransfer {
    shared: Arc<TransferShared>,
    link: Option<LinkHandle>,
    next_seq: u64,
}

impl SdoTransfer {
    /// Create a detached transfer; attach a link before reading or writing
    pub fn new() -> Self {
        Self {
            shared: Arc::new(TransferShared {
                inner: Mutex::new(TransferInner {
                    address: ObjectAddress {
                        node_id: crate::types::NODE_ID_MIN,
                        index: 0,
                        sub_index: 0,
                    },
                    direction: Direction::Upload,
                    data: Vec::new(),
                    transfer_size: 0,
                    timeout: Duration::from_millis(1000),
                    state: TransferState::Idle,
                    error: None,
                    transferred: 0,
                    op_seq: 0,
                    cancel_requested: false,
                }),
                subscribers: Mutex::new(Vec::new()),
                hooks: Mutex::new(Vec::new()),
            }),
            link: None,
            next_seq: 0,
        }
    }

    /// Create a transfer attached to a link
    pub fn with_link(link: LinkHandle) -> Self {
        let mut transfer = Self::new();
        transfer.link = Some(link);
        transfer
    }

    /// The attached link handle, if any
    pub fn link(&self) -> Option<&LinkHandle> {
        self.link.as_ref()
    }

    /// Attach or replace the link; rejected while running
    pub fn set_link(&mut self, link: LinkHandle) -> bool {
        if self.running() {
            return false;
        }
        self.link = Some(link);
        true
    }

    /// Object address
    pub fn address(&self) -> ObjectAddress {
        self.shared.lock_inner().address
    }

    /// Set the object address; rejected while running
    pub fn set_address(&mut self, address: ObjectAddress) -> bool {
        let mut inner = self.shared.lock_inner();
        if inner.state.is_running() {
            return false;
        }
        inner.address = address;
        true
    }

    /// Node id of the addressed object
    pub fn node_id(&self) -> u8 {
        self.shared.lock_inner().address.node_id
    }

    /// Set the node id; rejected while running or out of range
    pub fn set_node_id(&mut self, node_id: u8) -> bool {
        if !(types::NODE_ID_MIN..=types::NODE_ID_MAX).contains(&node_id) {
            return false;
        }
        let mut inner = self.shared.lock_inner();
        if inner.state.is_running() {
            return false;
        }
        inner.address.node_id = node_id;
        true
    }

    /// Object index
    pub fn index(&self) -> u16 {
        self.shared.lock_inner().address.index
    }

    /// Set the object index; rejected while running
    pub fn set_index(&mut self, index: u16) -> bool {
        let mut inner = self.shared.lock_inner();
        if inner.state.is_running() {
            return false;
        }
        inner.address.index = index;
        true
    }

    /// Object sub-index
    pub fn sub_index(&self) -> u8 {
        self.shared.lock_inner().address.sub_index
    }

    /// Set the object sub-index; rejected while running
    pub fn set_sub_index(&mut self, sub_index: u8) -> bool {
        let mut inner = self.shared.lock_inner();
        if inner.state.is_running() {
            return false;
        }
        inner.address.sub_index = sub_index;
        true
    }

    /// Size of the data buffer in bytes
    pub fn data_size(&self) -> usize {
        self.shared.lock_inner().data.len()
    }

    /// Resize the data buffer; rejected while running.
    ///
    /// The overlapping prefix is preserved and growth is zero-filled. The
    /// transfer size follows the new buffer size; use
    /// [`SdoTransfer::set_transfer_size`] afterwards for segmented access.
    pub fn set_data_size(&mut self, new_size: usize) -> bool {
        let mut inner = self.shared.lock_inner();
        if inner.state.is_running() {
            return false;
        }
        if inner.data.len() != new_size {
            inner.data.resize(new_size, 0);
        }
        inner.transfer_size = new_size;
        true
    }

    /// Number of bytes exchanged per operation
    pub fn transfer_size(&self) -> usize {
        self.shared.lock_inner().transfer_size
    }

    /// Set the per-operation exchange size; rejected while running or when
    /// larger than the data buffer
    pub fn set_transfer_size(&mut self, new_size: usize) -> bool {
        let mut inner = self.shared.lock_inner();
        if inner.state.is_running() || new_size > inner.data.len() {
            return false;
        }
        inner.transfer_size = new_size;
        true
    }

    /// Operation timeout
    pub fn timeout(&self) -> Duration {
        self.shared.lock_inner().timeout
    }

    /// Set the operation timeout; rejected while running
    pub fn set_timeout(&mut self, timeout: Duration) -> bool {
        let mut inner = self.shared.lock_inner();
        if inner.state.is_running() {
            return false;
        }
        inner.timeout = timeout;
        true
    }

    /// Snapshot of the data buffer
    pub fn data(&self) -> Vec<u8> {
        self.shared.lock_inner().data.clone()
    }

    /// Replace the buffer contents (and size); rejected while running
    pub fn set_data(&mut self, bytes: &[u8]) -> bool {
        let mut inner = self.shared.lock_inner();
        if inner.state.is_running() {
            return false;
        }
        inner.data.clear();
        inner.data.extend_from_slice(bytes);
        inner.transfer_size = bytes.len();
        true
    }

    /// Direction of the last accepted operation
    pub fn direction(&self) -> Direction {
        self.shared.lock_inner().direction
    }

    /// Current state
    pub fn state(&self) -> TransferState {
        self.shared.lock_inner().state
    }

    /// Terminal error of the last operation, `None` after success
    pub fn error(&self) -> Option<TransferError> {
        self.shared.lock_inner().error.clone()
    }

    /// Whether an operation is accepted and not yet terminal
    pub fn running(&self) -> bool {
        self.shared.lock_inner().state.is_running()
    }

    /// Whether the current/last operation's cancel was requested locally
    pub fn cancelled(&self) -> bool {
        self.shared.lock_inner().cancel_requested
    }

    /// Bytes actually exchanged by the last completed operation
    pub fn transferred_data_size(&self) -> usize {
        self.shared.lock_inner().transferred
    }

    /// Read the whole buffer as a scalar of exactly matching width
    pub fn value<T: Scalar>(&self) -> Result<T> {
        let inner = self.shared.lock_inner();
        types::scalar_from_bytes(&inner.data)
    }

    /// Read a scalar at a byte offset into the buffer
    pub fn value_at<T: Scalar>(&self, offset: usize) -> Result<T> {
        let inner = self.shared.lock_inner();
        let end = offset
            .checked_add(T::WIDTH)
            .filter(|end| *end <= inner.data.len())
            .ok_or_else(|| {
                CanVisError::Validation(format!(
                    "{} byte read at offset {} exceeds {} byte buffer",
                    T::WIDTH,
                    offset,
                    inner.data.len()
                ))
            })?;
        T::from_le_slice(&inner.data[offset..end]).ok_or_else(|| {
            CanVisError::Validation(format!("buffer too short for {} byte scalar", T::WIDTH))
        })
    }

    /// Decode the buffer with the given encoding
    pub fn value_as(&self, ty: CoValueType) -> Result<f64> {
        let inner = self.shared.lock_inner();
        ty.decode(&inner.data)
    }

    /// Encode a value into the buffer; rejected while running
    pub fn set_value_as(&mut self, ty: CoValueType, value: f64) -> Result<()> {
        let mut inner = self.shared.lock_inner();
        if inner.state.is_running() {
            return Err(CanVisError::Validation(
                "transfer is running".to_string(),
            ));
        }
        ty.encode(value, &mut inner.data)
    }

    /// Start an upload (read from the device).
    ///
    /// Returns `false` without state change when already running, when no
    /// link is attached or connected, or when the buffer is empty.
    pub fn read(&mut self) -> bool {
        self.start(Direction::Upload)
    }

    /// Start a download (write the buffer to the device).
    ///
    /// Same acceptance rules as [`SdoTransfer::read`].
    pub fn write(&mut self) -> bool {
        self.start(Direction::Download)
    }

    fn start(&mut self, direction: Direction) -> bool {
        let Some(link) = &self.link else {
            return false;
        };
        if !link.is_connected() {
            return false;
        }
        {
            let mut inner = self.shared.lock_inner();
            if inner.state.is_running() {
                return false;
            }
            if inner.data.is_empty() {
                return false;
            }
            self.next_seq += 1;
            inner.direction = direction;
            inner.state = TransferState::Queued;
            inner.error = None;
            inner.transferred = 0;
            inner.cancel_requested = false;
            inner.op_seq = self.next_seq;
        }
        let accepted = link
            .submit(Operation {
                shared: self.shared.clone(),
                seq: self.next_seq,
            })
            .is_ok();
        if !accepted {
            self.shared.lock_inner().state = TransferState::Idle;
        }
        accepted
    }

    /// Request cancellation of the running operation.
    ///
    /// No-op when not running. Cancellation is asynchronous: the terminal
    /// event still fires, as `Cancelled` unless a response won the race.
    pub fn cancel(&mut self) -> bool {
        let Some(link) = &self.link else {
            return false;
        };
        let seq = {
            let mut inner = self.shared.lock_inner();
            if !inner.state.is_running() {
                return false;
            }
            inner.cancel_requested = true;
            inner.op_seq
        };
        link.cancel(self.shared.clone(), seq).is_ok()
    }

    /// Register an event channel; every event is delivered to every
    /// subscriber in emission order
    pub fn subscribe(&self) -> Receiver<TransferEvent> {
        let (tx, rx) = unbounded();
        self.shared.lock_subscribers().push(tx);
        rx
    }

    /// Register an in-process event hook, invoked on the link worker thread
    pub(crate) fn add_hook(&self, hook: EventHook) {
        self.shared.lock_hooks().push(hook);
    }
}

impl Default for SdoTransfer {
    fn default() -> Self {
        Self::new()
    }
}
