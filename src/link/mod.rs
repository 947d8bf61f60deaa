//! Link module: the shared channel to the device network
//!
//! The link owns the one physical bus adapter and serializes SDO operations
//! from any number of transfers onto it. All adapter access happens on a
//! dedicated worker thread, which communicates with the rest of the process
//! through crossbeam channels.
//!
//! # Architecture
//!
//! - [`CanLink`] - Owns the transport and the command receiver; `run()` is
//!   the worker thread's entry point
//! - [`LinkHandle`] - Cloneable handle used by transfers and the registry:
//!   port and session control, operation submit/cancel, events, stats
//! - [`LinkScheduler`] - The worker loop: FIFO queue, single-flight
//!   dispatch, timeout and cancellation
//! - [`CanTransport`] - Boundary to the actual bus adapter
//! - [`MockTransport`] - In-memory adapter for tests and demos
//!
//! # Example
//!
//! ```ignore
//! use canvis_rs::config::AppConfig;
//! use canvis_rs::link::{CanLink, MockTransport};
//!
//! let (worker, handle) = CanLink::spawn(Box::new(MockTransport::new()));
//! handle.open_port(&AppConfig::default().port)?;
//! handle.create_session()?;
//! // hand `handle` clones to transfers and the value registry
//! handle.shutdown();
//! worker.join().unwrap();
//! ```

pub mod mock;
pub mod scheduler;
pub mod transport;

pub use mock::{MockController, MockTransport};
pub use scheduler::LinkScheduler;
pub use transport::{CanTransport, LinkStats, OpPoll, OpRequest};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::config::PortConfig;
use crate::error::{CanVisError, Result};
use crate::transfer::TransferShared;

/// How long a synchronous port/session call waits for the worker's reply
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Event emitted by the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The session is up; the link accepts operations
    Connected,
    /// The session is down; queued and in-flight operations were cancelled
    Disconnected,
    /// A transport fault failed an operation; the link stays usable
    TransportFault {
        /// Faults since the last successful operation
        consecutive: u32,
    },
}

/// One accepted operation travelling from a transfer to the scheduler
pub(crate) struct Operation {
    pub shared: Arc<TransferShared>,
    pub seq: u64,
}

/// Commands sent from handles to the link worker
pub(crate) enum LinkCommand {
    OpenPort {
        config: PortConfig,
        reply: Sender<Result<()>>,
    },
    ClosePort,
    CreateSession {
        reply: Sender<Result<()>>,
    },
    DestroySession,
    Submit(Operation),
    Cancel {
        shared: Arc<TransferShared>,
        seq: u64,
    },
    QueryStats {
        reply: Sender<LinkStats>,
    },
    Shutdown,
}

/// Link state shared between the worker and the handles
pub(crate) struct LinkShared {
    connected: AtomicBool,
    subscribers: Mutex<Vec<Sender<LinkEvent>>>,
}

impl LinkShared {
    fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub(crate) fn emit(&self, event: LinkEvent) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn add_subscriber(&self, tx: Sender<LinkEvent>) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
    }
}

/// Cloneable handle to the link worker
#[derive(Clone)]
pub struct LinkHandle {
    command_tx: Sender<LinkCommand>,
    shared: Arc<LinkShared>,
}

impl LinkHandle {
    /// Open the serial port; synchronous
    pub fn open_port(&self, config: &PortConfig) -> Result<()> {
        let config = config.clone();
        self.roundtrip(|reply| LinkCommand::OpenPort { config, reply })?
    }

    /// Close the serial port, dropping the session and all operations
    pub fn close_port(&self) {
        let _ = self.command_tx.send(LinkCommand::ClosePort);
    }

    /// Bring up the CANopen session; synchronous
    pub fn create_session(&self) -> Result<()> {
        self.roundtrip(|reply| LinkCommand::CreateSession { reply })?
    }

    /// Tear down the session, cancelling all operations
    pub fn destroy_session(&self) {
        let _ = self.command_tx.send(LinkCommand::DestroySession);
    }

    /// Open the port and bring up the session in one call
    pub fn connect(&self, config: &PortConfig) -> Result<()> {
        self.open_port(config)?;
        self.create_session()
    }

    /// Tear down the session and close the port
    pub fn disconnect(&self) {
        self.destroy_session();
        self.close_port();
    }

    /// Whether the session is up
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Register an event channel
    pub fn subscribe(&self) -> Receiver<LinkEvent> {
        let (tx, rx) = unbounded();
        self.shared.add_subscriber(tx);
        rx
    }

    /// Snapshot of the link statistics
    pub fn stats(&self) -> Result<LinkStats> {
        self.roundtrip(|reply| LinkCommand::QueryStats { reply })
    }

    /// Stop the worker thread
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(LinkCommand::Shutdown);
    }

    pub(crate) fn submit(&self, op: Operation) -> Result<()> {
        self.command_tx
            .send(LinkCommand::Submit(op))
            .map_err(|_| CanVisError::Channel("link worker is gone".to_string()))
    }

    pub(crate) fn cancel(&self, shared: Arc<TransferShared>, seq: u64) -> Result<()> {
        self.command_tx
            .send(LinkCommand::Cancel { shared, seq })
            .map_err(|_| CanVisError::Channel("link worker is gone".to_string()))
    }

    fn roundtrip<T>(&self, build: impl FnOnce(Sender<T>) -> LinkCommand) -> Result<T> {
        let (tx, rx) = bounded(1);
        self.command_tx
            .send(build(tx))
            .map_err(|_| CanVisError::Channel("link worker is gone".to_string()))?;
        rx.recv_timeout(REPLY_TIMEOUT)
            .map_err(|_| CanVisError::Channel("link worker did not reply".to_string()))
    }
}

/// The link backend that runs on a worker thread
pub struct CanLink {
    command_rx: Receiver<LinkCommand>,
    shared: Arc<LinkShared>,
    transport: Box<dyn CanTransport>,
}

impl CanLink {
    /// Create a link backend around a transport, with a handle to drive it
    pub fn new(transport: Box<dyn CanTransport>) -> (Self, LinkHandle) {
        let (command_tx, command_rx) = bounded(256);
        let shared = Arc::new(LinkShared::new());

        let link = Self {
            command_rx,
            shared: shared.clone(),
            transport,
        };
        let handle = LinkHandle { command_tx, shared };

        (link, handle)
    }

    /// Run the worker loop; consumes the backend
    pub fn run(self) {
        LinkScheduler::new(self.transport, self.command_rx, self.shared).run();
    }

    /// Create the backend and run it on a new thread
    pub fn spawn(transport: Box<dyn CanTransport>) -> (thread::JoinHandle<()>, LinkHandle) {
        let (link, handle) = Self::new(transport);
        let worker = thread::spawn(move || link.run());
        (worker, handle)
    }
}
