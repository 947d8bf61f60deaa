//! Mock transport for testing
//!
//! This module provides a bus adapter stand-in backed by an in-memory object
//! dictionary, so the link scheduler and value registry can be exercised
//! without hardware.
//!
//! # Features
//!
//! - **Object dictionary**: reads and writes resolve against a per-address
//!   byte store; unknown addresses fail like a remote SDO abort
//! - **Response latency**: a configurable delay before any response
//! - **Silent addresses**: objects that never answer, for timeout tests
//! - **Fault injection**: queue transport/protocol errors for upcoming
//!   operations
//!
//! The transport's state is shared with a [`MockController`], so tests keep
//! a handle to the dictionary after the transport has moved into the link
//! worker thread.
//!
//! # Example
//!
//! ```ignore
//! let transport = MockTransport::new()
//!     .with_object(addr, &16384i32.to_le_bytes());
//! let mock = transport.controller();
//! let (worker, handle) = CanLink::spawn(Box::new(transport));
//! // ... later, from the test:
//! mock.set_response_delay(Duration::from_millis(50));
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::PortConfig;
use crate::error::{CanVisError, Result};
use crate::transfer::TransferError;
use crate::types::{Direction, ObjectAddress};

use super::transport::{CanTransport, OpPoll, OpRequest};

#[derive(Default)]
struct MockState {
    dictionary: HashMap<ObjectAddress, Vec<u8>>,
    response_delay: Duration,
    silent: HashSet<ObjectAddress>,
    pending_faults: VecDeque<TransferError>,
    port_open: bool,
    connected: bool,
    ops_begun: u64,
}

struct InFlight {
    request: OpRequest,
    started: Instant,
}

/// Bus adapter simulation with an in-memory object dictionary
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    in_flight: Option<InFlight>,
}

impl MockTransport {
    /// Create a mock transport with an empty dictionary
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            in_flight: None,
        }
    }

    /// Seed the dictionary with an object
    pub fn with_object(self, address: ObjectAddress, bytes: &[u8]) -> Self {
        lock(&self.state).dictionary.insert(address, bytes.to_vec());
        self
    }

    /// Set the response latency applied to every operation
    pub fn with_response_delay(self, delay: Duration) -> Self {
        lock(&self.state).response_delay = delay;
        self
    }

    /// A handle to the shared state, usable after the transport moved into
    /// the link worker
    pub fn controller(&self) -> MockController {
        MockController {
            state: self.state.clone(),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl CanTransport for MockTransport {
    fn open_port(&mut self, config: &PortConfig) -> Result<()> {
        if config.name.is_empty() {
            return Err(CanVisError::Validation("empty port name".to_string()));
        }
        lock(&self.state).port_open = true;
        tracing::info!("mock port {} opened", config.name);
        Ok(())
    }

    fn close_port(&mut self) {
        let mut state = lock(&self.state);
        state.port_open = false;
        state.connected = false;
        drop(state);
        self.in_flight = None;
        tracing::info!("mock port closed");
    }

    fn create_session(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.port_open {
            return Err(CanVisError::Validation(
                "cannot create session: port not open".to_string(),
            ));
        }
        state.connected = true;
        tracing::info!("mock session created");
        Ok(())
    }

    fn destroy_session(&mut self) {
        lock(&self.state).connected = false;
        self.in_flight = None;
        tracing::info!("mock session destroyed");
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    fn begin(&mut self, request: &OpRequest) -> std::result::Result<(), TransferError> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(TransferError::Transport("link down".to_string()));
        }
        state.ops_begun += 1;
        drop(state);
        self.in_flight = Some(InFlight {
            request: request.clone(),
            started: Instant::now(),
        });
        Ok(())
    }

    fn poll(&mut self) -> std::result::Result<OpPoll, TransferError> {
        let Some(in_flight) = &self.in_flight else {
            return Err(TransferError::Transport(
                "no operation in flight".to_string(),
            ));
        };
        let mut state = lock(&self.state);

        if state.silent.contains(&in_flight.request.address) {
            return Ok(OpPoll::Pending);
        }
        if in_flight.started.elapsed() < state.response_delay {
            return Ok(OpPoll::Pending);
        }

        let request = &in_flight.request;
        let outcome = if let Some(fault) = state.pending_faults.pop_front() {
            Err(fault)
        } else {
            match state.dictionary.get_mut(&request.address) {
                None => Err(TransferError::Protocol(format!(
                    "object {} does not exist",
                    request.address
                ))),
                Some(entry) => match request.direction {
                    Direction::Upload => {
                        if request.size > entry.len() {
                            Err(TransferError::Protocol(format!(
                                "requested {} bytes from a {} byte object",
                                request.size,
                                entry.len()
                            )))
                        } else {
                            Ok(OpPoll::Complete(entry[..request.size].to_vec()))
                        }
                    }
                    Direction::Download => {
                        if request.size > entry.len() || request.data.len() < request.size {
                            Err(TransferError::Protocol(format!(
                                "data length mismatch for {}",
                                request.address
                            )))
                        } else {
                            entry[..request.size].copy_from_slice(&request.data[..request.size]);
                            Ok(OpPoll::Complete(Vec::new()))
                        }
                    }
                },
            }
        };
        drop(state);
        self.in_flight = None;
        outcome
    }

    fn abort(&mut self) {
        self.in_flight = None;
    }
}

/// Test-side handle to a [`MockTransport`]'s shared state
#[derive(Clone)]
pub struct MockController {
    state: Arc<Mutex<MockState>>,
}

impl MockController {
    /// Insert or replace an object in the dictionary
    pub fn insert_object(&self, address: ObjectAddress, bytes: &[u8]) {
        lock(&self.state).dictionary.insert(address, bytes.to_vec());
    }

    /// Current bytes of an object, if present
    pub fn object(&self, address: ObjectAddress) -> Option<Vec<u8>> {
        lock(&self.state).dictionary.get(&address).cloned()
    }

    /// Set the response latency applied to every operation
    pub fn set_response_delay(&self, delay: Duration) {
        lock(&self.state).response_delay = delay;
    }

    /// Make an address stop responding
    pub fn set_silent(&self, address: ObjectAddress) {
        lock(&self.state).silent.insert(address);
    }

    /// Make a silent address respond again
    pub fn clear_silent(&self, address: ObjectAddress) {
        lock(&self.state).silent.remove(&address);
    }

    /// Fail the next resolved operation with the given error
    pub fn inject_fault(&self, error: TransferError) {
        lock(&self.state).pending_faults.push_back(error);
    }

    /// Whether the port is open
    pub fn is_port_open(&self) -> bool {
        lock(&self.state).port_open
    }

    /// Whether the session is up
    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    /// Number of operations the transport has begun
    pub fn ops_begun(&self) -> u64 {
        lock(&self.state).ops_begun
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> ObjectAddress {
        ObjectAddress::new(1, 0x2000, 0x01).unwrap()
    }

    fn upload(size: usize) -> OpRequest {
        OpRequest {
            address: addr(),
            direction: Direction::Upload,
            data: Vec::new(),
            size,
        }
    }

    fn connect(transport: &mut MockTransport) {
        transport.open_port(&PortConfig::default()).unwrap();
        transport.create_session().unwrap();
    }

    #[test]
    fn test_session_requires_open_port() {
        let mut transport = MockTransport::new();
        assert!(transport.create_session().is_err());
        transport.open_port(&PortConfig::default()).unwrap();
        assert!(transport.create_session().is_ok());
        assert!(transport.is_connected());

        transport.close_port();
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_upload_reads_dictionary() {
        let mut transport = MockTransport::new().with_object(addr(), &[1, 2, 3, 4]);
        let mock = transport.controller();
        connect(&mut transport);

        transport.begin(&upload(4)).unwrap();
        assert_eq!(transport.poll().unwrap(), OpPoll::Complete(vec![1, 2, 3, 4]));
        assert_eq!(mock.ops_begun(), 1);
    }

    #[test]
    fn test_upload_unknown_object_is_protocol_error() {
        let mut transport = MockTransport::new();
        connect(&mut transport);

        transport.begin(&upload(4)).unwrap();
        assert!(matches!(
            transport.poll(),
            Err(TransferError::Protocol(_))
        ));
    }

    #[test]
    fn test_oversized_upload_is_protocol_error() {
        let mut transport = MockTransport::new().with_object(addr(), &[1, 2]);
        connect(&mut transport);

        transport.begin(&upload(4)).unwrap();
        assert!(matches!(transport.poll(), Err(TransferError::Protocol(_))));
    }

    #[test]
    fn test_download_updates_dictionary() {
        let mut transport = MockTransport::new().with_object(addr(), &[0u8; 4]);
        let mock = transport.controller();
        connect(&mut transport);

        let request = OpRequest {
            address: addr(),
            direction: Direction::Download,
            data: vec![9, 8, 7, 6],
            size: 4,
        };
        transport.begin(&request).unwrap();
        assert_eq!(transport.poll().unwrap(), OpPoll::Complete(Vec::new()));
        assert_eq!(mock.object(addr()).unwrap(), vec![9, 8, 7, 6]);
    }

    #[test]
    fn test_response_delay_keeps_operation_pending() {
        let mut transport = MockTransport::new()
            .with_object(addr(), &[1, 2, 3, 4])
            .with_response_delay(Duration::from_millis(50));
        connect(&mut transport);

        transport.begin(&upload(4)).unwrap();
        assert_eq!(transport.poll().unwrap(), OpPoll::Pending);
        std::thread::sleep(Duration::from_millis(60));
        assert!(matches!(transport.poll().unwrap(), OpPoll::Complete(_)));
    }

    #[test]
    fn test_silent_address_never_responds() {
        let mut transport = MockTransport::new().with_object(addr(), &[1, 2, 3, 4]);
        let mock = transport.controller();
        mock.set_silent(addr());
        connect(&mut transport);

        transport.begin(&upload(4)).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(transport.poll().unwrap(), OpPoll::Pending);

        mock.clear_silent(addr());
        assert!(matches!(transport.poll().unwrap(), OpPoll::Complete(_)));
    }

    #[test]
    fn test_injected_fault_fails_next_operation() {
        let mut transport = MockTransport::new().with_object(addr(), &[1, 2, 3, 4]);
        let mock = transport.controller();
        connect(&mut transport);

        mock.inject_fault(TransferError::Transport("port glitch".to_string()));
        transport.begin(&upload(4)).unwrap();
        assert_eq!(
            transport.poll(),
            Err(TransferError::Transport("port glitch".to_string()))
        );

        // The next operation succeeds again
        transport.begin(&upload(4)).unwrap();
        assert!(matches!(transport.poll().unwrap(), OpPoll::Complete(_)));
    }

    #[test]
    fn test_abort_clears_in_flight() {
        let mut transport = MockTransport::new().with_object(addr(), &[1, 2, 3, 4]);
        connect(&mut transport);

        transport.begin(&upload(4)).unwrap();
        transport.abort();
        assert!(transport.poll().is_err());
    }
}
