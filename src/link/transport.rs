//! CanTransport trait for the bus adapter boundary
//!
//! This module defines the interface between the link scheduler and whatever
//! actually moves SDO requests over the wire: a serial-to-CAN adapter in
//! production, or [`MockTransport`](super::MockTransport) in tests.
//!
//! Bus framing is deliberately below this boundary. The unit of exchange is
//! one [`OpRequest`]: address, direction, payload and size. The scheduler
//! guarantees at most one operation is begun at a time and owns the timeout;
//! the transport only reports progress through [`CanTransport::poll`].

use crate::config::PortConfig;
use crate::error::Result;
use crate::transfer::TransferError;
use crate::types::{Direction, ObjectAddress};

/// One operation handed to the transport
#[derive(Debug, Clone)]
pub struct OpRequest {
    /// Addressed object
    pub address: ObjectAddress,
    /// Upload or download
    pub direction: Direction,
    /// Bytes to send for a download; empty for uploads
    pub data: Vec<u8>,
    /// Number of bytes to exchange
    pub size: usize,
}

/// Progress of the in-flight operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpPoll {
    /// No response yet
    Pending,
    /// Exchange finished; the response payload (empty for downloads)
    Complete(Vec<u8>),
}

/// Interface to the physical bus adapter
///
/// Implementations must be `Send`: the scheduler owns the transport on its
/// worker thread. At most one operation is ever begun before the previous
/// one completed, was aborted or failed.
pub trait CanTransport: Send {
    /// Open the serial port to the adapter
    fn open_port(&mut self, config: &PortConfig) -> Result<()>;

    /// Close the serial port
    fn close_port(&mut self);

    /// Bring up the CANopen session on the open port
    fn create_session(&mut self) -> Result<()>;

    /// Tear down the CANopen session
    fn destroy_session(&mut self);

    /// Whether a session is up
    fn is_connected(&self) -> bool;

    /// Dispatch an operation onto the wire
    fn begin(&mut self, request: &OpRequest) -> std::result::Result<(), TransferError>;

    /// Poll the in-flight operation for a response
    fn poll(&mut self) -> std::result::Result<OpPoll, TransferError>;

    /// Abort the in-flight operation, if any
    fn abort(&mut self);
}

/// Statistics for link operations
///
/// Tracks outcome counts, throughput and timing for the operations the
/// scheduler has completed. The queue fields are filled in at snapshot time.
#[derive(Debug, Clone, Default)]
pub struct LinkStats {
    /// Operations that completed successfully
    pub successful_ops: u64,
    /// Operations that failed (timeout, transport or protocol)
    pub failed_ops: u64,
    /// Operations that terminated by cancellation
    pub cancelled_ops: u64,
    /// Of the failed operations, how many timed out
    pub timeouts: u64,
    /// Total bytes exchanged by successful operations
    pub bytes_transferred: u64,
    /// Total wire time of successful operations in microseconds
    pub total_op_time_us: u64,
    /// Wire time of the last successful operation in microseconds
    pub last_op_time_us: u64,
    /// Operations waiting in the queue at snapshot time
    pub queued_ops: u64,
    /// Operations on the wire at snapshot time (0 or 1)
    pub in_flight_ops: u64,
}

impl LinkStats {
    /// Average wire time of successful operations in microseconds
    pub fn avg_op_time_us(&self) -> f64 {
        if self.successful_ops == 0 {
            0.0
        } else {
            self.total_op_time_us as f64 / self.successful_ops as f64
        }
    }

    /// Success rate as a percentage, ignoring cancellations
    pub fn success_rate(&self) -> f64 {
        let total = self.successful_ops + self.failed_ops;
        if total == 0 {
            100.0
        } else {
            (self.successful_ops as f64 / total as f64) * 100.0
        }
    }

    /// Record a successful operation
    pub fn record_success(&mut self, time_us: u64, bytes: u64) {
        self.successful_ops += 1;
        self.total_op_time_us += time_us;
        self.last_op_time_us = time_us;
        self.bytes_transferred += bytes;
    }

    /// Record a terminal failure
    pub fn record_failure(&mut self, error: &TransferError) {
        match error {
            TransferError::Cancelled => self.cancelled_ops += 1,
            TransferError::Timeout => {
                self.failed_ops += 1;
                self.timeouts += 1;
            }
            TransferError::Transport(_) | TransferError::Protocol(_) => self.failed_ops += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_success_rate() {
        let mut stats = LinkStats::default();
        assert_eq!(stats.success_rate(), 100.0);

        stats.record_success(120, 4);
        stats.record_success(80, 4);
        stats.record_failure(&TransferError::Timeout);
        assert_eq!(stats.successful_ops, 2);
        assert_eq!(stats.failed_ops, 1);
        assert_eq!(stats.timeouts, 1);
        assert!((stats.success_rate() - 66.666).abs() < 0.01);
        assert_eq!(stats.avg_op_time_us(), 100.0);
        assert_eq!(stats.bytes_transferred, 8);
    }

    #[test]
    fn test_cancellations_are_not_failures() {
        let mut stats = LinkStats::default();
        stats.record_failure(&TransferError::Cancelled);
        assert_eq!(stats.cancelled_ops, 1);
        assert_eq!(stats.failed_ops, 0);
        assert_eq!(stats.success_rate(), 100.0);
    }
}
