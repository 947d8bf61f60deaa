//! Link worker loop: FIFO queue, single-flight dispatch, timeout, cancel
//!
//! This module contains the loop that runs on the link worker thread and
//! owns the bus adapter. It accepts operations from any number of transfers,
//! serializes them in arrival order and keeps at most one on the wire,
//! reflecting the single-request nature of the underlying master/slave
//! service.
//!
//! # Responsibilities
//!
//! - **Command processing**: port and session control, submit, cancel, stats
//! - **Dispatch**: snapshot the front operation and begin it on the transport
//! - **Timeout**: fail the in-flight operation when its deadline passes
//! - **Disconnect**: cancel every queued and in-flight operation, drain the
//!   queue and report the link disconnected
//! - **Fault isolation**: a transport fault fails only the operation on the
//!   wire; the scheduler keeps accepting work and reports consecutive faults
//!   so a higher layer can decide to disconnect
//!
//! The worker interleaves transport polling with command processing in short
//! slices, so cancellation and disconnect stay responsive while an operation
//! waits for its response.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::transfer::{self, TransferError};
use crate::types::{Direction, ObjectAddress};

use super::transport::{CanTransport, LinkStats, OpPoll, OpRequest};
use super::{LinkCommand, LinkEvent, LinkShared, Operation};

/// Command wait while an operation is on the wire or queued
const POLL_SLICE: Duration = Duration::from_millis(1);
/// Command wait while the link is idle
const IDLE_SLICE: Duration = Duration::from_millis(20);

struct InFlight {
    op: Operation,
    address: ObjectAddress,
    direction: Direction,
    size: usize,
    deadline: Instant,
    started: Instant,
}

/// The transport/queue worker for one physical link
pub struct LinkScheduler {
    transport: Box<dyn CanTransport>,
    command_rx: Receiver<LinkCommand>,
    shared: Arc<LinkShared>,
    queue: VecDeque<Operation>,
    in_flight: Option<InFlight>,
    stats: LinkStats,
    consecutive_faults: u32,
    running: bool,
}

impl LinkScheduler {
    pub(crate) fn new(
        transport: Box<dyn CanTransport>,
        command_rx: Receiver<LinkCommand>,
        shared: Arc<LinkShared>,
    ) -> Self {
        Self {
            transport,
            command_rx,
            shared,
            queue: VecDeque::new(),
            in_flight: None,
            stats: LinkStats::default(),
            consecutive_faults: 0,
            running: true,
        }
    }

    /// Run the worker loop until shutdown
    pub fn run(mut self) {
        tracing::info!("link worker started");

        while self.running {
            let wait = if self.in_flight.is_some() || !self.queue.is_empty() {
                POLL_SLICE
            } else {
                IDLE_SLICE
            };
            match self.command_rx.recv_timeout(wait) {
                Ok(cmd) => {
                    self.handle_command(cmd);
                    while let Ok(cmd) = self.command_rx.try_recv() {
                        self.handle_command(cmd);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => self.running = false,
            }
            if self.running {
                self.advance();
            }
        }

        self.drop_session();
        self.transport.close_port();
        tracing::info!("link worker stopped");
    }

    fn handle_command(&mut self, cmd: LinkCommand) {
        match cmd {
            LinkCommand::OpenPort { config, reply } => {
                let result = self.transport.open_port(&config);
                if let Err(e) = &result {
                    tracing::error!("failed to open port {}: {}", config.name, e);
                }
                let _ = reply.send(result);
            }
            LinkCommand::ClosePort => {
                self.drop_session();
                self.transport.close_port();
            }
            LinkCommand::CreateSession { reply } => {
                let result = self.transport.create_session();
                if result.is_ok() && !self.shared.is_connected() {
                    self.shared.set_connected(true);
                    self.shared.emit(LinkEvent::Connected);
                    tracing::info!("link connected");
                }
                let _ = reply.send(result);
            }
            LinkCommand::DestroySession => {
                self.drop_session();
            }
            LinkCommand::Submit(op) => self.submit(op),
            LinkCommand::Cancel { shared, seq } => self.cancel(&shared, seq),
            LinkCommand::QueryStats { reply } => {
                let mut stats = self.stats.clone();
                stats.queued_ops = self.queue.len() as u64;
                stats.in_flight_ops = u64::from(self.in_flight.is_some());
                let _ = reply.send(stats);
            }
            LinkCommand::Shutdown => {
                self.running = false;
            }
        }
    }

    fn submit(&mut self, op: Operation) {
        if !self.shared.is_connected() {
            // Raced a disconnect; terminate it the way the disconnect would have
            self.complete(&op, Err(TransferError::Cancelled), None, None);
            return;
        }
        self.queue.push_back(op);
    }

    fn cancel(&mut self, shared: &Arc<crate::transfer::TransferShared>, seq: u64) {
        let in_flight_hit = self
            .in_flight
            .as_ref()
            .is_some_and(|f| Arc::ptr_eq(&f.op.shared, shared) && f.op.seq == seq);
        if in_flight_hit {
            self.transport.abort();
            if let Some(in_flight) = self.in_flight.take() {
                self.complete(&in_flight.op, Err(TransferError::Cancelled), None, None);
            }
            return;
        }
        if let Some(pos) = self
            .queue
            .iter()
            .position(|o| Arc::ptr_eq(&o.shared, shared) && o.seq == seq)
        {
            if let Some(op) = self.queue.remove(pos) {
                self.complete(&op, Err(TransferError::Cancelled), None, None);
            }
        }
        // Neither queued nor in flight: the operation already finished and
        // its terminal outcome has been delivered
    }

    /// Cancel everything and report the link disconnected
    fn drop_session(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            self.transport.abort();
            self.complete(&in_flight.op, Err(TransferError::Cancelled), None, None);
        }
        while let Some(op) = self.queue.pop_front() {
            self.complete(&op, Err(TransferError::Cancelled), None, None);
        }
        self.transport.destroy_session();
        if self.shared.is_connected() {
            self.shared.set_connected(false);
            self.shared.emit(LinkEvent::Disconnected);
            tracing::info!("link disconnected");
        }
    }

    fn advance(&mut self) {
        if self.in_flight.is_some() {
            self.poll_in_flight();
        }
        while self.in_flight.is_none() && self.shared.is_connected() {
            let Some(op) = self.queue.pop_front() else {
                break;
            };
            self.dispatch(op);
        }
    }

    fn poll_in_flight(&mut self) {
        let poll = self.transport.poll();
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };
        match poll {
            Ok(OpPoll::Pending) => {
                if Instant::now() >= in_flight.deadline {
                    self.transport.abort();
                    tracing::warn!("transfer for {} timed out", in_flight.address);
                    self.complete(&in_flight.op, Err(TransferError::Timeout), None, None);
                } else {
                    self.in_flight = Some(in_flight);
                }
            }
            Ok(OpPoll::Complete(payload)) => {
                let transferred = match in_flight.direction {
                    Direction::Upload => payload.len().min(in_flight.size),
                    Direction::Download => in_flight.size,
                };
                tracing::debug!(
                    "{} for {} completed, {} bytes",
                    in_flight.direction,
                    in_flight.address,
                    transferred
                );
                self.complete(
                    &in_flight.op,
                    Ok(transferred),
                    Some(payload),
                    Some(in_flight.started),
                );
            }
            Err(err) => {
                tracing::warn!("{} for {} failed: {}", in_flight.direction, in_flight.address, err);
                self.complete(&in_flight.op, Err(err), None, None);
            }
        }
    }

    fn dispatch(&mut self, op: Operation) {
        let Some(snapshot) = transfer::begin_snapshot(&op.shared, op.seq) else {
            // Finalized while queued (cancel or disconnect won the race)
            return;
        };
        let request = OpRequest {
            address: snapshot.address,
            direction: snapshot.direction,
            data: snapshot.data,
            size: snapshot.size,
        };
        tracing::trace!("dispatching {} for {}", request.direction, request.address);
        match self.transport.begin(&request) {
            Ok(()) => {
                let now = Instant::now();
                self.in_flight = Some(InFlight {
                    op,
                    address: request.address,
                    direction: request.direction,
                    size: request.size,
                    deadline: now + snapshot.timeout,
                    started: now,
                });
            }
            Err(err) => {
                tracing::warn!("dispatch for {} failed: {}", request.address, err);
                self.complete(&op, Err(err), None, None);
            }
        }
    }

    /// Deliver a terminal outcome and update the statistics
    fn complete(
        &mut self,
        op: &Operation,
        result: Result<usize, TransferError>,
        payload: Option<Vec<u8>>,
        started: Option<Instant>,
    ) {
        match &result {
            Ok(n) => {
                let elapsed_us = started
                    .map(|s| s.elapsed().as_micros() as u64)
                    .unwrap_or(0);
                self.stats.record_success(elapsed_us, *n as u64);
                self.consecutive_faults = 0;
            }
            Err(err) => {
                self.stats.record_failure(err);
                if matches!(err, TransferError::Transport(_)) {
                    self.consecutive_faults += 1;
                    self.shared.emit(LinkEvent::TransportFault {
                        consecutive: self.consecutive_faults,
                    });
                }
            }
        }
        transfer::finalize(&op.shared, op.seq, result, payload.as_deref());
    }
}
