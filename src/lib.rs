//! # canvis-rs: CANopen SDO live-value core
//!
//! A library for reading and writing typed parameters on remote
//! microcontroller nodes over a shared serial-to-CAN link, and for polling a
//! working set of such parameters periodically for display. The architecture
//! separates the link worker (which owns the bus adapter) from the observers
//! that consume values, communicating through crossbeam channels.
//!
//! ## Architecture
//!
//! - **Link**: [`link::CanLink`] owns the bus adapter on a worker thread and
//!   serializes SDO operations onto it, one at a time, FIFO
//! - **Transfers**: [`transfer::SdoTransfer`] is one read/write of one remote
//!   object, with its own buffer, timeout and exactly-once completion events
//! - **Registry**: [`registry::ValueRegistry`] deduplicates identical read
//!   requests from many observers and refreshes all held values on a fixed
//!   interval while the link is connected
//! - **Codec**: [`types::CoValueType`] converts raw little-endian buffers to
//!   and from numbers, including iq24/iq15/iq7 fixed point
//!
//! ## Example
//!
//! ```ignore
//! use canvis_rs::config::AppConfig;
//! use canvis_rs::link::{CanLink, MockTransport};
//! use canvis_rs::registry::ValueRegistry;
//! use canvis_rs::types::{CoValueType, ObjectAddress};
//!
//! let config = AppConfig::default();
//! let (worker, handle) = CanLink::spawn(Box::new(MockTransport::new()));
//!
//! handle.connect(&config.port)?;
//!
//! let registry = ValueRegistry::new(handle.clone(), &config);
//! let speed = registry.add_value(
//!     ObjectAddress::new(1, 0x2000, 0x01)?,
//!     CoValueType::Iq15,
//! )?;
//!
//! // Values refresh on the configured interval; sample on UpdateBegin
//! let cycles = registry.subscribe();
//! while cycles.recv().is_ok() {
//!     println!("speed = {:.3}", speed.value().unwrap_or(0.0));
//! }
//! # Ok::<(), canvis_rs::CanVisError>(())
//! ```

pub mod config;
pub mod error;
pub mod link;
pub mod registry;
pub mod transfer;
pub mod types;

// Re-export commonly used types
pub use config::{AppConfig, Parity, PortConfig, RegistryConfig, SdoConfig, StopBits};
pub use error::{CanVisError, Result};
pub use link::{CanLink, CanTransport, LinkEvent, LinkHandle, LinkStats, MockTransport};
pub use registry::{HeldValue, RegistryEvent, ValueRegistry};
pub use transfer::{SdoTransfer, TransferError, TransferEvent, TransferState};
pub use types::{CoValueType, Direction, ObjectAddress, Scalar};
