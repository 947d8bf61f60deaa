//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

use std::sync::Once;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use canvis_rs::config::AppConfig;
use canvis_rs::link::{CanLink, LinkHandle, MockController, MockTransport};
use canvis_rs::types::ObjectAddress;

static TRACING: Once = Once::new();

/// Initialize test logging once; scope with RUST_LOG as usual
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Generous deadline for waiting on worker-thread effects
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// Build an address, panicking on invalid test input
pub fn addr(node_id: u8, index: u16, sub_index: u8) -> ObjectAddress {
    ObjectAddress::new(node_id, index, sub_index).expect("valid test address")
}

/// A spawned link worker over a mock transport
pub struct TestLink {
    pub handle: LinkHandle,
    pub mock: MockController,
    worker: JoinHandle<()>,
}

impl TestLink {
    /// Stop the worker and wait for it to exit
    pub fn shutdown(self) {
        self.handle.shutdown();
        self.worker.join().expect("link worker exits cleanly");
    }
}

/// Spawn a link worker over a fresh mock transport
pub fn spawn_link() -> TestLink {
    init_tracing();
    let transport = MockTransport::new();
    let mock = transport.controller();
    let (worker, handle) = CanLink::spawn(Box::new(transport));
    TestLink {
        handle,
        mock,
        worker,
    }
}

/// Spawn a link worker and bring the session up
pub fn spawn_connected_link() -> TestLink {
    let link = spawn_link();
    link.handle
        .connect(&AppConfig::default().port)
        .expect("mock link connects");
    link
}

/// Poll a condition until it holds or the deadline passes
pub fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}
