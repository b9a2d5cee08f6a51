//! tests/common/harness.rs
#![allow(dead_code)]

use pq_reactor::{
    reactor::ManualReactor,
    testing::MockServer,
    Client, ConnectParams, Deferred, Error, Result,
};
use std::{rc::Rc, sync::Once};
use tracing_subscriber::fmt::format::FmtSpan;

/// Initializes tracing for tests, ensuring it's only done once.
pub fn init_tracing() {
    static TRACING_INIT: Once = Once::new();
    TRACING_INIT.call_once(|| {
        let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "pq_reactor=debug".to_string());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_span_events(FmtSpan::CLOSE)
            .with_test_writer()
            .init();
    });
}

/// A mock server, a manual reactor and one connected client.
pub struct TestHarness {
    pub reactor: Rc<ManualReactor>,
    pub server: Rc<MockServer>,
    pub client: Client,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_params(ConnectParams::new())
    }

    pub fn with_params(params: ConnectParams) -> Self {
        init_tracing();
        let reactor = ManualReactor::new();
        let server = MockServer::new();
        let client = connect(&reactor, &server, params);
        Self {
            reactor,
            server,
            client,
        }
    }

    /// Opens another client against the same server and reactor.
    pub fn another_client(&self, params: ConnectParams) -> Client {
        connect(&self.reactor, &self.server, params)
    }

    pub fn settle<T: Clone + 'static>(&self, deferred: &Deferred<T>) -> Result<T> {
        settle(&self.reactor, deferred)
    }
}

pub fn connect(reactor: &Rc<ManualReactor>, server: &Rc<MockServer>, params: ConnectParams) -> Client {
    let pending = Client::builder(reactor.clone(), server.connector())
        .params(params)
        .connect_async();
    settle(reactor, &pending).expect("mock connect should succeed")
}

/// Turns the reactor until `deferred` settles and returns its outcome.
pub fn settle<T: Clone + 'static>(reactor: &ManualReactor, deferred: &Deferred<T>) -> Result<T> {
    reactor.run_until(|| !deferred.is_pending());
    deferred
        .result()
        .unwrap_or_else(|| Err(Error::custom("deferred never settled")))
}
