//! SteamCM Test & Validation Infrastructure
//!
//! Mock CM servers (TCP with the channel handshake, and WebSocket), end-to-end tests of the
//! connection core and the client facade, and property-based tests of the wire layer.

pub mod harness;
pub mod proptest_transport;

pub use harness::{
    init_tracing, local_client_config, pump_until, test_universe_key, test_universe_public_key,
    CallbackRecorder, Handshake, MockCmServer, MockSession, MockWsServer, TestEnv,
};
