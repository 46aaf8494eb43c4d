//! Fixtures for testing the connection manager: a small static subnet, contexts that are
//!  driven by hand, and a loopback pair of complete connection managers.

pub mod fabric;
pub mod loopback;
