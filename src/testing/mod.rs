//! Testing utilities and mock implementations
//!
//! This module provides mock implementations for exercising the cloud
//! connection without an MQTT broker.

pub mod mocks;

pub use mocks::*;
