//! Domain layer - pool descriptors and the ports the builder depends on
//!
//! Host adapters in [`crate::hardware`] and the SPDK service in
//! [`crate::spdk`] implement these traits; tests substitute fakes.

pub mod ports;

pub use ports::*;
