//! Ferrous Forward Application Layer
//!
//! Ports that transports and composites implement, plus the use cases that
//! only depend on those ports.

pub mod ports;
pub mod use_cases;
