//! Ports for services the engine consumes but does not implement.

pub mod hash;
