//! HTTP handlers.

pub mod devices;
pub mod secrets;
