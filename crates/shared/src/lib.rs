//! Helpdesk Shared Types
//!
//! Domain projections shared between the helpdesk services and the
//! realtime delivery layer.

pub mod types;

pub use types::*;
