//! The check pipeline: probing, first-contact validation, failure
//! classification, per-monitor locking and the coordinator that runs a cycle.

pub mod classify;
pub mod coordinator;
pub mod lock;
pub mod probe;
pub mod tls;
pub mod validation;
