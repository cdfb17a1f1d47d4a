//! Alert delivery: channel models, shared templates, per-channel senders and
//! the dispatcher that ties them to monitors.

pub mod encryption;
pub mod models;
pub mod senders;
pub mod service;
pub mod templates;
