//! Monitor check engine: schedules probes against monitored targets, records
//! results, drives incidents through their lifecycle and dispatches alerts.

pub mod alerting;
pub mod db;
pub mod monitoring;
pub mod notifications;
pub mod scheduler;
pub mod server;
pub mod web;
