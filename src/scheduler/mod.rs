//! Job queue, the periodic sweep that feeds it and the worker pools that drain it.

pub mod queue;
pub mod service;
pub mod worker;
