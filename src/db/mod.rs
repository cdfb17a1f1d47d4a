pub mod enums;
pub mod memory;
pub mod models;
pub mod repository;
pub mod services;
