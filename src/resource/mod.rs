// src/resource/mod.rs

//! Ant registry and task-to-ant allocation.

pub mod manager;
pub mod registration;

pub use manager::ResourceManager;
pub use registration::{AntAllocation, AntRegistration, AntReservation};
