// tests/property/main.rs

#[path = "../common/mod.rs"]
mod common;

mod capacity;
mod durations;
mod graph_walk;
