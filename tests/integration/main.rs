// tests/integration/main.rs

#[path = "../common/mod.rs"]
mod common;

mod config_files;
mod job_definitions;
mod local_ant;
mod runtime_fake_ant;
