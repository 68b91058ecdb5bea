// src/types/mod.rs

//! Shared vocabulary used by every other module: lifecycle states, task
//! methods, error codes and durations.

pub mod duration;
pub mod error_code;
pub mod method;
pub mod state;

pub use duration::parse_duration;
pub use error_code::{Classification, ErrorClassifier, ErrorCodeAction, ErrorCodeRule};
pub use method::TaskMethod;
pub use state::{RequestState, StateGroup};
