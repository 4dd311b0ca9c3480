#![allow(clippy::too_many_arguments)]

// Declare the modules that form the library's public API (or internal structure).
// The binaries pull these in via `use docflow::module_name;`.
pub mod backend;
pub mod config;
pub mod data_model;
pub mod error;
pub mod executor;
pub mod idempotency;
pub mod notify;
pub mod quota;
pub mod review;
pub mod router;
pub mod server;
pub mod state;
pub mod timeout;
pub mod utils;
pub mod worker_logic;

pub use error::{PipelineError, Result};
