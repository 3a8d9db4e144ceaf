//! Runs short script snippets in a private working directory and reports
//! what they printed, returned, drew and wrote as one JSON envelope.

pub mod artifacts;
pub mod bindings;
pub mod config;
pub mod normalize;
pub mod response;
pub mod sandbox;
pub mod tools;

pub use response::{respond, ExecutionResult};
pub use sandbox::{ExecutionHost, ExecutionRequest};

/// Run one request with the default host: every compiled-in library and
/// the default image budgets.
pub fn run_snippet(request: &ExecutionRequest) -> ExecutionResult {
    respond(&ExecutionHost::default(), request)
}
