//! The execution host: stages a private working directory, runs one
//! snippet against a fresh namespace and harvests what it produced.
//!
//! Nothing here touches process-wide state. The snippet's working
//! directory and its figures are threaded through the bindings explicitly,
//! so independent requests may run concurrently on different threads.

pub mod namespace;
pub mod stdlib;

use crate::artifacts::collector::SelectionPolicy;
use crate::artifacts::persist::{persist, resolve_output_path};
use crate::artifacts::{ImageCandidate, PersistedFile};
use crate::bindings::Capabilities;
use crate::config::Config;
use crate::normalize::{normalize_code, NormalizeError};
use crate::response::dynamic_to_json;
use namespace::{Namespace, NamespaceSettings};
use serde::Deserialize;
use std::any::Any;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::rc::Rc;
use thiserror::Error;

/// Prefix of every private working directory.
pub const WORKDIR_PREFIX: &str = "runlet_";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    #[serde(default)]
    pub output_base_dir: Option<PathBuf>,
    #[serde(default)]
    pub output_path: Option<String>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Self::default()
        }
    }

    pub fn with_output_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_base_dir = Some(dir.into());
        self
    }

    pub fn with_output_path(mut self, path: impl Into<String>) -> Self {
        self.output_path = Some(path.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("invalid request: {0}")]
    Validation(#[from] NormalizeError),
    #[error("failed to prepare working directory: {0}")]
    Workspace(#[from] std::io::Error),
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Accumulates what a snippet prints, in order.
#[derive(Debug, Clone, Default)]
pub struct Console {
    stdout: Rc<RefCell<String>>,
    stderr: Rc<RefCell<String>>,
}

impl Console {
    pub fn out(&self, text: &str) {
        let mut buffer = self.stdout.borrow_mut();
        buffer.push_str(text);
        buffer.push('\n');
    }

    pub fn err(&self, text: &str) {
        let mut buffer = self.stderr.borrow_mut();
        buffer.push_str(text);
        buffer.push('\n');
    }

    pub fn snapshot(&self) -> (String, String) {
        (self.stdout.borrow().clone(), self.stderr.borrow().clone())
    }
}

/// What a successful run hands back.
#[derive(Debug)]
pub struct Harvest {
    pub result: serde_json::Value,
    pub images: Vec<ImageCandidate>,
    pub files: Vec<PersistedFile>,
}

/// Console output is reported whether or not the run succeeded.
#[derive(Debug)]
pub struct Execution {
    pub stdout: String,
    pub stderr: String,
    pub outcome: Result<Harvest, HostError>,
}

#[derive(Debug, Clone)]
pub struct ExecutionHost {
    caps: Capabilities,
    policy: SelectionPolicy,
}

impl Default for ExecutionHost {
    fn default() -> Self {
        Self::new(Capabilities::detect(), SelectionPolicy::default())
    }
}

impl ExecutionHost {
    pub fn new(caps: Capabilities, policy: SelectionPolicy) -> Self {
        Self { caps, policy }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Capabilities::detect().restrict(&config.libraries),
            SelectionPolicy::from_limits(&config.limits),
        )
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    pub fn execute(&self, request: &ExecutionRequest) -> Execution {
        let console = Console::default();
        let outcome = guarded(|| self.run(request, &console));
        let (stdout, stderr) = console.snapshot();
        Execution {
            stdout,
            stderr,
            outcome,
        }
    }

    fn run(&self, request: &ExecutionRequest, console: &Console) -> Result<Harvest, HostError> {
        let code = normalize_code(&request.code)?;
        let workdir = tempfile::Builder::new().prefix(WORKDIR_PREFIX).tempdir()?;
        tracing::debug!(workdir = %workdir.path().display(), "working directory created");

        let output_path = resolve_output_path(
            request.output_path.as_deref(),
            request.output_base_dir.as_deref(),
            workdir.path(),
        );
        let settings = NamespaceSettings {
            workdir: workdir.path().to_path_buf(),
            caller_dir: std::env::current_dir().unwrap_or_default(),
            output_path: output_path.clone(),
            caps: self.caps,
        };
        let mut namespace = Namespace::new(settings, console);
        namespace.execute(&code)?;

        let result = dynamic_to_json(&namespace.result());
        let images = namespace.collect_images(&self.policy);
        let files = persist(
            workdir.path(),
            output_path.as_deref(),
            request.output_base_dir.as_deref(),
        );
        drop(namespace);

        let path = workdir.path().to_path_buf();
        if let Err(e) = workdir.close() {
            tracing::warn!(workdir = %path.display(), error = %e, "failed to remove working directory");
        }
        Ok(Harvest {
            result,
            images,
            files,
        })
    }
}

/// Runs `f`, turning a panic into a runtime fault so a response can still
/// be built from whatever the console captured.
fn guarded<F>(f: F) -> Result<Harvest, HostError>
where
    F: FnOnce() -> Result<Harvest, HostError>,
{
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        tracing::error!(panic = %message, "execution panicked");
        Err(HostError::Runtime(format!("internal panic: {message}")))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_becomes_runtime_fault_with_console() {
        let console = Console::default();
        let outcome = guarded(|| {
            console.out("before");
            panic!("boom {}", 7);
        });
        match outcome {
            Err(HostError::Runtime(message)) => assert!(message.contains("boom 7")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(console.snapshot().0, "before\n");
    }

    #[cfg(feature = "array")]
    #[test]
    fn test_oversized_array_still_yields_envelope() {
        let execution = ExecutionHost::default().execute(&ExecutionRequest::new(
            "print(\"start\"); let a = np::arange(0, 1e300, 1e-300);",
        ));
        assert!(matches!(execution.outcome, Err(HostError::Runtime(_))));
        assert_eq!(execution.stdout, "start\n");
    }

    #[test]
    fn test_console_keeps_order() {
        let console = Console::default();
        console.out("one");
        console.err("warn");
        console.out("two");
        assert_eq!(console.snapshot(), ("one\ntwo\n".to_string(), "warn\n".to_string()));
    }

    #[test]
    fn test_empty_code_is_validation_error() {
        let execution = ExecutionHost::default().execute(&ExecutionRequest::new("```\n```"));
        assert!(matches!(execution.outcome, Err(HostError::Validation(_))));
        assert!(execution.stdout.is_empty());
    }

    #[test]
    fn test_result_and_console_captured() {
        let execution = ExecutionHost::default()
            .execute(&ExecutionRequest::new("print(\"hi\"); eprint(\"careful\"); result = 6 * 7;"));
        let harvest = execution.outcome.unwrap();
        assert_eq!(harvest.result, serde_json::json!(42));
        assert_eq!(execution.stdout, "hi\n");
        assert_eq!(execution.stderr, "careful\n");
    }

    #[test]
    fn test_workdir_is_removed_after_run() {
        let execution = ExecutionHost::default().execute(&ExecutionRequest::new(
            "os::write_text(\"a.txt\", \"x\"); result = WORKDIR;",
        ));
        let harvest = execution.outcome.unwrap();
        let workdir = PathBuf::from(harvest.result.as_str().unwrap());
        assert!(workdir
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(WORKDIR_PREFIX));
        assert!(!workdir.exists());
    }

    #[test]
    fn test_workdir_is_removed_after_fault() {
        let execution = ExecutionHost::default().execute(&ExecutionRequest::new(
            "print(WORKDIR); throw \"stop\";",
        ));
        assert!(matches!(execution.outcome, Err(HostError::Runtime(_))));
        let workdir = PathBuf::from(execution.stdout.trim());
        assert!(!workdir.exists());
    }

    #[test]
    fn test_request_deserializes_with_optional_fields() {
        let request: ExecutionRequest = serde_json::from_str(r#"{"code": "result = 1"}"#).unwrap();
        assert_eq!(request, ExecutionRequest::new("result = 1"));
    }
}
