//! The uniform result envelope returned for every request.

use crate::artifacts::{ImageCandidate, PersistedFile};
#[cfg(feature = "array")]
use crate::bindings::array::NdArray;
#[cfg(feature = "dataframe")]
use crate::bindings::dataframe::DataFrame;
#[cfg(feature = "imaging")]
use crate::bindings::imaging::ImageObj;
#[cfg(feature = "plotting")]
use crate::bindings::plot::Figure;
use crate::sandbox::{Execution, ExecutionHost, ExecutionRequest};
use rhai::{Dynamic, Map};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Every key is always present; `error_message` tells success from failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub error_message: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub result: Value,
    pub images: Vec<ImageCandidate>,
    pub files: Vec<PersistedFile>,
}

impl ExecutionResult {
    pub fn success(
        stdout: String,
        stderr: String,
        result: Value,
        images: Vec<ImageCandidate>,
        files: Vec<PersistedFile>,
    ) -> Self {
        Self {
            error_message: None,
            stdout,
            stderr,
            result,
            images,
            files,
        }
    }

    /// Partial console output is kept; everything else is emptied.
    pub fn failure(message: impl Into<String>, stdout: String, stderr: String) -> Self {
        Self {
            error_message: Some(message.into()),
            stdout,
            stderr,
            result: Value::Null,
            images: Vec::new(),
            files: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error_message.is_none()
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            json!({
                "error_message": format!("failed to serialize result: {e}"),
                "stdout": self.stdout,
                "stderr": self.stderr,
                "result": null,
                "images": [],
                "files": [],
            })
        })
    }

    pub fn to_json_string(&self, pretty: bool) -> String {
        let value = self.to_json();
        if pretty {
            serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
        } else {
            value.to_string()
        }
    }
}

impl From<Execution> for ExecutionResult {
    fn from(execution: Execution) -> Self {
        match execution.outcome {
            Ok(harvest) => Self::success(
                execution.stdout,
                execution.stderr,
                harvest.result,
                harvest.images,
                harvest.files,
            ),
            Err(e) => Self::failure(e.to_string(), execution.stdout, execution.stderr),
        }
    }
}

/// Run one request and wrap the outcome in the envelope.
pub fn respond(host: &ExecutionHost, request: &ExecutionRequest) -> ExecutionResult {
    let result = ExecutionResult::from(host.execute(request));
    match &result.error_message {
        None => tracing::info!(
            images = result.images.len(),
            files = result.files.len(),
            "snippet finished"
        ),
        Some(message) => tracing::info!(error = %message, "snippet failed"),
    }
    result
}

/// Convert a script value to JSON. Anything without a natural JSON form
/// is rendered as its display string, so conversion never fails.
pub fn dynamic_to_json(value: &Dynamic) -> Value {
    let value = value.flatten_clone();
    if value.is_unit() {
        return Value::Null;
    }
    if let Ok(b) = value.as_bool() {
        return Value::Bool(b);
    }
    if let Ok(i) = value.as_int() {
        return json!(i);
    }
    if let Ok(f) = value.as_float() {
        return serde_json::Number::from_f64(f).map_or_else(|| Value::String(f.to_string()), Value::Number);
    }
    if let Ok(c) = value.as_char() {
        return Value::String(c.to_string());
    }
    if value.is_string() {
        return Value::String(value.into_string().unwrap_or_default());
    }
    if value.is_array() {
        let items = value.into_array().unwrap_or_default();
        return Value::Array(items.iter().map(dynamic_to_json).collect());
    }
    if value.is_blob() {
        let bytes = value.into_blob().unwrap_or_default();
        return Value::Array(bytes.into_iter().map(|b| json!(b)).collect());
    }
    if let Some(map) = value.read_lock::<Map>() {
        return Value::Object(
            map.iter()
                .map(|(key, item)| (key.to_string(), dynamic_to_json(item)))
                .collect(),
        );
    }
    #[cfg(feature = "array")]
    if let Some(arr) = value.read_lock::<NdArray>() {
        return Value::String(arr.to_string());
    }
    #[cfg(feature = "dataframe")]
    if let Some(df) = value.read_lock::<DataFrame>() {
        return Value::String(df.to_string());
    }
    #[cfg(feature = "imaging")]
    if let Some(img) = value.read_lock::<ImageObj>() {
        return Value::String(img.to_string());
    }
    #[cfg(feature = "plotting")]
    if let Some(figure) = value.read_lock::<Figure>() {
        return Value::String(figure.to_string());
    }
    Value::String(value.to_string())
}
