use super::{Tool, ToolError};
use crate::config::Config;
use crate::response::respond;
use crate::sandbox::{ExecutionHost, ExecutionRequest};
use serde_json::json;
use std::path::PathBuf;

/// Runs a snippet and answers with the JSON result envelope. Snippet
/// faults are reported inside the envelope, not as tool errors.
pub struct EvalScriptTool {
    host: ExecutionHost,
    output_base_dir: Option<PathBuf>,
}

impl EvalScriptTool {
    pub fn new(host: ExecutionHost, output_base_dir: Option<PathBuf>) -> Self {
        Self {
            host,
            output_base_dir,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(ExecutionHost::from_config(config), config.output_base_dir())
    }
}

impl Tool for EvalScriptTool {
    fn name(&self) -> &str {
        "eval_script"
    }

    fn description(&self) -> &str {
        "Run a Rhai script in a private working directory. Set `result` to return a value, \
         set `image`/`images` or save image files to return pictures, and write other files \
         to the working directory to have them kept. Modules: os, re, json, time, datetime, \
         random, math, plus np, pd, Image and plt when available."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "The script to run; markdown code fences are accepted"
                },
                "output_path": {
                    "type": "string",
                    "description": "Optional file or directory that receives non-image files the script writes"
                }
            },
            "required": ["code"]
        })
    }

    fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let code = args["code"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("missing 'code' argument".to_string()))?;

        let mut request = ExecutionRequest::new(code);
        match &args["output_path"] {
            serde_json::Value::Null => {}
            serde_json::Value::String(path) => request = request.with_output_path(path.as_str()),
            other => {
                return Err(ToolError::InvalidArguments(format!(
                    "'output_path' must be a string, got {}",
                    other
                )))
            }
        }
        if let Some(dir) = &self.output_base_dir {
            request = request.with_output_base_dir(dir.clone());
        }

        Ok(respond(&self.host, &request).to_json_string(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn run(args: Value) -> Value {
        let tool = EvalScriptTool::from_config(&Config::default());
        serde_json::from_str(&tool.execute(args).unwrap()).unwrap()
    }

    #[test]
    fn test_success_envelope() {
        let envelope = run(json!({"code": "```rhai\nprint(\"hello\");\nresult = [1, 2];\n```"}));
        assert!(envelope["error_message"].is_null());
        assert_eq!(envelope["stdout"], "hello\n");
        assert_eq!(envelope["result"], json!([1, 2]));
        assert_eq!(envelope["images"], json!([]));
        assert_eq!(envelope["files"], json!([]));
    }

    #[test]
    fn test_fault_is_reported_in_envelope() {
        let envelope = run(json!({"code": "throw \"bad input\";"}));
        assert!(envelope["error_message"].as_str().unwrap().contains("bad input"));
        assert!(envelope["result"].is_null());
    }

    #[test]
    fn test_missing_code_argument() {
        let tool = EvalScriptTool::from_config(&Config::default());
        let err = tool.execute(json!({"output_path": "x"})).unwrap_err();
        assert!(err.to_string().contains("code"));
    }

    #[test]
    fn test_output_path_must_be_string() {
        let tool = EvalScriptTool::from_config(&Config::default());
        assert!(tool.execute(json!({"code": "1", "output_path": 5})).is_err());
    }

    #[test]
    fn test_output_path_receives_file() {
        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("report.txt");
        let envelope = run(json!({
            "code": "os::write_text(\"report.txt\", \"done\");",
            "output_path": dest.to_string_lossy(),
        }));
        assert_eq!(envelope["files"][0]["name"], "report.txt");
        assert_eq!(std::fs::read_to_string(dest).unwrap(), "done");
    }
}
