use base64::Engine as _;
use runlet::artifacts::collector::SelectionPolicy;
use runlet::bindings::Capabilities;
use runlet::tools::default_registry;
use runlet::config::Config;
use runlet::{respond, run_snippet, ExecutionHost, ExecutionRequest};
use serde_json::json;
use std::path::PathBuf;

const PNG_SIGNATURE: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

#[test]
fn test_plain_result() {
    let result = run_snippet(&ExecutionRequest::new("result = 42"));
    assert!(result.is_success());
    assert_eq!(result.result, json!(42));
    assert!(result.images.is_empty());
    assert!(result.files.is_empty());

    let value = result.to_json();
    assert!(value["error_message"].is_null());
    for key in ["stdout", "stderr", "result", "images", "files"] {
        assert!(value.get(key).is_some(), "missing key {key}");
    }
}

#[test]
fn test_fault_keeps_partial_output() {
    let result = run_snippet(&ExecutionRequest::new(
        "print(\"partial\");\nlet x = 1 / 0;\nprint(\"unreachable\");",
    ));
    assert!(!result.is_success());
    assert!(result.error_message.as_deref().unwrap().starts_with("runtime error"));
    assert!(result.stdout.contains("partial"));
    assert!(!result.stdout.contains("unreachable"));
    assert_eq!(result.result, serde_json::Value::Null);
    assert!(result.images.is_empty());
}

#[cfg(feature = "imaging")]
#[test]
fn test_files_without_destination_are_not_persisted() {
    let code = r#"
        let img = Image::create("RGB", 4, 4, [255, 0, 0]);
        img.save("red.png");
        os::write_text("notes.txt", "hello");
    "#;
    let result = run_snippet(&ExecutionRequest::new(code));
    assert!(result.is_success(), "{:?}", result.error_message);
    assert_eq!(result.images.len(), 1);
    assert_eq!(result.images[0].format, "png");
    assert!(result.files.is_empty());
}

#[cfg(feature = "imaging")]
#[test]
fn test_explicit_output_path_copies_file() {
    let dest_root = tempfile::tempdir().unwrap();
    let dest = dest_root.path().join("report.txt");
    let code = r#"
        let img = Image::create("L", 2, 2);
        img.save("blank.png");
        os::write_text("report.txt", "numbers");
    "#;
    let request = ExecutionRequest::new(code).with_output_path(dest.display().to_string());
    let result = run_snippet(&request);
    assert!(result.is_success(), "{:?}", result.error_message);
    assert_eq!(result.images.len(), 1);
    assert_eq!(result.files.len(), 1);
    assert_eq!(result.files[0].name, "report.txt");
    assert_eq!(PathBuf::from(&result.files[0].path), dest);
    assert_eq!(std::fs::read_to_string(&dest).unwrap(), "numbers");
}

#[test]
fn test_base_dir_gets_unique_subdirectory() {
    let base = tempfile::tempdir().unwrap();
    let request = ExecutionRequest::new("os::write_text(\"a.csv\", \"x,y\\n1,2\\n\");")
        .with_output_base_dir(base.path());
    let result = run_snippet(&request);
    assert_eq!(result.files.len(), 1);
    let copied = PathBuf::from(&result.files[0].path);
    assert!(copied.starts_with(base.path()));
    assert_eq!(copied.file_name().unwrap(), "a.csv");
    assert_ne!(copied.parent().unwrap(), base.path());
}

#[test]
fn test_leading_return_becomes_result() {
    let result = run_snippet(&ExecutionRequest::new("return 1 + 1"));
    assert!(result.is_success(), "{:?}", result.error_message);
    assert_eq!(result.result, json!(2));
}

#[cfg(feature = "plotting")]
#[test]
fn test_saved_figure_and_open_figure_deduplicate() {
    let code = r#"
        plt::plot([1, 4, 9, 16]);
        plt::savefig("chart.png");
    "#;
    let result = run_snippet(&ExecutionRequest::new(code));
    assert!(result.is_success(), "{:?}", result.error_message);
    assert_eq!(result.images.len(), 1);
    assert_eq!(result.images[0].alt_text, "Plot 1");
    assert!(result.files.is_empty());
}

#[cfg(feature = "imaging")]
#[test]
fn test_image_payload_is_base64_png() {
    let result = run_snippet(&ExecutionRequest::new(
        "image = Image::create(\"RGBA\", 3, 2, [0, 0, 255, 128]);",
    ));
    assert_eq!(result.images.len(), 1);
    let candidate = &result.images[0];
    assert_eq!(candidate.alt_text, "Image");
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&candidate.data)
        .unwrap();
    assert!(bytes.starts_with(PNG_SIGNATURE));

    let value = result.to_json();
    assert_eq!(value["images"][0]["type"], "base64");
    assert_eq!(value["images"][0]["format"], "png");
    assert!(value["images"][0].get("size_bytes").is_none());
}

#[cfg(feature = "imaging")]
#[test]
fn test_image_count_budget() {
    let code = r#"
        images = [];
        for shade in [10, 20, 30, 40] {
            images.push(Image::create("L", 2, 2, shade));
        }
    "#;
    let host = ExecutionHost::new(
        Capabilities::detect(),
        SelectionPolicy {
            max_images: 2,
            max_total_bytes: 0,
        },
    );
    let result = respond(&host, &ExecutionRequest::new(code));
    assert!(result.is_success(), "{:?}", result.error_message);
    let alts: Vec<&str> = result.images.iter().map(|c| c.alt_text.as_str()).collect();
    assert_eq!(alts, vec!["Image 1", "Image 2"]);
}

#[test]
fn test_byte_budget_skips_oversized_images() {
    let code = r#"
        images = [blob(64, 1), blob(4, 2), blob(4, 3)];
    "#;
    let host = ExecutionHost::new(
        Capabilities::detect(),
        SelectionPolicy {
            max_images: 0,
            max_total_bytes: 10,
        },
    );
    let result = respond(&host, &ExecutionRequest::new(code));
    let alts: Vec<&str> = result.images.iter().map(|c| c.alt_text.as_str()).collect();
    assert_eq!(alts, vec!["Image 2", "Image 3"]);
}

#[test]
fn test_fenced_snippet_runs() {
    let result = run_snippet(&ExecutionRequest::new(
        "```rhai\nlet x = 20;\nresult = x + 1;\n```",
    ));
    assert!(result.is_success(), "{:?}", result.error_message);
    assert_eq!(result.result, json!(21));
}

#[test]
fn test_blank_snippet_is_rejected() {
    let result = run_snippet(&ExecutionRequest::new("   \n  "));
    assert!(result.error_message.unwrap().starts_with("invalid request"));
    assert!(result.stdout.is_empty());
}

#[test]
fn test_syntax_error_reported() {
    let result = run_snippet(&ExecutionRequest::new("let = ;"));
    assert!(result.error_message.unwrap().starts_with("syntax error"));
}

#[cfg(all(feature = "array", feature = "imaging"))]
#[test]
fn test_array_rendered_as_image() {
    let code = r#"
        let arr = np::linspace(0.0, 1.0, 16).reshape([4, 4]);
        img = arr;
    "#;
    let result = run_snippet(&ExecutionRequest::new(code));
    assert!(result.is_success(), "{:?}", result.error_message);
    assert_eq!(result.images.len(), 1);
    assert_eq!(result.images[0].alt_text, "img image");
}

#[test]
fn test_disabled_library_is_absent() {
    let host = ExecutionHost::new(Capabilities::none(), SelectionPolicy::default());
    let result = respond(&host, &ExecutionRequest::new("plt::plot([1, 2]);"));
    assert!(!result.is_success());
}

#[cfg(feature = "dataframe")]
#[test]
fn test_dataframe_round_trip_through_csv() {
    let base = tempfile::tempdir().unwrap();
    let code = r#"
        let df = pd::DataFrame(#{ a: [1, 2, 3], b: ["x", "y", "z"] });
        df.to_csv("table.csv");
        let back = pd::read_csv("table.csv");
        result = back.shape;
    "#;
    let result = run_snippet(&ExecutionRequest::new(code).with_output_base_dir(base.path()));
    assert!(result.is_success(), "{:?}", result.error_message);
    assert_eq!(result.result, json!([3, 2]));
    assert_eq!(result.files.len(), 1);
    assert_eq!(result.files[0].name, "table.csv");
}

#[test]
fn test_eval_script_tool_returns_envelope() {
    let registry = default_registry(&Config::default());
    let output = registry
        .call("eval_script", json!({"code": "print(\"hi\"); result = [1, 2];"}))
        .unwrap();
    let value: serde_json::Value = serde_json::from_str(&output).unwrap();
    assert_eq!(value["stdout"], "hi\n");
    assert_eq!(value["result"], json!([1, 2]));
    assert!(value["error_message"].is_null());
}

#[cfg(feature = "array")]
#[test]
fn test_runaway_allocation_still_returns_envelope() {
    for code in [
        "print(\"before\");\nlet a = np::arange(0, 1e300, 1e-300);",
        "print(\"before\");\nlet a = np::zeros([4294967296, 4294967296]);",
    ] {
        let result = run_snippet(&ExecutionRequest::new(code));
        assert!(!result.is_success(), "{code}");
        assert!(result.error_message.as_deref().unwrap().starts_with("runtime error"));
        assert_eq!(result.stdout, "before\n");
        assert!(result.to_json()["images"].as_array().unwrap().is_empty());
    }
}

#[test]
fn test_indented_snippet_is_dedented() {
    let code = "\n    let total = 0;\n    for i in 1..=3 {\n        total += i;\n    }\n    result = total;\n";
    let result = run_snippet(&ExecutionRequest::new(code));
    assert!(result.is_success(), "{:?}", result.error_message);
    assert_eq!(result.result, json!(6));
}

#[test]
fn test_relative_output_path_without_base_dir_is_not_reported() {
    let request = ExecutionRequest::new("os::write_text(\"out.txt\", \"x\"); result = OUTPUT_PATH;")
        .with_output_path("kept.txt");
    let result = run_snippet(&request);
    assert!(result.is_success(), "{:?}", result.error_message);
    assert!(result.result.as_str().unwrap().ends_with("kept.txt"));
    assert!(result.files.is_empty());
}
