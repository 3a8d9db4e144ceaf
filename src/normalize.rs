use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Language tags accepted on a fence or as a bare first line.
const LANGUAGE_TAGS: [&str; 4] = ["rhai", "rust", "rs", "script"];

static CODE_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)```(?:rhai|rust|rs|script)?[^\S\n]*\n?([\s\S]*?)\s*```")
        .expect("code fence pattern is valid")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("script is empty after normalization")]
    Empty,
}

/// Turn loosely formatted caller input into executable source.
///
/// Accepts fenced markdown blocks (optionally tagged), single-backtick
/// wrapping and a bare language-name first line. The result is dedented
/// and trimmed.
pub fn normalize_code(raw: &str) -> Result<String, NormalizeError> {
    let unified = raw.replace("\r\n", "\n").replace('\r', "\n");
    let trimmed = unified.trim();

    let mut code = if let Some(captures) = CODE_FENCE.captures(&unified) {
        captures
            .get(1)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default()
    } else if trimmed.len() > 1 && trimmed.starts_with('`') && trimmed.ends_with('`') {
        trimmed.trim_matches('`').to_string()
    } else {
        strip_blank_lines(&unified).to_string()
    };

    let first_line = code.lines().next().unwrap_or("").trim().to_lowercase();
    if LANGUAGE_TAGS.contains(&first_line.as_str()) {
        code = match code.find('\n') {
            Some(index) => code[index + 1..].to_string(),
            None => String::new(),
        };
    }

    let normalized = dedent(&code).trim().to_string();
    if normalized.is_empty() {
        return Err(NormalizeError::Empty);
    }
    Ok(normalized)
}

/// Drop leading and trailing blank lines, keeping the first line's indent.
fn strip_blank_lines(text: &str) -> &str {
    let Some(first) = text.find(|c: char| !c.is_whitespace()) else {
        return "";
    };
    let start = text[..first].rfind('\n').map_or(0, |i| i + 1);
    &text[start..text.trim_end().len()]
}

/// Remove the whitespace prefix shared by every non-blank line.
/// Whitespace-only lines become empty.
fn dedent(text: &str) -> String {
    let mut common: Option<&str> = None;
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let indent_len = line.len() - line.trim_start().len();
        let indent = &line[..indent_len];
        common = Some(match common {
            None => indent,
            Some(prev) => {
                let shared = prev
                    .char_indices()
                    .zip(indent.chars())
                    .take_while(|((_, a), b)| a == b)
                    .last()
                    .map(|((i, c), _)| i + c.len_utf8())
                    .unwrap_or(0);
                &prev[..shared]
            }
        });
    }
    let prefix = common.unwrap_or("");

    text.lines()
        .map(|line| {
            if line.trim().is_empty() {
                ""
            } else {
                line.strip_prefix(prefix).unwrap_or(line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_code_is_trimmed() {
        assert_eq!(normalize_code("  let x = 1;\n").unwrap(), "let x = 1;");
    }

    #[test]
    fn test_tagged_fence_is_extracted() {
        let raw = "Here you go:\n```rhai\nlet x = 1;\nprint(x);\n```\nthanks";
        assert_eq!(normalize_code(raw).unwrap(), "let x = 1;\nprint(x);");
    }

    #[test]
    fn test_untagged_fence_is_extracted() {
        let raw = "```\nresult = 2;\n```";
        assert_eq!(normalize_code(raw).unwrap(), "result = 2;");
    }

    #[test]
    fn test_only_first_fence_is_used() {
        let raw = "```rhai\nlet a = 1;\n```\n```rhai\nlet b = 2;\n```";
        assert_eq!(normalize_code(raw).unwrap(), "let a = 1;");
    }

    #[test]
    fn test_single_backticks_are_stripped() {
        assert_eq!(normalize_code("`print(1)`").unwrap(), "print(1)");
    }

    #[test]
    fn test_language_line_is_dropped() {
        assert_eq!(normalize_code("RHAI\nlet y = 3;").unwrap(), "let y = 3;");
        assert_eq!(normalize_code("script\nlet y = 3;").unwrap(), "let y = 3;");
    }

    #[test]
    fn test_identifier_starting_with_tag_is_kept() {
        let code = "rhai_version = 1;";
        assert_eq!(normalize_code(code).unwrap(), code);
    }

    #[test]
    fn test_common_indentation_removed() {
        let raw = "    if true {\n        print(1);\n    }\n";
        assert_eq!(normalize_code(raw).unwrap(), "if true {\n    print(1);\n}");
    }

    #[test]
    fn test_indented_fence_body_is_dedented() {
        let raw = "```rhai\n    for i in 0..2 {\n        print(i);\n    }\n```";
        assert_eq!(normalize_code(raw).unwrap(), "for i in 0..2 {\n    print(i);\n}");
    }

    #[test]
    fn test_leading_blank_lines_do_not_block_dedent() {
        let raw = "\n\n  let a = 1;\n    let b = 2;\n\n";
        assert_eq!(normalize_code(raw).unwrap(), "let a = 1;\n  let b = 2;");
    }

    #[test]
    fn test_strip_blank_lines() {
        assert_eq!(strip_blank_lines(" \n  x\n y \n\n"), "  x\n y");
        assert_eq!(strip_blank_lines(" \n\t"), "");
    }

    #[test]
    fn test_crlf_line_endings() {
        let raw = "```rhai\r\nlet a = 1;\r\nlet b = 2;\r\n```";
        assert_eq!(normalize_code(raw).unwrap(), "let a = 1;\nlet b = 2;");
    }

    #[test]
    fn test_empty_input_rejected() {
        assert_eq!(normalize_code("   \n  "), Err(NormalizeError::Empty));
        assert_eq!(normalize_code("```rhai\n```"), Err(NormalizeError::Empty));
        assert_eq!(normalize_code("rhai"), Err(NormalizeError::Empty));
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let inputs = [
            "```rhai\n  let x = 1;\n  print(x);\n```",
            "   result = 40 + 2;   ",
            "`let z = [1, 2];`",
            "rs\n\tlet t = 1;\n\tlet u = 2;",
        ];
        for raw in inputs {
            let once = normalize_code(raw).unwrap();
            let twice = normalize_code(&once).unwrap();
            assert_eq!(once, twice, "not idempotent for {:?}", raw);
        }
    }

    #[test]
    fn test_dedent_keeps_blank_lines() {
        assert_eq!(dedent("  a\n\n  b"), "a\n\nb");
        assert_eq!(dedent("\ta\n  b"), "\ta\n  b");
    }
}
