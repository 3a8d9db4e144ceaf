pub mod codec;
pub mod collector;
pub mod persist;

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Supported image extensions and the format label each one maps to.
const IMAGE_EXTENSIONS: [(&str, &str); 6] = [
    ("png", "png"),
    ("jpg", "jpeg"),
    ("jpeg", "jpeg"),
    ("gif", "gif"),
    ("webp", "webp"),
    ("bmp", "bmp"),
];

/// Format label for a path with a supported image extension.
pub fn image_format_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    IMAGE_EXTENSIONS
        .iter()
        .find(|(candidate, _)| *candidate == ext)
        .map(|(_, format)| *format)
}

pub fn is_supported_image_path(path: &Path) -> bool {
    image_format_for(path).is_some()
}

/// A base64 payload with its format label and decoded byte length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub data: String,
    pub format: String,
    pub size_bytes: usize,
}

/// An image captured from a run. `size_bytes` is used for budgeting only
/// and never leaves the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCandidate {
    #[serde(rename = "type")]
    pub kind: String,
    pub format: String,
    pub data: String,
    pub alt_text: String,
    #[serde(skip)]
    pub size_bytes: usize,
}

impl ImageCandidate {
    pub fn new(encoded: EncodedImage, alt_text: impl Into<String>) -> Option<Self> {
        if encoded.data.is_empty() {
            return None;
        }
        Some(Self {
            kind: "base64".to_string(),
            format: encoded.format,
            data: encoded.data,
            alt_text: alt_text.into(),
            size_bytes: encoded.size_bytes,
        })
    }
}

/// A working-directory file copied to durable storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedFile {
    pub path: String,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_format_lookup() {
        assert_eq!(image_format_for(Path::new("a/b.PNG")), Some("png"));
        assert_eq!(image_format_for(Path::new("x.jpg")), Some("jpeg"));
        assert_eq!(image_format_for(Path::new("x.jpeg")), Some("jpeg"));
        assert_eq!(image_format_for(Path::new("x.webp")), Some("webp"));
        assert_eq!(image_format_for(Path::new("x.txt")), None);
        assert_eq!(image_format_for(Path::new("png")), None);
    }

    #[test]
    fn test_candidate_rejects_empty_payload() {
        let empty = EncodedImage {
            data: String::new(),
            format: "png".to_string(),
            size_bytes: 0,
        };
        assert!(ImageCandidate::new(empty, "Image").is_none());
    }

    #[test]
    fn test_candidate_serialization_hides_size() {
        let candidate = ImageCandidate::new(
            EncodedImage {
                data: "AAAA".to_string(),
                format: "png".to_string(),
                size_bytes: 3,
            },
            "plot.png",
        )
        .unwrap();
        let value = serde_json::to_value(&candidate).unwrap();
        assert_eq!(value["type"], "base64");
        assert_eq!(value["alt_text"], "plot.png");
        assert!(value.get("size_bytes").is_none());
    }
}
