//! Gathers image candidates after a run, then deduplicates and budgets them.

#[cfg(feature = "plotting")]
use super::codec::encode_figure;
use super::codec::{encode_file, ImageCodec};
use super::{is_supported_image_path, ImageCandidate};
#[cfg(feature = "plotting")]
use crate::bindings::plot::PlotState;
use crate::config::LimitsConfig;
use rhai::{Array, Dynamic, Scope};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

/// Conventional variable names probed when no `image`/`images` is set.
pub const AUTO_CAPTURE_NAMES: [&str; 4] = ["img", "image", "fig", "figure"];

/// Count and byte budgets. Zero disables a budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionPolicy {
    pub max_images: usize,
    pub max_total_bytes: usize,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self::from_limits(&LimitsConfig::default())
    }
}

impl SelectionPolicy {
    pub fn from_limits(limits: &LimitsConfig) -> Self {
        Self {
            max_images: limits.max_images,
            max_total_bytes: limits.max_total_image_bytes,
        }
    }

    pub fn unlimited() -> Self {
        Self {
            max_images: 0,
            max_total_bytes: 0,
        }
    }

    /// Accept candidates in order while both budgets have room. A candidate
    /// that would overflow the byte budget is skipped and later, smaller
    /// ones may still fit.
    pub fn select(&self, candidates: Vec<ImageCandidate>) -> Vec<ImageCandidate> {
        let mut selected = Vec::new();
        let mut total_bytes = 0usize;
        for candidate in candidates {
            if self.max_images > 0 && selected.len() >= self.max_images {
                tracing::debug!(max_images = self.max_images, "image count budget reached");
                break;
            }
            let next_total = total_bytes.saturating_add(candidate.size_bytes);
            if self.max_total_bytes > 0 && next_total > self.max_total_bytes {
                tracing::debug!(
                    alt_text = %candidate.alt_text,
                    size_bytes = candidate.size_bytes,
                    "image skipped, byte budget exceeded"
                );
                continue;
            }
            total_bytes = next_total;
            selected.push(candidate);
        }
        selected
    }
}

/// Drop exact payload duplicates, keeping the first occurrence.
pub fn dedupe(candidates: Vec<ImageCandidate>) -> Vec<ImageCandidate> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|candidate| seen.insert(candidate.data.clone()))
        .collect()
}

pub struct Collector<'a> {
    codec: ImageCodec<'a>,
    workdir: &'a Path,
    #[cfg(feature = "plotting")]
    plots: Option<&'a PlotState>,
}

impl<'a> Collector<'a> {
    pub fn new(codec: ImageCodec<'a>, workdir: &'a Path) -> Self {
        Self {
            codec,
            workdir,
            #[cfg(feature = "plotting")]
            plots: None,
        }
    }

    #[cfg(feature = "plotting")]
    pub fn with_plots(mut self, plots: &'a PlotState) -> Self {
        self.plots = Some(plots);
        self
    }

    /// Collect, deduplicate and budget.
    pub fn harvest(&self, scope: &Scope, policy: &SelectionPolicy) -> Vec<ImageCandidate> {
        let gathered = self.collect(scope);
        let unique = dedupe(gathered);
        policy.select(unique)
    }

    /// Every candidate in source-priority order, duplicates included.
    pub fn collect(&self, scope: &Scope) -> Vec<ImageCandidate> {
        let mut candidates = Vec::new();

        if let Some(value) = variable(scope, "image") {
            self.push_value(&mut candidates, &value, || "Image".to_string());
        }
        if let Some(items) = variable(scope, "images").and_then(|v| v.try_cast::<Array>()) {
            for (index, item) in items.iter().enumerate() {
                self.push_value(&mut candidates, item, || format!("Image {}", index + 1));
            }
        }
        if candidates.is_empty() {
            for name in AUTO_CAPTURE_NAMES {
                if let Some(value) = variable(scope, name) {
                    self.push_value(&mut candidates, &value, || format!("{name} image"));
                }
            }
        }

        #[cfg(feature = "plotting")]
        if let Some(plots) = self.plots {
            for (index, figure) in plots.drain().iter().enumerate() {
                match encode_figure(figure) {
                    Ok(encoded) => candidates.extend(ImageCandidate::new(
                        encoded,
                        format!("Plot {}", index + 1),
                    )),
                    Err(e) => tracing::debug!(figure = figure.number(), error = %e, "figure capture failed"),
                }
            }
        }

        for path in image_files_newest_first(self.workdir) {
            match encode_file(&path) {
                Ok(Some(encoded)) => candidates.extend(ImageCandidate::new(encoded, basename(&path))),
                Ok(None) => {}
                Err(e) => tracing::debug!(path = %path.display(), error = %e, "image file skipped"),
            }
        }

        tracing::debug!(count = candidates.len(), "image candidates gathered");
        candidates
    }

    /// Encode one value. String values naming a file get that file's
    /// basename as alt text; relative names resolve against the workdir.
    fn push_value(
        &self,
        candidates: &mut Vec<ImageCandidate>,
        value: &Dynamic,
        fallback_alt: impl FnOnce() -> String,
    ) {
        let (value, file) = self.resolve(value);
        if let Some(encoded) = self.codec.encode_value(&value) {
            let alt = file.map_or_else(fallback_alt, |path| basename(&path));
            candidates.extend(ImageCandidate::new(encoded, alt));
        }
    }

    fn resolve(&self, value: &Dynamic) -> (Dynamic, Option<PathBuf>) {
        let Some(text) = value.read_lock::<rhai::ImmutableString>().map(|s| s.to_string()) else {
            return (value.clone(), None);
        };
        let path = Path::new(&text);
        if path.is_absolute() {
            let exists = path.is_file();
            return (value.clone(), exists.then(|| path.to_path_buf()));
        }
        let joined = self.workdir.join(path);
        if joined.is_file() {
            let resolved = Dynamic::from(joined.to_string_lossy().to_string());
            return (resolved, Some(joined));
        }
        (value.clone(), None)
    }
}

fn variable(scope: &Scope, name: &str) -> Option<Dynamic> {
    scope
        .get_value::<Dynamic>(name)
        .map(|value| value.flatten())
        .filter(|value| !value.is_unit())
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Supported image files under `root`, newest modification time first.
pub fn image_files_newest_first(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<(SystemTime, PathBuf)> = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file() && is_supported_image_path(entry.path()))
        .map(|entry| {
            let modified = entry
                .metadata()
                .ok()
                .and_then(|meta| meta.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, entry.into_path())
        })
        .collect();
    files.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    files.into_iter().map(|(_, path)| path).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::EncodedImage;
    use crate::bindings::Capabilities;
    use rhai::Blob;
    use std::fs;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n-body-";

    fn candidate(data: &str, size: usize) -> ImageCandidate {
        ImageCandidate::new(
            EncodedImage {
                data: data.to_string(),
                format: "png".to_string(),
                size_bytes: size,
            },
            data,
        )
        .unwrap()
    }

    fn alts(candidates: &[ImageCandidate]) -> Vec<&str> {
        candidates.iter().map(|c| c.alt_text.as_str()).collect()
    }

    fn caps() -> Capabilities {
        Capabilities {
            array: true,
            dataframe: true,
            image: true,
            plot: true,
        }
    }

    fn blob(bytes: &[u8]) -> Dynamic {
        Dynamic::from_blob(Blob::from(bytes))
    }

    #[test]
    fn test_count_budget_keeps_priority_order() {
        let policy = SelectionPolicy {
            max_images: 2,
            max_total_bytes: 0,
        };
        let picked = policy.select(vec![candidate("a", 5), candidate("b", 5), candidate("c", 5)]);
        assert_eq!(alts(&picked), vec!["a", "b"]);
    }

    #[test]
    fn test_oversized_candidate_skipped_without_consuming_budget() {
        let policy = SelectionPolicy {
            max_images: 3,
            max_total_bytes: 10,
        };
        let picked = policy.select(vec![
            candidate("a", 6),
            candidate("big", 9),
            candidate("b", 4),
            candidate("c", 1),
        ]);
        assert_eq!(alts(&picked), vec!["a", "b"]);
    }

    #[test]
    fn test_unlimited_policy_keeps_everything() {
        let all: Vec<_> = (0..40).map(|i| candidate(&i.to_string(), 1 << 20)).collect();
        assert_eq!(SelectionPolicy::unlimited().select(all).len(), 40);
    }

    #[test]
    fn test_dedupe_first_occurrence_wins() {
        let mut later = candidate("same", 3);
        later.alt_text = "second".to_string();
        let unique = dedupe(vec![candidate("same", 3), candidate("other", 3), later]);
        assert_eq!(alts(&unique), vec!["same", "other"]);
    }

    #[test]
    fn test_image_and_images_variables() {
        let dir = tempfile::tempdir().unwrap();
        let mut scope = Scope::new();
        scope.push("image", blob(b"one"));
        scope.push(
            "images",
            Dynamic::from_array(vec![blob(b"two"), Dynamic::from(3.5), blob(b"three")]),
        );
        scope.push("img", blob(b"ignored"));
        let collector = Collector::new(ImageCodec::new(caps()), dir.path());
        let found = collector.collect(&scope);
        assert_eq!(alts(&found), vec!["Image", "Image 1", "Image 3"]);
    }

    #[test]
    fn test_auto_capture_only_without_explicit_images() {
        let dir = tempfile::tempdir().unwrap();
        let mut scope = Scope::new();
        scope.push("image", Dynamic::UNIT);
        scope.push("fig", blob(b"fig-bytes"));
        scope.push("img", blob(b"img-bytes"));
        let collector = Collector::new(ImageCodec::new(caps()), dir.path());
        assert_eq!(alts(&collector.collect(&scope)), vec!["img image", "fig image"]);
    }

    #[test]
    fn test_relative_path_resolved_in_workdir() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("out")).unwrap();
        fs::write(dir.path().join("out/chart.png"), PNG).unwrap();
        let mut scope = Scope::new();
        scope.push("image", Dynamic::from("out/chart.png"));
        let collector = Collector::new(ImageCodec::new(caps()), dir.path());
        let found = collector.harvest(&scope, &SelectionPolicy::default());
        // the same file from the directory scan is a duplicate
        assert_eq!(alts(&found), vec!["chart.png"]);
    }

    #[cfg(feature = "plotting")]
    #[test]
    fn test_open_figures_are_captured_and_closed() {
        let dir = tempfile::tempdir().unwrap();
        let plots = PlotState::default();
        plots.new_figure(40, 30);
        plots.new_figure(50, 30);
        let collector = Collector::new(ImageCodec::new(caps()), dir.path()).with_plots(&plots);
        let found = collector.collect(&Scope::new());
        assert_eq!(alts(&found), vec!["Plot 1", "Plot 2"]);
        assert!(plots.fignums().is_empty());
    }

    #[test]
    fn test_directory_scan_skips_bad_magic_and_orders_by_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.png");
        let new = dir.path().join("nested/new.png");
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(&old, PNG).unwrap();
        fs::write(&new, [PNG, &b"newer"[..]].concat()).unwrap();
        fs::write(dir.path().join("fake.png"), b"plain text").unwrap();
        fs::write(dir.path().join("notes.txt"), b"plain text").unwrap();
        let past = SystemTime::now() - std::time::Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(past)
            .unwrap();

        let collector = Collector::new(ImageCodec::new(caps()), dir.path());
        let found = collector.collect(&Scope::new());
        assert_eq!(alts(&found), vec!["new.png", "old.png"]);
    }
}
