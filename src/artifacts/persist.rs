//! Copies non-image files out of the private working directory before it
//! is removed.

use super::{is_supported_image_path, PersistedFile};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use walkdir::WalkDir;

static ENV_VAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("env var pattern is valid")
});

/// Resolve a caller-supplied destination. Blank input means none; `~` and
/// `$VAR`/`${VAR}` are expanded (unset variables are left as written); a
/// relative result is placed under `base_dir`, else under `workdir`.
pub fn resolve_output_path(
    raw: Option<&str>,
    base_dir: Option<&Path>,
    workdir: &Path,
) -> Option<PathBuf> {
    let trimmed = raw?.trim();
    if trimmed.is_empty() {
        return None;
    }
    let expanded = expand_vars(&expand_home(trimmed));
    let path = PathBuf::from(expanded);
    if path.is_absolute() {
        Some(path)
    } else {
        Some(base_dir.unwrap_or(workdir).join(path))
    }
}

/// `~` or `~/rest` becomes the home directory; anything else is unchanged.
pub(crate) fn expand_home(path: &str) -> String {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with(['/', '\\']) => rest,
        _ => return path.to_string(),
    };
    match dirs::home_dir() {
        Some(home) => format!("{}{}", home.display(), rest),
        None => path.to_string(),
    }
}

fn expand_vars(path: &str) -> String {
    ENV_VAR
        .replace_all(path, |caps: &Captures| {
            let name = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
            std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

/// Every regular file under `root` without a supported image extension.
pub fn collect_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file() && !is_supported_image_path(entry.path()))
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

fn ends_with_separator(path: &Path) -> bool {
    path.as_os_str().to_string_lossy().ends_with(['/', '\\'])
}

/// Copy the workdir's non-image files to `output_path` if given, else to a
/// fresh subdirectory of `base_dir`. With neither, or with an `output_path`
/// inside the workdir, nothing is copied.
/// Individual copy failures are logged and the file is left out.
pub fn persist(
    workdir: &Path,
    output_path: Option<&Path>,
    base_dir: Option<&Path>,
) -> Vec<PersistedFile> {
    let files = collect_files(workdir);
    if files.is_empty() {
        return Vec::new();
    }

    if let Some(target) = output_path {
        if target.starts_with(workdir) {
            tracing::warn!(
                dest = %target.display(),
                count = files.len(),
                "output path is inside the working directory, files not persisted"
            );
            return Vec::new();
        }
        let as_directory = target.is_dir() || files.len() > 1 || ends_with_separator(target);
        if as_directory {
            return copy_tree(workdir, &files, target);
        }
        return match copy_one(&files[0], target) {
            Ok(persisted) => vec![persisted],
            Err(e) => {
                tracing::warn!(dest = %target.display(), error = %e, "failed to persist output file");
                Vec::new()
            }
        };
    }

    let Some(base_dir) = base_dir else {
        tracing::debug!(count = files.len(), "no output destination, files not persisted");
        return Vec::new();
    };
    let run_dir = base_dir.join(Uuid::new_v4().simple().to_string());
    copy_tree(workdir, &files, &run_dir)
}

fn copy_tree(workdir: &Path, files: &[PathBuf], dest_root: &Path) -> Vec<PersistedFile> {
    if let Err(e) = fs::create_dir_all(dest_root) {
        tracing::warn!(dest = %dest_root.display(), error = %e, "failed to create output directory");
        return Vec::new();
    }
    files
        .iter()
        .filter_map(|file| {
            let relative = file
                .strip_prefix(workdir)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| PathBuf::from(file.file_name().unwrap_or_default()));
            match copy_one(file, &dest_root.join(relative)) {
                Ok(persisted) => Some(persisted),
                Err(e) => {
                    tracing::warn!(file = %file.display(), error = %e, "failed to persist output file");
                    None
                }
            }
        })
        .collect()
}

fn copy_one(source: &Path, dest: &Path) -> io::Result<PersistedFile> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, dest)?;
    let absolute = std::path::absolute(dest)?;
    Ok(PersistedFile {
        path: absolute.to_string_lossy().to_string(),
        name: dest
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
    })
}
