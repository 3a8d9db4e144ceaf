//! Optional scientific bindings exposed to snippets.
//!
//! Each library is a capability flag. The compiled-in set is resolved once
//! per process from cargo features; a host may switch any of them off
//! through `[libraries]` in the configuration. A missing capability means
//! no binding is installed and the matching codec probe is skipped.

#[cfg(feature = "array")]
pub mod array;
#[cfg(feature = "dataframe")]
pub mod dataframe;
#[cfg(feature = "imaging")]
pub mod imaging;
#[cfg(feature = "plotting")]
pub mod plot;

use crate::config::LibrariesConfig;
use once_cell::sync::Lazy;
use rhai::{Dynamic, Engine, EvalAltResult, FLOAT, INT};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::rc::Rc;

pub type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

static COMPILED: Lazy<Capabilities> = Lazy::new(|| Capabilities {
    array: cfg!(feature = "array"),
    dataframe: cfg!(feature = "dataframe"),
    image: cfg!(feature = "imaging"),
    plot: cfg!(feature = "plotting"),
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub array: bool,
    pub dataframe: bool,
    pub image: bool,
    pub plot: bool,
}

impl Capabilities {
    /// Libraries compiled into this process.
    pub fn detect() -> Self {
        *COMPILED
    }

    /// No optional library at all.
    pub fn none() -> Self {
        Self {
            array: false,
            dataframe: false,
            image: false,
            plot: false,
        }
    }

    pub fn restrict(self, libraries: &LibrariesConfig) -> Self {
        Self {
            array: self.array && libraries.array,
            dataframe: self.dataframe && libraries.dataframe,
            image: self.image && libraries.image,
            plot: self.plot && libraries.plot,
        }
    }

    /// Binding names installed for these capabilities, in registration order.
    pub fn binding_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.array {
            names.push("np");
        }
        if self.dataframe {
            names.push("pd");
        }
        if self.image {
            names.push("Image");
        }
        if self.plot {
            names.push("plt");
        }
        names
    }
}

/// Per-request state the optional bindings close over.
#[derive(Clone)]
pub struct BindingContext {
    pub workdir: Rc<PathBuf>,
    #[cfg(feature = "plotting")]
    pub plots: plot::PlotState,
}

impl BindingContext {
    pub fn new(workdir: Rc<PathBuf>) -> Self {
        Self {
            workdir,
            #[cfg(feature = "plotting")]
            plots: plot::PlotState::default(),
        }
    }
}

/// Install every binding the capabilities allow. A capability whose
/// library is not compiled in installs nothing.
#[allow(unused_variables)]
pub fn register_optional(engine: &mut Engine, caps: &Capabilities, ctx: &BindingContext) {
    #[cfg(feature = "array")]
    if caps.array {
        array::register(engine);
    }
    #[cfg(feature = "dataframe")]
    if caps.dataframe {
        dataframe::register(engine, ctx);
    }
    #[cfg(feature = "imaging")]
    if caps.image {
        imaging::register(engine, ctx, caps.array);
    }
    #[cfg(feature = "plotting")]
    if caps.plot {
        plot::register(engine, ctx);
    }
    tracing::debug!(bindings = ?caps.binding_names(), "optional bindings installed");
}

/// Resolve a snippet-supplied path against its private working directory.
pub fn resolve_in(workdir: &Path, path: &str) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        workdir.join(candidate)
    }
}

pub fn as_number(value: &Dynamic) -> Option<f64> {
    if let Ok(f) = value.as_float() {
        return Some(f);
    }
    value.as_int().ok().map(|i| i as FLOAT)
}

/// Numbers from a script array or a one-dimensional `NdArray`.
pub fn numbers_from(value: &Dynamic) -> ScriptResult<Vec<f64>> {
    #[cfg(feature = "array")]
    if let Some(arr) = value.read_lock::<array::NdArray>() {
        return Ok(arr.data().to_vec());
    }
    if value.is_array() {
        let items = value.clone().into_array().map_err(|e| e.to_string())?;
        return items
            .iter()
            .map(|item| -> ScriptResult<f64> {
                as_number(item)
                    .ok_or_else(|| format!("expected a number, got {}", item.type_name()).into())
            })
            .collect();
    }
    Err(format!("expected an array of numbers, got {}", value.type_name()).into())
}

/// A non-negative integer argument.
pub fn as_size(value: INT, what: &str) -> ScriptResult<usize> {
    usize::try_from(value).map_err(|_| format!("{what} must be non-negative, got {value}").into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restrict_turns_off_disabled_libraries() {
        let all = Capabilities {
            array: true,
            dataframe: true,
            image: true,
            plot: true,
        };
        let libraries = LibrariesConfig {
            array: true,
            dataframe: false,
            image: true,
            plot: false,
        };
        let caps = all.restrict(&libraries);
        assert!(caps.array && caps.image);
        assert!(!caps.dataframe && !caps.plot);
        assert_eq!(caps.binding_names(), vec!["np", "Image"]);
    }

    #[test]
    fn test_detect_matches_compiled_modules() {
        let caps = Capabilities::detect();
        assert_eq!(caps.array, cfg!(feature = "array"));
        assert_eq!(caps.dataframe, cfg!(feature = "dataframe"));
        assert_eq!(caps.image, cfg!(feature = "imaging"));
        assert_eq!(caps.plot, cfg!(feature = "plotting"));
        assert!(!caps.plot || caps.image);

        let mut engine = Engine::new();
        let ctx = BindingContext::new(Rc::new(std::env::temp_dir()));
        let all = Capabilities {
            array: true,
            dataframe: true,
            image: true,
            plot: true,
        };
        register_optional(&mut engine, &all, &ctx);
        let has_np = engine.eval::<Dynamic>("np::zeros(1)").is_ok();
        assert_eq!(has_np, cfg!(feature = "array"));
        let has_plt = engine.eval::<Dynamic>("plt::figure()").is_ok();
        assert_eq!(has_plt, cfg!(feature = "plotting"));
    }

    #[test]
    fn test_none_has_no_bindings() {
        assert!(Capabilities::none().binding_names().is_empty());
    }

    #[test]
    fn test_resolve_in_keeps_absolute_paths() {
        let workdir = Path::new("/tmp/work");
        assert_eq!(resolve_in(workdir, "/etc/x"), PathBuf::from("/etc/x"));
        assert_eq!(resolve_in(workdir, "out/a.png"), PathBuf::from("/tmp/work/out/a.png"));
    }

    #[test]
    fn test_numbers_from_script_array() {
        let value = Dynamic::from_array(vec![Dynamic::from(1 as INT), Dynamic::from(2.5 as FLOAT)]);
        assert_eq!(numbers_from(&value).unwrap(), vec![1.0, 2.5]);
        let bad = Dynamic::from_array(vec![Dynamic::from("x")]);
        assert!(numbers_from(&bad).is_err());
    }
}
