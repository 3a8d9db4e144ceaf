//! General-purpose modules available to every snippet: `os`, `re`, `json`,
//! `time`, `datetime`, `random` and `math`.
//!
//! Every path argument resolves against the request's working directory.

use crate::bindings::{as_number, resolve_in, ScriptResult};
use crate::response::dynamic_to_json;
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use regex::Regex;
use rhai::{Array, Blob, Dynamic, Engine, Module, FLOAT, INT};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;

/// Names of the modules installed by [`register`].
pub const MODULES: [&str; 7] = ["os", "re", "json", "time", "datetime", "random", "math"];

pub fn register(engine: &mut Engine, workdir: &Rc<PathBuf>) {
    engine.register_static_module("os", os_module(workdir).into());
    engine.register_static_module("re", re_module().into());
    engine.register_static_module("json", json_module().into());
    engine.register_static_module("time", time_module().into());
    engine.register_static_module("datetime", datetime_module().into());
    engine.register_static_module("random", random_module().into());
    engine.register_static_module("math", math_module().into());
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> Box<rhai::EvalAltResult> {
    format!("{} '{}': {}", action, path.display(), e).into()
}

fn os_module(workdir: &Rc<PathBuf>) -> Module {
    let mut module = Module::new();

    let dir = workdir.clone();
    module.set_native_fn("getcwd", move || -> ScriptResult<String> {
        Ok(dir.display().to_string())
    });

    let dir = workdir.clone();
    let list = move |path: &str| -> ScriptResult<Array> {
        let target = resolve_in(&dir, path);
        let mut names: Vec<String> = fs::read_dir(&target)
            .map_err(|e| io_error("cannot list", &target, e))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        Ok(names.into_iter().map(Dynamic::from).collect())
    };
    let list_cwd = list.clone();
    module.set_native_fn("listdir", move || list_cwd("."));
    module.set_native_fn("listdir", list);

    for (name, check) in [
        ("exists", Path::exists as fn(&Path) -> bool),
        ("is_file", Path::is_file),
        ("is_dir", Path::is_dir),
    ] {
        let dir = workdir.clone();
        module.set_native_fn(name, move |path: &str| -> ScriptResult<bool> {
            Ok(check(&resolve_in(&dir, path)))
        });
    }

    let dir = workdir.clone();
    module.set_native_fn("makedirs", move |path: &str| -> ScriptResult<()> {
        let target = resolve_in(&dir, path);
        fs::create_dir_all(&target).map_err(|e| io_error("cannot create", &target, e))
    });

    let dir = workdir.clone();
    module.set_native_fn("remove", move |path: &str| -> ScriptResult<()> {
        let target = resolve_in(&dir, path);
        let removed = if target.is_dir() {
            fs::remove_dir_all(&target)
        } else {
            fs::remove_file(&target)
        };
        removed.map_err(|e| io_error("cannot remove", &target, e))
    });

    module.set_native_fn("path_join", |base: &str, child: &str| -> ScriptResult<String> {
        Ok(Path::new(base).join(child).display().to_string())
    });
    module.set_native_fn("basename", |path: &str| -> ScriptResult<String> {
        Ok(Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default())
    });

    let dir = workdir.clone();
    module.set_native_fn("read_text", move |path: &str| -> ScriptResult<String> {
        let target = resolve_in(&dir, path);
        fs::read_to_string(&target).map_err(|e| io_error("cannot read", &target, e))
    });
    let dir = workdir.clone();
    module.set_native_fn("write_text", move |path: &str, text: &str| -> ScriptResult<()> {
        let target = resolve_in(&dir, path);
        fs::write(&target, text).map_err(|e| io_error("cannot write", &target, e))
    });
    let dir = workdir.clone();
    module.set_native_fn("read_bytes", move |path: &str| -> ScriptResult<Blob> {
        let target = resolve_in(&dir, path);
        fs::read(&target).map_err(|e| io_error("cannot read", &target, e))
    });
    let dir = workdir.clone();
    module.set_native_fn("write_bytes", move |path: &str, bytes: Blob| -> ScriptResult<()> {
        let target = resolve_in(&dir, path);
        fs::write(&target, bytes).map_err(|e| io_error("cannot write", &target, e))
    });

    module.set_native_fn("getenv", |name: &str| -> ScriptResult<Dynamic> {
        Ok(std::env::var(name).map_or(Dynamic::UNIT, Dynamic::from))
    });
    module
}

/// Upper bound on distinct patterns compiled within one run.
const PATTERN_CACHE_LIMIT: usize = 64;

/// Compiled patterns for the `re` module of a single engine.
#[derive(Debug, Clone, Default)]
struct PatternCache {
    compiled: Rc<RefCell<HashMap<String, Regex>>>,
}

impl PatternCache {
    fn get(&self, source: &str) -> ScriptResult<Regex> {
        if let Some(regex) = self.compiled.borrow().get(source) {
            return Ok(regex.clone());
        }
        let regex = Regex::new(source).map_err(|e| format!("invalid pattern: {e}"))?;
        let mut compiled = self.compiled.borrow_mut();
        if compiled.len() >= PATTERN_CACHE_LIMIT {
            compiled.clear();
        }
        compiled.insert(source.to_string(), regex.clone());
        Ok(regex)
    }

    fn len(&self) -> usize {
        self.compiled.borrow().len()
    }
}

fn re_module() -> Module {
    re_module_with(PatternCache::default())
}

fn re_module_with(cache: PatternCache) -> Module {
    let mut module = Module::new();
    let c = cache.clone();
    module.set_native_fn("is_match", move |pat: &str, text: &str| -> ScriptResult<bool> {
        Ok(c.get(pat)?.is_match(text))
    });
    let c = cache.clone();
    module.set_native_fn("find", move |pat: &str, text: &str| -> ScriptResult<Dynamic> {
        Ok(c.get(pat)?
            .find(text)
            .map_or(Dynamic::UNIT, |m| Dynamic::from(m.as_str().to_string())))
    });
    let c = cache.clone();
    module.set_native_fn("find_all", move |pat: &str, text: &str| -> ScriptResult<Array> {
        Ok(c.get(pat)?
            .find_iter(text)
            .map(|m| Dynamic::from(m.as_str().to_string()))
            .collect())
    });
    let c = cache.clone();
    module.set_native_fn(
        "replace",
        move |pat: &str, text: &str, replacement: &str| -> ScriptResult<String> {
            Ok(c.get(pat)?.replace_all(text, replacement).into_owned())
        },
    );
    let c = cache;
    module.set_native_fn("split", move |pat: &str, text: &str| -> ScriptResult<Array> {
        Ok(c.get(pat)?
            .split(text)
            .map(|part| Dynamic::from(part.to_string()))
            .collect())
    });
    module
}

fn json_module() -> Module {
    let mut module = Module::new();
    module.set_native_fn("dumps", |value: Dynamic| -> ScriptResult<String> {
        Ok(dynamic_to_json(&value).to_string())
    });
    module.set_native_fn("dumps", |value: Dynamic, pretty: bool| -> ScriptResult<String> {
        let json = dynamic_to_json(&value);
        if pretty {
            serde_json::to_string_pretty(&json).map_err(|e| e.to_string().into())
        } else {
            Ok(json.to_string())
        }
    });
    module.set_native_fn("loads", |text: &str| -> ScriptResult<Dynamic> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| format!("invalid JSON: {e}"))?;
        rhai::serde::to_dynamic(value)
    });
    module
}

fn unix_seconds() -> FLOAT {
    Utc::now().timestamp_micros() as FLOAT / 1_000_000.0
}

fn time_module() -> Module {
    let mut module = Module::new();
    let started = Instant::now();
    module.set_native_fn("time", || -> ScriptResult<FLOAT> { Ok(unix_seconds()) });
    module.set_native_fn("monotonic", move || -> ScriptResult<FLOAT> {
        Ok(started.elapsed().as_secs_f64())
    });
    module
}

/// Reject format strings chrono cannot render instead of panicking on display.
fn checked_format(fmt: &str) -> ScriptResult<Vec<Item<'_>>> {
    let items: Vec<Item<'_>> = StrftimeItems::new(fmt).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(format!("invalid date format '{fmt}'").into());
    }
    Ok(items)
}

fn datetime_module() -> Module {
    const ISO: &str = "%Y-%m-%dT%H:%M:%S%.6f";
    let mut module = Module::new();
    module.set_native_fn("now", || -> ScriptResult<String> {
        Ok(Local::now().format(ISO).to_string())
    });
    module.set_native_fn("utcnow", || -> ScriptResult<String> {
        Ok(Utc::now().format(ISO).to_string())
    });
    module.set_native_fn("today", || -> ScriptResult<String> {
        Ok(Local::now().format("%Y-%m-%d").to_string())
    });
    module.set_native_fn("timestamp", || -> ScriptResult<FLOAT> { Ok(unix_seconds()) });
    module.set_native_fn("format", |fmt: &str| -> ScriptResult<String> {
        let items = checked_format(fmt)?;
        Ok(Local::now().format_with_items(items.into_iter()).to_string())
    });
    module.set_native_fn("format", |timestamp: Dynamic, fmt: &str| -> ScriptResult<String> {
        let seconds = as_number(&timestamp)
            .ok_or_else(|| format!("timestamp must be a number, got {}", timestamp.type_name()))?;
        let micros = (seconds * 1_000_000.0).round() as i64;
        let moment: DateTime<Utc> = DateTime::from_timestamp_micros(micros)
            .ok_or_else(|| format!("timestamp {seconds} is out of range"))?;
        let items = checked_format(fmt)?;
        Ok(moment.format_with_items(items.into_iter()).to_string())
    });
    module
}

fn random_module() -> Module {
    let mut module = Module::new();
    let rng = Rc::new(RefCell::new(StdRng::from_entropy()));

    let r = rng.clone();
    module.set_native_fn("random", move || -> ScriptResult<FLOAT> {
        Ok(r.borrow_mut().gen::<FLOAT>())
    });
    let r = rng.clone();
    module.set_native_fn("randint", move |low: INT, high: INT| -> ScriptResult<INT> {
        if low > high {
            return Err(format!("empty range for randint({low}, {high})").into());
        }
        Ok(r.borrow_mut().gen_range(low..=high))
    });
    let r = rng.clone();
    module.set_native_fn("uniform", move |low: Dynamic, high: Dynamic| -> ScriptResult<FLOAT> {
        let (Some(low), Some(high)) = (as_number(&low), as_number(&high)) else {
            return Err("uniform bounds must be numbers".into());
        };
        let fraction = r.borrow_mut().gen::<FLOAT>();
        Ok(low + (high - low) * fraction)
    });
    let r = rng.clone();
    module.set_native_fn("choice", move |items: Array| -> ScriptResult<Dynamic> {
        items
            .choose(&mut *r.borrow_mut())
            .cloned()
            .ok_or_else(|| "cannot choose from an empty array".into())
    });
    let r = rng.clone();
    module.set_native_fn("shuffle", move |mut items: Array| -> ScriptResult<Array> {
        items.shuffle(&mut *r.borrow_mut());
        Ok(items)
    });
    let r = rng;
    module.set_native_fn("seed", move |seed: INT| -> ScriptResult<()> {
        *r.borrow_mut() = StdRng::seed_from_u64(seed as u64);
        Ok(())
    });
    module
}

fn number(value: &Dynamic) -> ScriptResult<FLOAT> {
    as_number(value).ok_or_else(|| format!("expected a number, got {}", value.type_name()).into())
}

fn math_module() -> Module {
    let mut module = Module::new();
    module.set_var("pi", std::f64::consts::PI);
    module.set_var("e", std::f64::consts::E);
    module.set_var("tau", std::f64::consts::TAU);
    module.set_var("inf", f64::INFINITY);
    module.set_var("nan", f64::NAN);

    let unary: [(&str, fn(FLOAT) -> FLOAT); 10] = [
        ("sqrt", FLOAT::sqrt),
        ("exp", FLOAT::exp),
        ("log10", FLOAT::log10),
        ("log2", FLOAT::log2),
        ("sin", FLOAT::sin),
        ("cos", FLOAT::cos),
        ("tan", FLOAT::tan),
        ("fabs", FLOAT::abs),
        ("floor", FLOAT::floor),
        ("ceil", FLOAT::ceil),
    ];
    for (name, f) in unary {
        module.set_native_fn(name, move |x: Dynamic| -> ScriptResult<FLOAT> { Ok(f(number(&x)?)) });
    }
    module.set_native_fn("log", |x: Dynamic| -> ScriptResult<FLOAT> { Ok(number(&x)?.ln()) });
    module.set_native_fn("log", |x: Dynamic, base: Dynamic| -> ScriptResult<FLOAT> {
        Ok(number(&x)?.log(number(&base)?))
    });
    module.set_native_fn("pow", |x: Dynamic, y: Dynamic| -> ScriptResult<FLOAT> {
        Ok(number(&x)?.powf(number(&y)?))
    });
    module.set_native_fn("isnan", |x: Dynamic| -> ScriptResult<bool> { Ok(number(&x)?.is_nan()) });
    module.set_native_fn("isfinite", |x: Dynamic| -> ScriptResult<bool> {
        Ok(number(&x)?.is_finite())
    });
    module
}
