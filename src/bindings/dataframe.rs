//! `pd`: column-oriented tables with CSV input and output.

use super::{as_size, resolve_in, BindingContext, ScriptResult};
use crate::response::dynamic_to_json;
use csv::{ReaderBuilder, WriterBuilder};
use rhai::{Array, Dynamic, Engine, Map, Module, FLOAT, INT};
use std::fmt;
use std::path::Path;

const DISPLAY_ROWS: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct DataFrame {
    columns: Vec<(String, Vec<Dynamic>)>,
}

impl DataFrame {
    /// Build from a map of column name to values. Every column must have
    /// the same length.
    pub fn from_columns(map: Map) -> Result<Self, String> {
        let mut columns = Vec::with_capacity(map.len());
        for (name, values) in map {
            let values = values
                .into_array()
                .map_err(|t| format!("column '{name}' must be an array, got {t}"))?;
            columns.push((name.to_string(), values));
        }
        let frame = Self { columns };
        frame.check_lengths()?;
        Ok(frame)
    }

    /// Build from an array of row maps. Columns appear in first-seen order;
    /// missing cells are unit.
    pub fn from_records(rows: Array) -> Result<Self, String> {
        let mut frame = Self::default();
        for (row_index, row) in rows.into_iter().enumerate() {
            let row = row
                .try_cast::<Map>()
                .ok_or_else(|| format!("row {row_index} is not an object map"))?;
            for (name, value) in row {
                let position = match frame.columns.iter().position(|(n, _)| n == name.as_str()) {
                    Some(position) => position,
                    None => {
                        frame
                            .columns
                            .push((name.to_string(), vec![Dynamic::UNIT; row_index]));
                        frame.columns.len() - 1
                    }
                };
                frame.columns[position].1.push(value);
            }
            for (_, values) in frame.columns.iter_mut() {
                values.resize(row_index + 1, Dynamic::UNIT);
            }
        }
        Ok(frame)
    }

    pub fn read_csv(path: &Path) -> Result<Self, String> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .map_err(|e| format!("failed to read '{}': {}", path.display(), e))?;
        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| format!("failed to read header: {e}"))?
            .iter()
            .map(str::to_string)
            .collect();
        let mut columns: Vec<(String, Vec<Dynamic>)> =
            headers.into_iter().map(|h| (h, Vec::new())).collect();
        for record in reader.records() {
            let record = record.map_err(|e| format!("malformed CSV row: {e}"))?;
            for (index, (_, values)) in columns.iter_mut().enumerate() {
                values.push(record.get(index).map_or(Dynamic::UNIT, parse_cell));
            }
        }
        Ok(Self { columns })
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), String> {
        let fail = |e: csv::Error| format!("failed to write '{}': {}", path.display(), e);
        let mut writer = WriterBuilder::new().from_path(path).map_err(fail)?;
        writer.write_record(self.column_names()).map_err(fail)?;
        for row in 0..self.len() {
            writer
                .write_record(self.columns.iter().map(|(_, values)| cell_text(&values[row])))
                .map_err(fail)?;
        }
        writer
            .flush()
            .map_err(|e| format!("failed to write '{}': {}", path.display(), e))
    }

    pub fn len(&self) -> usize {
        self.columns.first().map_or(0, |(_, values)| values.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&[Dynamic]> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, values)| values.as_slice())
    }

    pub fn head(&self, rows: usize) -> Self {
        Self {
            columns: self
                .columns
                .iter()
                .map(|(name, values)| (name.clone(), values.iter().take(rows).cloned().collect()))
                .collect(),
        }
    }

    /// Rows as JSON objects.
    pub fn to_records(&self) -> serde_json::Value {
        let rows = (0..self.len())
            .map(|row| {
                let record = self
                    .columns
                    .iter()
                    .map(|(name, values)| (name.clone(), dynamic_to_json(&values[row])))
                    .collect::<serde_json::Map<_, _>>();
                serde_json::Value::Object(record)
            })
            .collect();
        serde_json::Value::Array(rows)
    }

    fn check_lengths(&self) -> Result<(), String> {
        let expected = self.len();
        match self.columns.iter().find(|(_, values)| values.len() != expected) {
            Some((name, values)) => Err(format!(
                "column '{}' has {} values, expected {}",
                name,
                values.len(),
                expected
            )),
            None => Ok(()),
        }
    }
}

fn parse_cell(text: &str) -> Dynamic {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        Dynamic::UNIT
    } else if let Ok(i) = trimmed.parse::<INT>() {
        Dynamic::from(i)
    } else if let Ok(f) = trimmed.parse::<FLOAT>() {
        Dynamic::from(f)
    } else {
        Dynamic::from(text.to_string())
    }
}

fn cell_text(value: &Dynamic) -> String {
    if value.is_unit() {
        String::new()
    } else {
        value.to_string()
    }
}

impl fmt::Display for DataFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = self.len().min(DISPLAY_ROWS);
        let cells: Vec<Vec<String>> = self
            .columns
            .iter()
            .map(|(name, values)| {
                std::iter::once(name.clone())
                    .chain(values.iter().take(shown).map(cell_text))
                    .collect()
            })
            .collect();
        let widths: Vec<usize> = cells
            .iter()
            .map(|col| col.iter().map(|c| c.chars().count()).max().unwrap_or(0))
            .collect();
        for line in 0..=shown {
            let row: Vec<String> = cells
                .iter()
                .zip(&widths)
                .map(|(col, width)| format!("{:>width$}", col[line], width = *width))
                .collect();
            writeln!(f, "{}", row.join("  "))?;
        }
        if self.len() > shown {
            writeln!(f, "...")?;
        }
        write!(f, "[{} rows x {} columns]", self.len(), self.columns.len())
    }
}

pub fn register(engine: &mut Engine, ctx: &BindingContext) {
    engine.register_type_with_name::<DataFrame>("DataFrame");

    let mut module = Module::new();
    module.set_native_fn("DataFrame", |data: Dynamic| -> ScriptResult<DataFrame> {
        let type_name = data.type_name();
        if data.is_map() {
            let map = data.cast::<Map>();
            return DataFrame::from_columns(map).map_err(Into::into);
        }
        if data.is_array() {
            let rows = data.cast::<Array>();
            return DataFrame::from_records(rows).map_err(Into::into);
        }
        Err(format!("DataFrame expects a map of columns or an array of rows, got {type_name}").into())
    });
    let workdir = ctx.workdir.clone();
    module.set_native_fn("read_csv", move |path: &str| -> ScriptResult<DataFrame> {
        DataFrame::read_csv(&resolve_in(&workdir, path)).map_err(Into::into)
    });
    engine.register_static_module("pd", module.into());

    engine.register_get("columns", |df: &mut DataFrame| -> Array {
        df.column_names()
            .into_iter()
            .map(|name| Dynamic::from(name.to_string()))
            .collect()
    });
    engine.register_get("shape", |df: &mut DataFrame| -> Array {
        vec![
            Dynamic::from(df.len() as INT),
            Dynamic::from(df.columns.len() as INT),
        ]
    });
    engine.register_fn("len", |df: &mut DataFrame| df.len() as INT);
    engine.register_fn("column", |df: &mut DataFrame, name: &str| -> ScriptResult<Array> {
        df.column(name)
            .map(|values| values.to_vec())
            .ok_or_else(|| format!("no column named '{name}'").into())
    });
    engine.register_fn("head", |df: &mut DataFrame| df.head(5));
    engine.register_fn("head", |df: &mut DataFrame, rows: INT| -> ScriptResult<DataFrame> {
        Ok(df.head(as_size(rows, "row count")?))
    });
    let workdir = ctx.workdir.clone();
    engine.register_fn("to_csv", move |df: &mut DataFrame, path: &str| -> ScriptResult<()> {
        df.write_csv(&resolve_in(&workdir, path)).map_err(Into::into)
    });
    engine.register_fn("to_json", |df: &mut DataFrame| df.to_records().to_string());
    engine.register_fn("to_string", |df: &mut DataFrame| df.to_string());
    engine.register_fn("to_debug", |df: &mut DataFrame| df.to_string());
}
