//! `np`: a small n-dimensional numeric array.

use super::{as_number, as_size, ScriptResult};
use rhai::{Array, Dynamic, Engine, Module, FLOAT, INT};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    Float64,
    UInt8,
}

impl Dtype {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "float64" | "float" | "f64" => Some(Dtype::Float64),
            "uint8" | "u8" => Some(Dtype::UInt8),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Dtype::Float64 => "float64",
            Dtype::UInt8 => "uint8",
        }
    }
}

/// Upper bound on the number of elements a single array may hold.
pub const MAX_ELEMENTS: usize = 1 << 24;

/// Element count of `shape`, rejecting overflow and anything above
/// [`MAX_ELEMENTS`].
pub fn element_count(shape: &[usize]) -> Result<usize, String> {
    shape
        .iter()
        .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
        .filter(|count| *count <= MAX_ELEMENTS)
        .ok_or_else(|| format!("array of shape {shape:?} exceeds {MAX_ELEMENTS} elements"))
}

/// Row-major array with `f64` storage.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    shape: Vec<usize>,
    data: Vec<f64>,
    dtype: Dtype,
}

impl NdArray {
    pub fn new(shape: Vec<usize>, data: Vec<f64>, dtype: Dtype) -> Result<Self, String> {
        let expected = element_count(&shape)?;
        if expected != data.len() {
            return Err(format!(
                "cannot build array of shape {:?} from {} values",
                shape,
                data.len()
            ));
        }
        let data = match dtype {
            Dtype::UInt8 => data.into_iter().map(|v| (v as u8) as f64).collect(),
            Dtype::Float64 => data,
        };
        Ok(Self { shape, data, dtype })
    }

    pub fn filled(shape: Vec<usize>, value: f64) -> Result<Self, String> {
        let len = element_count(&shape)?;
        Ok(Self {
            shape,
            data: vec![value; len],
            dtype: Dtype::Float64,
        })
    }

    /// Build from nested script arrays, inferring the shape.
    pub fn from_nested(value: &Dynamic) -> Result<Self, String> {
        if !value.is_array() {
            return Err(format!("expected a nested array, got {}", value.type_name()));
        }
        let mut shape = Vec::new();
        let mut data = Vec::new();
        flatten_into(value, 0, &mut shape, &mut data)?;
        Self::new(shape, data, Dtype::Float64)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn min(&self) -> Option<f64> {
        self.data.iter().copied().reduce(f64::min)
    }

    pub fn max(&self) -> Option<f64> {
        self.data.iter().copied().reduce(f64::max)
    }

    pub fn astype(&self, dtype: Dtype) -> Self {
        let data = match dtype {
            Dtype::UInt8 => self.data.iter().map(|v| (*v as u8) as f64).collect(),
            Dtype::Float64 => self.data.clone(),
        };
        Self {
            shape: self.shape.clone(),
            data,
            dtype,
        }
    }

    pub fn reshape(&self, shape: Vec<usize>) -> Result<Self, String> {
        Self::new(shape, self.data.clone(), self.dtype)
    }

    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            shape: self.shape.clone(),
            data: self.data.iter().map(|v| f(*v)).collect(),
            dtype: Dtype::Float64,
        }
    }

    pub fn zip_with(&self, other: &NdArray, f: impl Fn(f64, f64) -> f64) -> Result<Self, String> {
        if self.shape != other.shape {
            return Err(format!(
                "shape mismatch: {:?} vs {:?}",
                self.shape, other.shape
            ));
        }
        Ok(Self {
            shape: self.shape.clone(),
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(a, b)| f(*a, *b))
                .collect(),
            dtype: Dtype::Float64,
        })
    }

    fn offset(&self, index: &[usize]) -> Result<usize, String> {
        if index.len() != self.shape.len() {
            return Err(format!(
                "index {:?} does not match {} dimensions",
                index,
                self.shape.len()
            ));
        }
        let mut offset = 0;
        for (i, (pos, dim)) in index.iter().zip(&self.shape).enumerate() {
            if pos >= dim {
                return Err(format!("index {pos} out of bounds for axis {i} of size {dim}"));
            }
            offset = offset * dim + pos;
        }
        Ok(offset)
    }

    pub fn get(&self, index: &[usize]) -> Result<f64, String> {
        Ok(self.data[self.offset(index)?])
    }

    pub fn set(&mut self, index: &[usize], value: f64) -> Result<(), String> {
        let offset = self.offset(index)?;
        self.data[offset] = match self.dtype {
            Dtype::UInt8 => (value as u8) as f64,
            Dtype::Float64 => value,
        };
        Ok(())
    }

    fn element(&self, value: f64) -> Dynamic {
        match self.dtype {
            Dtype::UInt8 => Dynamic::from(value as INT),
            Dtype::Float64 => Dynamic::from(value as FLOAT),
        }
    }

    /// Nested script arrays mirroring the shape.
    pub fn to_nested(&self) -> Dynamic {
        if self.shape.is_empty() {
            return self
                .data
                .first()
                .map(|v| self.element(*v))
                .unwrap_or(Dynamic::UNIT);
        }
        self.nest(0, 0)
    }

    fn nest(&self, axis: usize, start: usize) -> Dynamic {
        let stride: usize = self.shape[axis + 1..].iter().product();
        let items: Array = (0..self.shape[axis])
            .map(|i| {
                let offset = start + i * stride;
                if axis + 1 == self.shape.len() {
                    self.element(self.data[offset])
                } else {
                    self.nest(axis + 1, offset)
                }
            })
            .collect();
        Dynamic::from_array(items)
    }
}

fn flatten_into(
    value: &Dynamic,
    depth: usize,
    shape: &mut Vec<usize>,
    data: &mut Vec<f64>,
) -> Result<(), String> {
    if value.is_array() {
        let items = value.clone().into_array().map_err(|e| e.to_string())?;
        if shape.len() == depth {
            if !data.is_empty() {
                return Err("ragged nested array".to_string());
            }
            shape.push(items.len());
        } else if shape[depth] != items.len() {
            return Err("ragged nested array".to_string());
        }
        for item in &items {
            flatten_into(item, depth + 1, shape, data)?;
        }
        return Ok(());
    }
    if depth != shape.len() {
        return Err("ragged nested array".to_string());
    }
    let number = as_number(value)
        .ok_or_else(|| format!("expected a number, got {}", value.type_name()))?;
    data.push(number);
    Ok(())
}

impl fmt::Display for NdArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_axis(
            arr: &NdArray,
            f: &mut fmt::Formatter<'_>,
            axis: usize,
            start: usize,
        ) -> fmt::Result {
            let stride: usize = arr.shape[axis + 1..].iter().product();
            f.write_str("[")?;
            for i in 0..arr.shape[axis] {
                if i > 0 {
                    f.write_str(", ")?;
                }
                let offset = start + i * stride;
                if axis + 1 == arr.shape.len() {
                    match arr.dtype {
                        Dtype::UInt8 => write!(f, "{}", arr.data[offset] as u8)?,
                        Dtype::Float64 => write!(f, "{:?}", arr.data[offset])?,
                    }
                } else {
                    write_axis(arr, f, axis + 1, offset)?;
                }
            }
            f.write_str("]")
        }

        f.write_str("array(")?;
        if self.shape.is_empty() {
            write!(f, "{:?}", self.data.first().copied().unwrap_or_default())?;
        } else {
            write_axis(self, f, 0, 0)?;
        }
        write!(f, ", dtype={})", self.dtype.name())
    }
}

/// A shape argument: an integer or an array of integers.
pub fn shape_from(value: &Dynamic) -> ScriptResult<Vec<usize>> {
    if let Ok(n) = value.as_int() {
        return Ok(vec![as_size(n, "dimension")?]);
    }
    if value.is_array() {
        let items = value.clone().into_array().map_err(|e| e.to_string())?;
        return items
            .iter()
            .map(|item| -> ScriptResult<usize> {
                let n = item
                    .as_int()
                    .map_err(|_| format!("shape entries must be integers, got {}", item.type_name()))?;
                as_size(n, "dimension")
            })
            .collect();
    }
    Err(format!("expected a shape, got {}", value.type_name()).into())
}

fn register_op(engine: &mut Engine, name: &str, op: fn(f64, f64) -> f64) {
    engine.register_fn(name, move |a: NdArray, b: NdArray| -> ScriptResult<NdArray> {
        a.zip_with(&b, op).map_err(Into::into)
    });
    engine.register_fn(name, move |a: NdArray, b: FLOAT| a.map(|x| op(x, b)));
    engine.register_fn(name, move |a: NdArray, b: INT| a.map(|x| op(x, b as f64)));
    engine.register_fn(name, move |a: FLOAT, b: NdArray| b.map(|x| op(a, x)));
    engine.register_fn(name, move |a: INT, b: NdArray| b.map(|x| op(a as f64, x)));
}

fn register_unary(module: &mut Module, name: &str, f: fn(f64) -> f64) {
    module.set_native_fn(name, move |a: NdArray| -> ScriptResult<NdArray> { Ok(a.map(f)) });
}

pub fn register(engine: &mut Engine) {
    engine.register_type_with_name::<NdArray>("NdArray");

    let mut np = Module::new();
    np.set_native_fn("array", |value: Dynamic| -> ScriptResult<NdArray> {
        NdArray::from_nested(&value).map_err(Into::into)
    });
    np.set_native_fn("zeros", |shape: Dynamic| -> ScriptResult<NdArray> {
        NdArray::filled(shape_from(&shape)?, 0.0).map_err(Into::into)
    });
    np.set_native_fn("ones", |shape: Dynamic| -> ScriptResult<NdArray> {
        NdArray::filled(shape_from(&shape)?, 1.0).map_err(Into::into)
    });
    np.set_native_fn("full", |shape: Dynamic, value: Dynamic| -> ScriptResult<NdArray> {
        let fill = as_number(&value).ok_or("fill value must be a number")?;
        NdArray::filled(shape_from(&shape)?, fill).map_err(Into::into)
    });
    np.set_native_fn("linspace", |start: Dynamic, stop: Dynamic, num: INT| -> ScriptResult<NdArray> {
        let start = as_number(&start).ok_or("start must be a number")?;
        let stop = as_number(&stop).ok_or("stop must be a number")?;
        let num = as_size(num, "num")?;
        element_count(&[num])?;
        let data: Vec<f64> = match num {
            0 => Vec::new(),
            1 => vec![start],
            _ => {
                let step = (stop - start) / (num - 1) as f64;
                (0..num).map(|i| start + step * i as f64).collect()
            }
        };
        NdArray::new(vec![num], data, Dtype::Float64).map_err(Into::into)
    });
    np.set_native_fn("arange", |start: Dynamic, stop: Dynamic, step: Dynamic| -> ScriptResult<NdArray> {
        let start = as_number(&start).ok_or("start must be a number")?;
        let stop = as_number(&stop).ok_or("stop must be a number")?;
        let step = as_number(&step).ok_or("step must be a number")?;
        if step == 0.0 {
            return Err("step must not be zero".into());
        }
        let span = ((stop - start) / step).ceil();
        if !span.is_finite() || span > MAX_ELEMENTS as f64 {
            return Err(format!("arange would produce more than {MAX_ELEMENTS} elements").into());
        }
        let count = span.max(0.0) as usize;
        let data: Vec<f64> = (0..count).map(|i| start + step * i as f64).collect();
        NdArray::new(vec![count], data, Dtype::Float64).map_err(Into::into)
    });
    register_unary(&mut np, "sin", f64::sin);
    register_unary(&mut np, "cos", f64::cos);
    register_unary(&mut np, "abs", f64::abs);
    register_unary(&mut np, "sqrt", f64::sqrt);
    register_unary(&mut np, "exp", f64::exp);
    engine.register_static_module("np", np.into());

    engine.register_get("shape", |a: &mut NdArray| -> Array {
        a.shape.iter().map(|d| Dynamic::from(*d as INT)).collect()
    });
    engine.register_get("ndim", |a: &mut NdArray| a.ndim() as INT);
    engine.register_get("size", |a: &mut NdArray| a.data.len() as INT);
    engine.register_get("dtype", |a: &mut NdArray| a.dtype.name().to_string());
    engine.register_fn("min", |a: &mut NdArray| -> ScriptResult<FLOAT> {
        a.min().ok_or_else(|| "min of an empty array".into())
    });
    engine.register_fn("max", |a: &mut NdArray| -> ScriptResult<FLOAT> {
        a.max().ok_or_else(|| "max of an empty array".into())
    });
    engine.register_fn("sum", |a: &mut NdArray| a.data.iter().sum::<f64>());
    engine.register_fn("mean", |a: &mut NdArray| -> ScriptResult<FLOAT> {
        if a.data.is_empty() {
            return Err("mean of an empty array".into());
        }
        Ok(a.data.iter().sum::<f64>() / a.data.len() as f64)
    });
    engine.register_fn("astype", |a: &mut NdArray, dtype: &str| -> ScriptResult<NdArray> {
        let dtype = Dtype::parse(dtype).ok_or_else(|| format!("unsupported dtype '{dtype}'"))?;
        Ok(a.astype(dtype))
    });
    engine.register_fn("reshape", |a: &mut NdArray, shape: Dynamic| -> ScriptResult<NdArray> {
        a.reshape(shape_from(&shape)?).map_err(Into::into)
    });
    engine.register_fn("get", |a: &mut NdArray, index: Dynamic| -> ScriptResult<Dynamic> {
        let value = a.get(&shape_from(&index)?)?;
        Ok(a.element(value))
    });
    engine.register_fn("set", |a: &mut NdArray, index: Dynamic, value: Dynamic| -> ScriptResult<()> {
        let number = as_number(&value).ok_or("value must be a number")?;
        a.set(&shape_from(&index)?, number).map_err(Into::into)
    });
    engine.register_fn("to_list", |a: &mut NdArray| a.to_nested());
    engine.register_fn("to_string", |a: &mut NdArray| a.to_string());
    engine.register_fn("to_debug", |a: &mut NdArray| a.to_string());

    register_op(engine, "+", |a, b| a + b);
    register_op(engine, "-", |a, b| a - b);
    register_op(engine, "*", |a, b| a * b);
    register_op(engine, "/", |a, b| a / b);
}
