//! `Image`: raster images backed by the `image` crate.

#[cfg(feature = "array")]
use super::array::NdArray;
use super::{as_number, as_size, resolve_in, BindingContext, ScriptResult};
use image::imageops::FilterType;
use image::{
    ColorType, DynamicImage, GrayImage, ImageFormat, Luma, Rgb, RgbImage, Rgba, RgbaImage,
};
use rhai::{Array, Dynamic, Engine, Module, INT};
use std::fmt;
use std::io::Cursor;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct ImageObj {
    inner: DynamicImage,
}

/// Upper bound on `width * height` for images created or resized by a script.
pub const MAX_PIXELS: u64 = 1 << 26;

fn dimension(value: usize, what: &str) -> Result<u32, String> {
    u32::try_from(value).map_err(|_| format!("{what} {value} is too large"))
}

fn canvas(width: INT, height: INT) -> ScriptResult<(u32, u32)> {
    let width = dimension(as_size(width, "width")?, "width")?;
    let height = dimension(as_size(height, "height")?, "height")?;
    if u64::from(width) * u64::from(height) > MAX_PIXELS {
        return Err(format!("image of {width}x{height} exceeds {MAX_PIXELS} pixels").into());
    }
    Ok((width, height))
}

impl ImageObj {
    /// Normalizes the pixel layout to one of the `L`, `RGB`, `RGBA` modes.
    pub fn from_dynamic(inner: DynamicImage) -> Self {
        let color = inner.color();
        let inner = match color {
            ColorType::L8 | ColorType::Rgb8 | ColorType::Rgba8 => inner,
            _ if color.has_alpha() => DynamicImage::ImageRgba8(inner.to_rgba8()),
            _ if color.channel_count() == 1 => DynamicImage::ImageLuma8(inner.to_luma8()),
            _ => DynamicImage::ImageRgb8(inner.to_rgb8()),
        };
        Self { inner }
    }

    pub fn blank(mode: &str, width: u32, height: u32, color: &[u8]) -> Result<Self, String> {
        let channel = |i: usize, default: u8| color.get(i).copied().unwrap_or(default);
        let inner = match mode {
            "L" => DynamicImage::ImageLuma8(GrayImage::from_pixel(
                width,
                height,
                Luma([channel(0, 0)]),
            )),
            "RGB" => DynamicImage::ImageRgb8(RgbImage::from_pixel(
                width,
                height,
                Rgb([channel(0, 0), channel(1, 0), channel(2, 0)]),
            )),
            "RGBA" => {
                let alpha = if color.len() == 3 { 255 } else { channel(3, 0) };
                DynamicImage::ImageRgba8(RgbaImage::from_pixel(
                    width,
                    height,
                    Rgba([channel(0, 0), channel(1, 0), channel(2, 0), alpha]),
                ))
            }
            other => return Err(format!("unsupported image mode '{other}'")),
        };
        Ok(Self { inner })
    }

    /// Interpret 8-bit pixels by shape: `(h, w)` is grayscale, `(h, w, 4)`
    /// is RGBA and any other three-dimensional shape is RGB.
    pub fn from_pixels(shape: &[usize], pixels: Vec<u8>) -> Result<Self, String> {
        let mismatch = || format!("pixel buffer does not match shape {:?}", shape);
        let inner = match shape {
            [h, w] => DynamicImage::ImageLuma8(
                GrayImage::from_raw(dimension(*w, "width")?, dimension(*h, "height")?, pixels)
                    .ok_or_else(mismatch)?,
            ),
            [h, w, 4] => DynamicImage::ImageRgba8(
                RgbaImage::from_raw(dimension(*w, "width")?, dimension(*h, "height")?, pixels)
                    .ok_or_else(mismatch)?,
            ),
            [h, w, _] => DynamicImage::ImageRgb8(
                RgbImage::from_raw(dimension(*w, "width")?, dimension(*h, "height")?, pixels)
                    .ok_or_else(mismatch)?,
            ),
            _ => return Err(format!("cannot build an image from shape {:?}", shape)),
        };
        Ok(Self { inner })
    }

    /// Values are cast to 8 bits as-is; out-of-range values saturate.
    #[cfg(feature = "array")]
    pub fn from_array(arr: &NdArray) -> Result<Self, String> {
        let pixels = arr.data().iter().map(|v| *v as u8).collect();
        Self::from_pixels(arr.shape(), pixels)
    }

    pub fn inner(&self) -> &DynamicImage {
        &self.inner
    }

    pub fn mode(&self) -> &'static str {
        match self.inner.color() {
            ColorType::L8 => "L",
            ColorType::Rgb8 => "RGB",
            _ => "RGBA",
        }
    }

    pub fn to_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut buffer = Cursor::new(Vec::new());
        self.inner.write_to(&mut buffer, ImageFormat::Png)?;
        Ok(buffer.into_inner())
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        let format = ImageFormat::from_path(path).map_err(|e| e.to_string())?;
        let result = match format {
            ImageFormat::Jpeg => DynamicImage::ImageRgb8(self.inner.to_rgb8())
                .save_with_format(path, format),
            ImageFormat::Gif => DynamicImage::ImageRgba8(self.inner.to_rgba8())
                .save_with_format(path, format),
            _ => self.inner.save_with_format(path, format),
        };
        result.map_err(|e| format!("failed to save '{}': {}", path.display(), e))
    }

    fn convert(&self, mode: &str) -> Result<Self, String> {
        let inner = match mode {
            "L" => DynamicImage::ImageLuma8(self.inner.to_luma8()),
            "RGB" => DynamicImage::ImageRgb8(self.inner.to_rgb8()),
            "RGBA" => DynamicImage::ImageRgba8(self.inner.to_rgba8()),
            other => return Err(format!("unsupported image mode '{other}'")),
        };
        Ok(Self { inner })
    }

    fn check_bounds(&self, x: INT, y: INT) -> Result<(u32, u32), String> {
        let (w, h) = (self.inner.width() as INT, self.inner.height() as INT);
        if x < 0 || y < 0 || x >= w || y >= h {
            return Err(format!("pixel ({x}, {y}) outside {w}x{h} image"));
        }
        Ok((x as u32, y as u32))
    }

    fn putpixel(&mut self, x: INT, y: INT, color: &[u8]) -> Result<(), String> {
        let (x, y) = self.check_bounds(x, y)?;
        let channel = |i: usize| color.get(i).or(color.first()).copied().unwrap_or(0);
        match &mut self.inner {
            DynamicImage::ImageLuma8(img) => img.put_pixel(x, y, Luma([channel(0)])),
            DynamicImage::ImageRgb8(img) => {
                img.put_pixel(x, y, Rgb([channel(0), channel(1), channel(2)]))
            }
            DynamicImage::ImageRgba8(img) => {
                let alpha = color.get(3).copied().unwrap_or(255);
                img.put_pixel(x, y, Rgba([channel(0), channel(1), channel(2), alpha]))
            }
            _ => return Err("unsupported pixel layout".to_string()),
        }
        Ok(())
    }

    fn getpixel(&self, x: INT, y: INT) -> Result<Dynamic, String> {
        let (x, y) = self.check_bounds(x, y)?;
        let channels: Vec<u8> = match &self.inner {
            DynamicImage::ImageLuma8(img) => return Ok(Dynamic::from(img.get_pixel(x, y)[0] as INT)),
            DynamicImage::ImageRgb8(img) => img.get_pixel(x, y).0.to_vec(),
            DynamicImage::ImageRgba8(img) => img.get_pixel(x, y).0.to_vec(),
            _ => return Err("unsupported pixel layout".to_string()),
        };
        Ok(Dynamic::from_array(
            channels.into_iter().map(|c| Dynamic::from(c as INT)).collect(),
        ))
    }
}

impl fmt::Display for ImageObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Image mode={} size={}x{}>",
            self.mode(),
            self.inner.width(),
            self.inner.height()
        )
    }
}

/// A color argument: a single intensity or an array of channel values.
fn color_from(value: &Dynamic) -> ScriptResult<Vec<u8>> {
    if value.is_unit() {
        return Ok(Vec::new());
    }
    if let Some(n) = as_number(value) {
        return Ok(vec![n.clamp(0.0, 255.0) as u8; 4]);
    }
    if value.is_array() {
        let items = value.clone().into_array().map_err(|e| e.to_string())?;
        return items
            .iter()
            .map(|item| -> ScriptResult<u8> {
                as_number(item)
                    .map(|n| n.clamp(0.0, 255.0) as u8)
                    .ok_or_else(|| format!("color channels must be numbers, got {}", item.type_name()).into())
            })
            .collect();
    }
    Err(format!("expected a color, got {}", value.type_name()).into())
}

fn blank(mode: &str, width: INT, height: INT, color: &Dynamic) -> ScriptResult<ImageObj> {
    let (width, height) = canvas(width, height)?;
    ImageObj::blank(mode, width, height, &color_from(color)?).map_err(Into::into)
}

pub fn register(engine: &mut Engine, ctx: &BindingContext, with_arrays: bool) {
    engine.register_type_with_name::<ImageObj>("Image");

    let mut module = Module::new();
    module.set_native_fn("create", |mode: &str, width: INT, height: INT| -> ScriptResult<ImageObj> {
        blank(mode, width, height, &Dynamic::UNIT)
    });
    module.set_native_fn(
        "create",
        |mode: &str, width: INT, height: INT, color: Dynamic| -> ScriptResult<ImageObj> {
            blank(mode, width, height, &color)
        },
    );
    let workdir = ctx.workdir.clone();
    module.set_native_fn("open", move |path: &str| -> ScriptResult<ImageObj> {
        let resolved = resolve_in(&workdir, path);
        let img = image::open(&resolved)
            .map_err(|e| format!("failed to open '{}': {}", resolved.display(), e))?;
        Ok(ImageObj::from_dynamic(img))
    });
    #[cfg(feature = "array")]
    if with_arrays {
        module.set_native_fn("fromarray", |arr: NdArray| -> ScriptResult<ImageObj> {
            ImageObj::from_array(&arr).map_err(Into::into)
        });
    }
    #[cfg(not(feature = "array"))]
    let _ = with_arrays;
    engine.register_static_module("Image", module.into());

    engine.register_get("width", |img: &mut ImageObj| img.inner.width() as INT);
    engine.register_get("height", |img: &mut ImageObj| img.inner.height() as INT);
    engine.register_get("size", |img: &mut ImageObj| -> Array {
        vec![
            Dynamic::from(img.inner.width() as INT),
            Dynamic::from(img.inner.height() as INT),
        ]
    });
    engine.register_get("mode", |img: &mut ImageObj| img.mode().to_string());
    engine.register_fn(
        "putpixel",
        |img: &mut ImageObj, x: INT, y: INT, color: Dynamic| -> ScriptResult<()> {
            img.putpixel(x, y, &color_from(&color)?).map_err(Into::into)
        },
    );
    engine.register_fn("getpixel", |img: &mut ImageObj, x: INT, y: INT| -> ScriptResult<Dynamic> {
        img.getpixel(x, y).map_err(Into::into)
    });
    engine.register_fn("resize", |img: &mut ImageObj, width: INT, height: INT| -> ScriptResult<ImageObj> {
        let (width, height) = canvas(width, height)?;
        Ok(ImageObj {
            inner: img.inner.resize_exact(width, height, FilterType::Triangle),
        })
    });
    engine.register_fn("convert", |img: &mut ImageObj, mode: &str| -> ScriptResult<ImageObj> {
        img.convert(mode).map_err(Into::into)
    });
    let workdir = ctx.workdir.clone();
    engine.register_fn("save", move |img: &mut ImageObj, path: &str| -> ScriptResult<()> {
        img.save(&resolve_in(&workdir, path)).map_err(Into::into)
    });
    engine.register_fn("to_string", |img: &mut ImageObj| img.to_string());
    engine.register_fn("to_debug", |img: &mut ImageObj| img.to_string());
}
