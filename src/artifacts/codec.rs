//! Conversion of arbitrary snippet values, or files on disk, into base64
//! image payloads.
//!
//! In-memory values go through an ordered chain of probes; the first probe
//! that recognizes the value wins. A probe that fails is logged and the
//! chain moves on, so a broken candidate never aborts a request.

use super::{image_format_for, EncodedImage};
#[cfg(feature = "array")]
use crate::bindings::array::{Dtype, NdArray};
#[cfg(feature = "imaging")]
use crate::bindings::imaging::ImageObj;
#[cfg(feature = "plotting")]
use crate::bindings::plot::Figure;
use crate::bindings::Capabilities;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rhai::{Dynamic, FnPtr, Map};
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use thiserror::Error;

/// Name of the map entry holding an export function pointer.
pub const EXPORT_FN: &str = "to_image";

const MAGIC_LEN: u64 = 32;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[cfg(feature = "imaging")]
    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("failed to read image file: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Value(String),
}

/// Runs a value's export function inside the interpreter that created it.
pub trait Exporter {
    fn export(&self, function: &FnPtr) -> Result<Dynamic, String>;
}

type ProbeResult = Result<Option<EncodedImage>, CodecError>;
type Probe = fn(&ImageCodec<'_>, &Dynamic) -> ProbeResult;

const PROBES: [(&str, Probe); 8] = [
    ("blob", probe_blob),
    ("data-url", probe_data_url),
    ("file-path", probe_path),
    ("base64", probe_base64),
    ("exportable", probe_exportable),
    ("image", probe_image),
    ("array", probe_array),
    ("figure", probe_figure),
];

pub struct ImageCodec<'a> {
    caps: Capabilities,
    exporter: Option<&'a dyn Exporter>,
}

impl<'a> ImageCodec<'a> {
    pub fn new(caps: Capabilities) -> Self {
        Self {
            caps,
            exporter: None,
        }
    }

    pub fn with_exporter(mut self, exporter: &'a dyn Exporter) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Encode a value as an image, or `None` if nothing recognizes it.
    pub fn encode_value(&self, value: &Dynamic) -> Option<EncodedImage> {
        if value.is_unit() {
            return None;
        }
        for (name, probe) in PROBES {
            match probe(self, value) {
                Ok(Some(encoded)) => return Some(encoded),
                Ok(None) => {}
                Err(e) => tracing::debug!(probe = name, error = %e, "image probe failed"),
            }
        }
        None
    }
}

fn probe_blob(_: &ImageCodec<'_>, value: &Dynamic) -> ProbeResult {
    if !value.is_blob() {
        return Ok(None);
    }
    let blob = value.clone().into_blob().map_err(|t| CodecError::Value(t.to_string()))?;
    Ok((!blob.is_empty()).then(|| encode_bytes(&blob, "png")))
}

fn probe_data_url(_: &ImageCodec<'_>, value: &Dynamic) -> ProbeResult {
    match text_of(value) {
        Some(text) if text.starts_with("data:image") => decode_data_url(&text).map(Some),
        _ => Ok(None),
    }
}

fn probe_path(_: &ImageCodec<'_>, value: &Dynamic) -> ProbeResult {
    let Some(text) = text_of(value) else {
        return Ok(None);
    };
    let path = Path::new(&text);
    if image_format_for(path).is_none() || !path.is_file() {
        return Ok(None);
    }
    encode_file(path)
}

fn probe_base64(_: &ImageCodec<'_>, value: &Dynamic) -> ProbeResult {
    match text_of(value) {
        Some(text) => decode_base64(&text, "png"),
        None => Ok(None),
    }
}

fn probe_exportable(codec: &ImageCodec<'_>, value: &Dynamic) -> ProbeResult {
    let (Some(exporter), Some(map)) = (codec.exporter, value.read_lock::<Map>()) else {
        return Ok(None);
    };
    let Some(function) = map.get(EXPORT_FN).and_then(|f| f.clone().try_cast::<FnPtr>()) else {
        return Ok(None);
    };
    drop(map);
    let exported = exporter.export(&function).map_err(CodecError::Value)?;
    if exported.is_blob() {
        return probe_blob(codec, &exported);
    }
    match text_of(&exported) {
        Some(text) if text.starts_with("data:image") => decode_data_url(&text).map(Some),
        Some(text) => decode_base64(&text, "png"),
        None => Err(CodecError::Value(format!(
            "export function returned {}",
            exported.type_name()
        ))),
    }
}

#[cfg(feature = "imaging")]
fn probe_image(codec: &ImageCodec<'_>, value: &Dynamic) -> ProbeResult {
    if !codec.caps.image {
        return Ok(None);
    }
    match value.read_lock::<ImageObj>() {
        Some(img) => Ok(Some(encode_bytes(&img.to_png()?, "png"))),
        None => Ok(None),
    }
}

#[cfg(all(feature = "array", feature = "imaging"))]
fn probe_array(codec: &ImageCodec<'_>, value: &Dynamic) -> ProbeResult {
    if !(codec.caps.array && codec.caps.image) {
        return Ok(None);
    }
    match value.read_lock::<NdArray>() {
        Some(arr) => Ok(Some(encode_bytes(&array_to_image(&arr)?.to_png()?, "png"))),
        None => Ok(None),
    }
}

#[cfg(feature = "plotting")]
fn probe_figure(codec: &ImageCodec<'_>, value: &Dynamic) -> ProbeResult {
    if !codec.caps.plot {
        return Ok(None);
    }
    match value.read_lock::<Figure>() {
        Some(figure) => Ok(Some(encode_figure(&figure)?)),
        None => Ok(None),
    }
}

/// Stands in for a probe whose library is not compiled in.
#[allow(dead_code)]
fn probe_absent(_: &ImageCodec<'_>, _: &Dynamic) -> ProbeResult {
    Ok(None)
}

#[cfg(not(feature = "imaging"))]
use self::probe_absent as probe_image;
#[cfg(not(all(feature = "array", feature = "imaging")))]
use self::probe_absent as probe_array;
#[cfg(not(feature = "plotting"))]
use self::probe_absent as probe_figure;

fn text_of(value: &Dynamic) -> Option<String> {
    if value.is_string() {
        value.clone().into_string().ok()
    } else {
        None
    }
}

pub fn encode_bytes(bytes: &[u8], format: &str) -> EncodedImage {
    EncodedImage {
        data: STANDARD.encode(bytes),
        format: format.to_string(),
        size_bytes: bytes.len(),
    }
}

#[cfg(feature = "plotting")]
pub fn encode_figure(figure: &Figure) -> Result<EncodedImage, CodecError> {
    Ok(encode_bytes(&figure.to_png()?, "png"))
}

/// Accept already-encoded data: whitespace is ignored and the payload must
/// decode to at least one byte.
fn decode_base64(text: &str, format: &str) -> ProbeResult {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Ok(None);
    }
    let decoded = STANDARD.decode(compact.as_bytes())?;
    if decoded.is_empty() {
        return Ok(None);
    }
    Ok(Some(EncodedImage {
        data: compact,
        format: format.to_string(),
        size_bytes: decoded.len(),
    }))
}

/// `data:image/<subtype>[;params];base64,<payload>`
fn decode_data_url(url: &str) -> Result<EncodedImage, CodecError> {
    let (header, payload) = url
        .split_once(',')
        .ok_or_else(|| CodecError::Value("data URL has no payload".to_string()))?;
    let mut params = header.strip_prefix("data:image/").unwrap_or_default().split(';');
    let subtype = params
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("png")
        .to_ascii_lowercase();
    if !params.any(|p| p.trim().eq_ignore_ascii_case("base64")) {
        return Err(CodecError::Value("data URL is not base64-encoded".to_string()));
    }
    let format = if subtype == "jpg" { "jpeg".to_string() } else { subtype };
    decode_base64(payload, &format)?
        .ok_or_else(|| CodecError::Value("data URL payload is empty".to_string()))
}

fn magic_matches(format: &str, head: &[u8]) -> bool {
    match format {
        "png" => head.starts_with(b"\x89PNG\r\n\x1a\n"),
        "jpeg" => head.starts_with(&[0xFF, 0xD8, 0xFF]),
        "gif" => head.starts_with(b"GIF87a") || head.starts_with(b"GIF89a"),
        "bmp" => head.starts_with(b"BM"),
        "webp" => head.len() >= 12 && &head[..4] == b"RIFF" && &head[8..12] == b"WEBP",
        _ => false,
    }
}

/// Encode an image file whose extension is supported and whose leading
/// bytes match that format's signature.
pub fn encode_file(path: &Path) -> ProbeResult {
    let Some(format) = image_format_for(path) else {
        return Ok(None);
    };
    let mut head = Vec::with_capacity(MAGIC_LEN as usize);
    File::open(path)?.take(MAGIC_LEN).read_to_end(&mut head)?;
    if !magic_matches(format, &head) {
        tracing::debug!(path = %path.display(), format, "signature mismatch, not an image");
        return Ok(None);
    }
    let bytes = fs::read(path)?;
    if bytes.is_empty() {
        return Ok(None);
    }
    Ok(Some(encode_bytes(&bytes, format)))
}

/// Replace NaN with zero and clamp infinities to the finite range.
#[cfg(all(feature = "array", feature = "imaging"))]
fn nan_to_num(data: &[f64]) -> Vec<f64> {
    let finite = data.iter().copied().filter(|v| v.is_finite());
    let lo = finite.clone().fold(f64::INFINITY, f64::min);
    let hi = finite.fold(f64::NEG_INFINITY, f64::max);
    data.iter()
        .map(|&v| {
            if v.is_nan() {
                0.0
            } else if v == f64::INFINITY {
                if hi.is_finite() { hi.max(0.0) } else { 0.0 }
            } else if v == f64::NEG_INFINITY {
                if lo.is_finite() { lo.min(0.0) } else { 0.0 }
            } else {
                v
            }
        })
        .collect()
}

/// Convert an array to 8-bit pixels. Non-`uint8` arrays are rescaled
/// linearly from their min/max to `0..=255`; a constant array becomes
/// all zeros.
#[cfg(all(feature = "array", feature = "imaging"))]
pub fn array_to_image(arr: &NdArray) -> Result<ImageObj, CodecError> {
    if !matches!(arr.ndim(), 2 | 3) {
        return Err(CodecError::Value(format!(
            "array of shape {:?} is not an image",
            arr.shape()
        )));
    }
    let pixels: Vec<u8> = if arr.dtype() == Dtype::UInt8 {
        arr.data().iter().map(|v| *v as u8).collect()
    } else {
        let clean = nan_to_num(arr.data());
        let lo = clean.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = clean.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if hi > lo {
            clean
                .iter()
                .map(|v| ((v - lo) / (hi - lo) * 255.0) as u8)
                .collect()
        } else {
            vec![0; clean.len()]
        }
    };
    ImageObj::from_pixels(arr.shape(), pixels).map_err(CodecError::Value)
}
