//! `plt`: a small figure registry with a raster renderer.
//!
//! Figures are tracked per request inside [`PlotState`] rather than in a
//! process-wide registry, so concurrent requests never see each other's
//! figures. Rendering draws axes, lines, markers and bars; it draws no text.

use super::imaging::{ImageObj, MAX_PIXELS};
use super::{as_size, numbers_from, resolve_in, BindingContext, ScriptResult};
use image::{DynamicImage, Rgb, RgbImage};
use rhai::{Array, Dynamic, Engine, Module, INT};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::rc::Rc;

pub const DEFAULT_WIDTH: u32 = 640;
pub const DEFAULT_HEIGHT: u32 = 480;
const MARGIN: f64 = 40.0;
const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const AXES: Rgb<u8> = Rgb([64, 64, 64]);
const PALETTE: [[u8; 3]; 10] = [
    [31, 119, 180],
    [255, 127, 14],
    [44, 160, 44],
    [214, 39, 40],
    [148, 103, 189],
    [140, 86, 75],
    [227, 119, 194],
    [127, 127, 127],
    [188, 189, 34],
    [23, 190, 207],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeriesKind {
    Line,
    Scatter,
    Bar,
}

#[derive(Debug, Clone)]
struct Series {
    kind: SeriesKind,
    xs: Vec<f64>,
    ys: Vec<f64>,
}

#[derive(Debug)]
struct FigureData {
    width: u32,
    height: u32,
    title: Option<String>,
    series: Vec<Series>,
}

/// Handle to a figure. Clones share the same drawing.
#[derive(Debug, Clone)]
pub struct Figure {
    number: INT,
    data: Rc<RefCell<FigureData>>,
}

impl Figure {
    fn new(number: INT, width: u32, height: u32) -> Self {
        Self {
            number,
            data: Rc::new(RefCell::new(FigureData {
                width,
                height,
                title: None,
                series: Vec::new(),
            })),
        }
    }

    pub fn number(&self) -> INT {
        self.number
    }

    pub fn series_count(&self) -> usize {
        self.data.borrow().series.len()
    }

    fn add(&self, kind: SeriesKind, xs: Vec<f64>, ys: Vec<f64>) -> Result<(), String> {
        if xs.len() != ys.len() {
            return Err(format!(
                "x and y must have the same length, got {} and {}",
                xs.len(),
                ys.len()
            ));
        }
        self.data.borrow_mut().series.push(Series { kind, xs, ys });
        Ok(())
    }

    fn set_title(&self, title: &str) {
        self.data.borrow_mut().title = Some(title.to_string());
    }

    pub fn render(&self) -> ImageObj {
        let data = self.data.borrow();
        ImageObj::from_dynamic(DynamicImage::ImageRgb8(draw(&data)))
    }

    pub fn to_png(&self) -> Result<Vec<u8>, image::ImageError> {
        self.render().to_png()
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        self.render().save(path)
    }
}

impl fmt::Display for Figure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data.borrow();
        write!(
            f,
            "<Figure {} size={}x{} series={}",
            self.number,
            data.width,
            data.height,
            data.series.len()
        )?;
        if let Some(title) = &data.title {
            write!(f, " title={:?}", title)?;
        }
        write!(f, ">")
    }
}

#[derive(Debug, Default)]
struct Registry {
    figures: BTreeMap<INT, Figure>,
    current: Option<INT>,
}

/// Open figures of one request, keyed by figure number.
#[derive(Debug, Clone, Default)]
pub struct PlotState {
    inner: Rc<RefCell<Registry>>,
}

impl PlotState {
    pub fn new_figure(&self, width: u32, height: u32) -> Figure {
        let mut registry = self.inner.borrow_mut();
        let number = registry.figures.keys().next_back().map_or(1, |n| n + 1);
        let figure = Figure::new(number, width, height);
        registry.figures.insert(number, figure.clone());
        registry.current = Some(number);
        figure
    }

    /// Make figure `number` current, creating it if it does not exist.
    pub fn activate(&self, number: INT) -> Figure {
        let mut registry = self.inner.borrow_mut();
        let figure = registry
            .figures
            .entry(number)
            .or_insert_with(|| Figure::new(number, DEFAULT_WIDTH, DEFAULT_HEIGHT))
            .clone();
        registry.current = Some(number);
        figure
    }

    pub fn current_or_new(&self) -> Figure {
        let existing = {
            let registry = self.inner.borrow();
            registry
                .current
                .and_then(|n| registry.figures.get(&n).cloned())
        };
        match existing {
            Some(figure) => figure,
            None => self.new_figure(DEFAULT_WIDTH, DEFAULT_HEIGHT),
        }
    }

    pub fn fignums(&self) -> Vec<INT> {
        self.inner.borrow().figures.keys().copied().collect()
    }

    pub fn close(&self, number: INT) {
        let mut registry = self.inner.borrow_mut();
        registry.figures.remove(&number);
        if registry.current == Some(number) {
            registry.current = registry.figures.keys().next_back().copied();
        }
    }

    pub fn close_current(&self) {
        let current = self.inner.borrow().current;
        if let Some(number) = current {
            self.close(number);
        }
    }

    pub fn close_all(&self) {
        let mut registry = self.inner.borrow_mut();
        registry.figures.clear();
        registry.current = None;
    }

    /// Remove every open figure, returning them in figure-number order.
    pub fn drain(&self) -> Vec<Figure> {
        let mut registry = self.inner.borrow_mut();
        registry.current = None;
        std::mem::take(&mut registry.figures).into_values().collect()
    }
}

struct Frame {
    x_min: f64,
    x_max: f64,
    y_min: f64,
    y_max: f64,
    left: f64,
    right: f64,
    top: f64,
    bottom: f64,
}

impl Frame {
    fn fit(data: &FigureData) -> Self {
        let (mut x_min, mut x_max) = (f64::INFINITY, f64::NEG_INFINITY);
        let (mut y_min, mut y_max) = (f64::INFINITY, f64::NEG_INFINITY);
        for series in &data.series {
            for (&x, &y) in series.xs.iter().zip(&series.ys) {
                if !x.is_finite() || !y.is_finite() {
                    continue;
                }
                let (x_lo, x_hi) = match series.kind {
                    SeriesKind::Bar => (x - 0.5, x + 0.5),
                    _ => (x, x),
                };
                x_min = x_min.min(x_lo);
                x_max = x_max.max(x_hi);
                y_min = y_min.min(y);
                y_max = y_max.max(y);
                if series.kind == SeriesKind::Bar {
                    y_min = y_min.min(0.0);
                    y_max = y_max.max(0.0);
                }
            }
        }
        let (x_min, x_max) = padded(x_min, x_max);
        let (y_min, y_max) = padded(y_min, y_max);

        let margin = if f64::from(data.width.min(data.height)) > 4.0 * MARGIN {
            MARGIN
        } else {
            0.0
        };
        Self {
            x_min,
            x_max,
            y_min,
            y_max,
            left: margin,
            right: f64::from(data.width) - 1.0 - margin,
            top: margin,
            bottom: f64::from(data.height) - 1.0 - margin,
        }
    }

    fn project(&self, x: f64, y: f64) -> (i64, i64) {
        let px = self.left + (x - self.x_min) / (self.x_max - self.x_min) * (self.right - self.left);
        let py = self.bottom - (y - self.y_min) / (self.y_max - self.y_min) * (self.bottom - self.top);
        (px.round() as i64, py.round() as i64)
    }
}

fn padded(lo: f64, hi: f64) -> (f64, f64) {
    if !lo.is_finite() || !hi.is_finite() {
        return (0.0, 1.0);
    }
    if lo == hi {
        return (lo - 0.5, hi + 0.5);
    }
    let pad = (hi - lo) * 0.05;
    (lo - pad, hi + pad)
}

fn put(canvas: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u64) < u64::from(canvas.width()) && (y as u64) < u64::from(canvas.height()) {
        canvas.put_pixel(x as u32, y as u32, color);
    }
}

fn line(canvas: &mut RgbImage, (x0, y0): (i64, i64), (x1, y1): (i64, i64), color: Rgb<u8>) {
    let (dx, dy) = ((x1 - x0).abs(), -(y1 - y0).abs());
    let (sx, sy) = (if x0 < x1 { 1 } else { -1 }, if y0 < y1 { 1 } else { -1 });
    let (mut x, mut y, mut err) = (x0, y0, dx + dy);
    loop {
        put(canvas, x, y, color);
        if x == x1 && y == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

fn fill_rect(canvas: &mut RgbImage, (x0, y0): (i64, i64), (x1, y1): (i64, i64), color: Rgb<u8>) {
    for y in y0.min(y1)..=y0.max(y1) {
        for x in x0.min(x1)..=x0.max(x1) {
            put(canvas, x, y, color);
        }
    }
}

/// Smallest gap between neighbouring bar positions.
fn bar_spacing(xs: &[f64]) -> f64 {
    let mut sorted: Vec<f64> = xs.iter().copied().filter(|x| x.is_finite()).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|gap| *gap > 0.0)
        .fold(1.0, f64::min)
}

fn draw(data: &FigureData) -> RgbImage {
    let mut canvas = RgbImage::from_pixel(data.width.max(1), data.height.max(1), BACKGROUND);
    let frame = Frame::fit(data);

    let corners = [
        (frame.left as i64, frame.top as i64),
        (frame.right as i64, frame.top as i64),
        (frame.right as i64, frame.bottom as i64),
        (frame.left as i64, frame.bottom as i64),
    ];
    for i in 0..corners.len() {
        line(&mut canvas, corners[i], corners[(i + 1) % corners.len()], AXES);
    }

    for (index, series) in data.series.iter().enumerate() {
        let color = Rgb(PALETTE[index % PALETTE.len()]);
        let points = series
            .xs
            .iter()
            .zip(&series.ys)
            .map(|(&x, &y)| (x, y))
            .filter(|(x, y)| x.is_finite() && y.is_finite());
        match series.kind {
            SeriesKind::Line => {
                let projected: Vec<_> = points.map(|(x, y)| frame.project(x, y)).collect();
                for pair in projected.windows(2) {
                    line(&mut canvas, pair[0], pair[1], color);
                }
                if let [only] = projected.as_slice() {
                    put(&mut canvas, only.0, only.1, color);
                }
            }
            SeriesKind::Scatter => {
                for (x, y) in points {
                    let (cx, cy) = frame.project(x, y);
                    for dy in -3..=3i64 {
                        for dx in -3..=3i64 {
                            if dx * dx + dy * dy <= 9 {
                                put(&mut canvas, cx + dx, cy + dy, color);
                            }
                        }
                    }
                }
            }
            SeriesKind::Bar => {
                let half = bar_spacing(&series.xs) * 0.4;
                for (x, y) in points {
                    fill_rect(
                        &mut canvas,
                        frame.project(x - half, 0.0),
                        frame.project(x + half, y),
                        color,
                    );
                }
            }
        }
    }
    canvas
}

fn series_args(first: &Dynamic, second: Option<&Dynamic>) -> ScriptResult<(Vec<f64>, Vec<f64>)> {
    match second {
        Some(ys) => Ok((numbers_from(first)?, numbers_from(ys)?)),
        None => {
            let ys = numbers_from(first)?;
            let xs = (0..ys.len()).map(|i| i as f64).collect();
            Ok((xs, ys))
        }
    }
}

fn add_series(
    figure: &Figure,
    kind: SeriesKind,
    first: &Dynamic,
    second: Option<&Dynamic>,
) -> ScriptResult<()> {
    let (xs, ys) = series_args(first, second)?;
    figure.add(kind, xs, ys).map_err(Into::into)
}

fn figure_size(width: INT, height: INT) -> ScriptResult<(u32, u32)> {
    let convert = |value: INT, what: &str| -> ScriptResult<u32> {
        let size = as_size(value, what)?;
        match u32::try_from(size) {
            Ok(v) if v > 0 => Ok(v),
            _ => Err(format!("figure {what} must be positive, got {value}").into()),
        }
    };
    let (width, height) = (convert(width, "width")?, convert(height, "height")?);
    if u64::from(width) * u64::from(height) > MAX_PIXELS {
        return Err(format!("figure of {width}x{height} exceeds {MAX_PIXELS} pixels").into());
    }
    Ok((width, height))
}

pub fn register(engine: &mut Engine, ctx: &BindingContext) {
    engine.register_type_with_name::<Figure>("Figure");

    let mut module = Module::new();
    let plots = ctx.plots.clone();
    module.set_native_fn("figure", move || -> ScriptResult<Figure> {
        Ok(plots.new_figure(DEFAULT_WIDTH, DEFAULT_HEIGHT))
    });
    let plots = ctx.plots.clone();
    module.set_native_fn("figure", move |number: INT| -> ScriptResult<Figure> {
        Ok(plots.activate(number))
    });
    let plots = ctx.plots.clone();
    module.set_native_fn("figure", move |width: INT, height: INT| -> ScriptResult<Figure> {
        let (width, height) = figure_size(width, height)?;
        Ok(plots.new_figure(width, height))
    });

    for (name, kind) in [
        ("plot", SeriesKind::Line),
        ("scatter", SeriesKind::Scatter),
        ("bar", SeriesKind::Bar),
    ] {
        if kind != SeriesKind::Scatter {
            let plots = ctx.plots.clone();
            module.set_native_fn(name, move |ys: Dynamic| -> ScriptResult<()> {
                add_series(&plots.current_or_new(), kind, &ys, None)
            });
        }
        let plots = ctx.plots.clone();
        module.set_native_fn(name, move |xs: Dynamic, ys: Dynamic| -> ScriptResult<()> {
            add_series(&plots.current_or_new(), kind, &xs, Some(&ys))
        });

        if kind != SeriesKind::Scatter {
            engine.register_fn(name, move |fig: &mut Figure, ys: Dynamic| -> ScriptResult<()> {
                add_series(fig, kind, &ys, None)
            });
        }
        engine.register_fn(
            name,
            move |fig: &mut Figure, xs: Dynamic, ys: Dynamic| -> ScriptResult<()> {
                add_series(fig, kind, &xs, Some(&ys))
            },
        );
    }

    let plots = ctx.plots.clone();
    module.set_native_fn("title", move |text: &str| -> ScriptResult<()> {
        plots.current_or_new().set_title(text);
        Ok(())
    });
    let plots = ctx.plots.clone();
    let workdir = ctx.workdir.clone();
    module.set_native_fn("savefig", move |path: &str| -> ScriptResult<()> {
        plots
            .current_or_new()
            .save(&resolve_in(&workdir, path))
            .map_err(Into::into)
    });
    let plots = ctx.plots.clone();
    module.set_native_fn("gcf", move || -> ScriptResult<Figure> { Ok(plots.current_or_new()) });
    let plots = ctx.plots.clone();
    module.set_native_fn("get_fignums", move || -> ScriptResult<Array> {
        Ok(plots.fignums().into_iter().map(Dynamic::from).collect())
    });
    let plots = ctx.plots.clone();
    module.set_native_fn("close", move || -> ScriptResult<()> {
        plots.close_current();
        Ok(())
    });
    let plots = ctx.plots.clone();
    module.set_native_fn("close", move |number: INT| -> ScriptResult<()> {
        plots.close(number);
        Ok(())
    });
    let plots = ctx.plots.clone();
    module.set_native_fn("close_all", move || -> ScriptResult<()> {
        plots.close_all();
        Ok(())
    });
    engine.register_static_module("plt", module.into());

    engine.register_get("number", |fig: &mut Figure| fig.number());
    engine.register_fn("title", |fig: &mut Figure, text: &str| fig.set_title(text));
    let workdir = ctx.workdir.clone();
    engine.register_fn("savefig", move |fig: &mut Figure, path: &str| -> ScriptResult<()> {
        fig.save(&resolve_in(&workdir, path)).map_err(Into::into)
    });
    engine.register_fn("to_string", |fig: &mut Figure| fig.to_string());
    engine.register_fn("to_debug", |fig: &mut Figure| fig.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn engine_with(state: &PlotState, workdir: PathBuf) -> Engine {
        let mut engine = Engine::new();
        let ctx = BindingContext {
            workdir: Rc::new(workdir),
            plots: state.clone(),
        };
        register(&mut engine, &ctx);
        engine
    }

    #[test]
    fn test_figure_numbers_increase() {
        let state = PlotState::default();
        assert_eq!(state.new_figure(10, 10).number(), 1);
        assert_eq!(state.new_figure(10, 10).number(), 2);
        state.close(1);
        assert_eq!(state.fignums(), vec![2]);
        assert_eq!(state.new_figure(10, 10).number(), 3);
    }

    #[test]
    fn test_current_or_new_reuses_current() {
        let state = PlotState::default();
        let first = state.current_or_new();
        let again = state.current_or_new();
        assert_eq!(first.number(), again.number());
        assert_eq!(state.fignums(), vec![1]);
    }

    #[test]
    fn test_close_current_falls_back_to_latest() {
        let state = PlotState::default();
        state.new_figure(10, 10);
        state.new_figure(10, 10);
        state.close_current();
        assert_eq!(state.current_or_new().number(), 1);
    }

    #[test]
    fn test_drain_empties_registry_in_order() {
        let state = PlotState::default();
        state.activate(5);
        state.activate(2);
        let drained: Vec<INT> = state.drain().iter().map(Figure::number).collect();
        assert_eq!(drained, vec![2, 5]);
        assert!(state.fignums().is_empty());
    }

    #[test]
    fn test_render_is_deterministic_png() {
        let state = PlotState::default();
        let fig = state.new_figure(120, 90);
        fig.add(SeriesKind::Line, vec![0.0, 1.0, 2.0], vec![1.0, 4.0, 9.0]).unwrap();
        fig.add(SeriesKind::Bar, vec![0.0, 1.0], vec![3.0, f64::NAN]).unwrap();
        let a = fig.to_png().unwrap();
        let b = fig.to_png().unwrap();
        assert!(a.starts_with(b"\x89PNG\r\n\x1a\n"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_render_draws_series_color() {
        let state = PlotState::default();
        let fig = state.new_figure(200, 200);
        fig.add(SeriesKind::Scatter, vec![0.5], vec![0.5]).unwrap();
        let img = fig.render().inner().to_rgb8();
        assert_eq!(img.get_pixel(100, 100).0, PALETTE[0]);
    }

    #[test]
    fn test_figure_size_limits() {
        assert_eq!(figure_size(800, 600).unwrap(), (800, 600));
        assert!(figure_size(0, 10).is_err());
        assert!(figure_size(1 << 20, 1 << 20).is_err());
    }

    #[test]
    fn test_mismatched_series_rejected() {
        let fig = PlotState::default().new_figure(10, 10);
        assert!(fig.add(SeriesKind::Line, vec![1.0], vec![1.0, 2.0]).is_err());
    }

    #[test]
    fn test_script_plot_and_savefig() {
        let dir = tempfile::tempdir().unwrap();
        let state = PlotState::default();
        let engine = engine_with(&state, dir.path().to_path_buf());
        engine
            .run(
                r#"
                plt::plot([1, 2, 3], [4.0, 1.5, 2]);
                plt::title("demo");
                plt::savefig("chart.png");
                let f = plt::figure(320, 240);
                f.scatter([1, 2], [3, 4]);
                f.bar([1, 2, 3]);
                "#,
            )
            .unwrap();
        assert!(dir.path().join("chart.png").is_file());
        assert_eq!(state.fignums(), vec![1, 2]);
        let figures = state.drain();
        assert_eq!(figures[1].series_count(), 2);
    }

    #[test]
    fn test_script_close_and_fignums() {
        let state = PlotState::default();
        let engine = engine_with(&state, std::env::temp_dir());
        let nums: Array = engine
            .eval("plt::figure(); plt::figure(); plt::close(1); plt::get_fignums()")
            .unwrap();
        assert_eq!(nums.len(), 1);
        assert_eq!(nums[0].as_int().unwrap(), 2);
        engine.run("plt::close_all();").unwrap();
        assert!(state.fignums().is_empty());
    }
}
