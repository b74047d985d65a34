use std::io::Cursor;

use anyhow::Context;
use image::{ImageFormat, Rgb, RgbImage};

const MARGIN: i64 = 48;
const GRID_DIVISIONS: i64 = 5;
const RUG_HEIGHT: i64 = 8;
/// Data coordinates are clamped to this many plot widths around the frame.
const CLAMP: (f64, f64) = (-1.0, 2.0);

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const AXIS: Rgb<u8> = Rgb([40, 40, 40]);
const GRID: Rgb<u8> = Rgb([225, 225, 225]);
const ZERO: Rgb<u8> = Rgb([160, 160, 160]);
const CURVE: Rgb<u8> = Rgb([31, 119, 180]);
const BAND: Rgb<u8> = Rgb([198, 219, 239]);
const RUG: Rgb<u8> = Rgb([90, 90, 90]);

/// One effect curve, optionally with a ±std band and a rug of observed values.
#[derive(Debug, Clone, Default)]
pub struct Curve {
    pub xs: Vec<f64>,
    pub ys: Vec<f64>,
    pub std: Option<Vec<f64>>,
    pub rug: Vec<f64>,
}

/// Rasterizes `curve` and encodes it as PNG.
pub fn render_png(curve: &Curve, width: u32, height: u32) -> anyhow::Result<Vec<u8>> {
    anyhow::ensure!(
        curve.xs.len() == curve.ys.len() && curve.xs.len() >= 2,
        "curve needs at least two points"
    );
    let canvas = Canvas::new(curve, width, height);
    let mut img = RgbImage::from_pixel(width, height, BACKGROUND);

    canvas.draw_grid(&mut img);
    if let Some(std) = &curve.std {
        canvas.draw_band(&mut img, &curve.xs, &curve.ys, std);
    }
    if canvas.y_min < 0.0 && canvas.y_max > 0.0 {
        let y = canvas.py(0.0);
        dashed_hline(&mut img, canvas.left, canvas.right, y, ZERO);
    }
    canvas.draw_polyline(&mut img, &curve.xs, &curve.ys);
    canvas.draw_rug(&mut img, &curve.rug);
    canvas.draw_axes(&mut img);

    let mut buf = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .context("encoding png")?;
    Ok(buf)
}

struct Canvas {
    left: i64,
    right: i64,
    top: i64,
    bottom: i64,
    x_min: f64,
    x_max: f64,
    y_min: f64,
    y_max: f64,
}

impl Canvas {
    fn new(curve: &Curve, width: u32, height: u32) -> Self {
        let (x_min, x_max) = padded_range(curve.xs.iter().chain(&curve.rug).copied(), 0.0);

        let mut ys: Vec<f64> = curve.ys.clone();
        if let Some(std) = &curve.std {
            for (y, s) in curve.ys.iter().zip(std) {
                ys.push(y - s);
                ys.push(y + s);
            }
        }
        let (y_min, y_max) = padded_range(ys.into_iter(), 0.05);

        Self {
            left: MARGIN,
            right: width as i64 - MARGIN / 2,
            top: MARGIN / 2,
            bottom: height as i64 - MARGIN,
            x_min,
            x_max,
            y_min,
            y_max,
        }
    }

    fn px(&self, x: f64) -> i64 {
        let t = ((x - self.x_min) / (self.x_max - self.x_min)).clamp(CLAMP.0, CLAMP.1);
        self.left + (t * (self.right - self.left) as f64).round() as i64
    }

    fn py(&self, y: f64) -> i64 {
        let t = ((y - self.y_min) / (self.y_max - self.y_min)).clamp(CLAMP.0, CLAMP.1);
        self.bottom - (t * (self.bottom - self.top) as f64).round() as i64
    }

    fn draw_grid(&self, img: &mut RgbImage) {
        for i in 1..GRID_DIVISIONS {
            let x = self.left + (self.right - self.left) * i / GRID_DIVISIONS;
            line(img, (x, self.top), (x, self.bottom), GRID);
            let y = self.top + (self.bottom - self.top) * i / GRID_DIVISIONS;
            line(img, (self.left, y), (self.right, y), GRID);
        }
    }

    fn draw_axes(&self, img: &mut RgbImage) {
        line(img, (self.left, self.bottom), (self.right, self.bottom), AXIS);
        line(img, (self.left, self.top), (self.left, self.bottom), AXIS);
        for i in 0..=GRID_DIVISIONS {
            let x = self.left + (self.right - self.left) * i / GRID_DIVISIONS;
            line(img, (x, self.bottom), (x, self.bottom + 4), AXIS);
            let y = self.top + (self.bottom - self.top) * i / GRID_DIVISIONS;
            line(img, (self.left - 4, y), (self.left, y), AXIS);
        }
    }

    fn draw_band(&self, img: &mut RgbImage, xs: &[f64], ys: &[f64], std: &[f64]) {
        for i in 1..xs.len().min(std.len()) {
            if !all_finite(&[xs[i - 1], xs[i], ys[i - 1], ys[i], std[i - 1], std[i]]) {
                continue;
            }
            let (x0, x1) = (self.px(xs[i - 1]), self.px(xs[i]));
            for x in x0..=x1 {
                let t = if x1 == x0 { 0.0 } else { (x - x0) as f64 / (x1 - x0) as f64 };
                let y = ys[i - 1] + t * (ys[i] - ys[i - 1]);
                let s = std[i - 1] + t * (std[i] - std[i - 1]);
                line(img, (x, self.py(y + s)), (x, self.py(y - s)), BAND);
            }
        }
    }

    fn draw_polyline(&self, img: &mut RgbImage, xs: &[f64], ys: &[f64]) {
        for i in 1..xs.len() {
            if !all_finite(&[xs[i - 1], xs[i], ys[i - 1], ys[i]]) {
                continue;
            }
            let a = (self.px(xs[i - 1]), self.py(ys[i - 1]));
            let b = (self.px(xs[i]), self.py(ys[i]));
            line(img, a, b, CURVE);
            line(img, (a.0, a.1 + 1), (b.0, b.1 + 1), CURVE);
        }
    }

    fn draw_rug(&self, img: &mut RgbImage, rug: &[f64]) {
        for &x in rug.iter().filter(|x| x.is_finite()) {
            let x = self.px(x);
            line(img, (x, self.bottom - RUG_HEIGHT), (x, self.bottom), RUG);
        }
    }
}

fn padded_range(values: impl Iterator<Item = f64>, pad: f64) -> (f64, f64) {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if !lo.is_finite() {
        return (0.0, 1.0);
    }
    if hi - lo < f64::EPSILON * lo.abs().max(1.0) {
        return (lo - 0.5, hi + 0.5);
    }
    let margin = (hi - lo) * pad;
    (lo - margin, hi + margin)
}

fn all_finite(values: &[f64]) -> bool {
    values.iter().all(|v| v.is_finite())
}

fn put(img: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
        img.put_pixel(x as u32, y as u32, color);
    }
}

/// Bresenham.
fn line(img: &mut RgbImage, (mut x0, mut y0): (i64, i64), (x1, y1): (i64, i64), color: Rgb<u8>) {
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    loop {
        put(img, x0, y0, color);
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

fn dashed_hline(img: &mut RgbImage, x0: i64, x1: i64, y: i64, color: Rgb<u8>) {
    for x in (x0..=x1).filter(|x| (x / 6) % 2 == 0) {
        put(img, x, y, color);
    }
}
