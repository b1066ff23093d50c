//! Rendering of image arrays into RGB figures.
//!
//! A figure is a grid of panels. Every column is described by an entry of an
//! [`ImageVisualizer`]: a display range (`clim`) and a colormap used for
//! single-channel data. Three-channel arrays are shown as RGB.

use std::path::Path;

use image::{Rgb, RgbImage};

use crate::{
    data::ImageArray,
    error::{BcnnError, BcnnResult},
};

const GAP: u32 = 4;

/// Colormap for single-channel panels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Colormap {
    /// Grayscale.
    #[default]
    Gray,
    /// Blue-cyan-yellow-red ramp.
    Jet,
}

impl Colormap {
    /// Maps `v` in `[0, 1]` to RGB in `[0, 1]`.
    pub fn map(self, v: f32) -> [f32; 3] {
        let v = v.clamp(0.0, 1.0);
        match self {
            Self::Gray => [v, v, v],
            Self::Jet => jet(v),
        }
    }
}

/// The jet colormap as a piecewise-linear ramp.
pub fn jet(v: f32) -> [f32; 3] {
    let ramp = |offset: f32| (1.5 - (4.0 * v - offset).abs()).clamp(0.0, 1.0);
    [ramp(3.0), ramp(2.0), ramp(1.0)]
}

/// The `q`-th percentile (0..=100) with linear interpolation between ranks.
///
/// Returns 0 for an empty slice. Non-finite values are ignored.
pub fn percentile(values: &[f32], q: f64) -> f32 {
    let mut sorted: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return 0.0;
    }
    sorted.sort_by(f32::total_cmp);

    let rank = q.clamp(0.0, 100.0) / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = (rank - lower as f64) as f32;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

/// Display settings of one figure column.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelStyle {
    /// Column name.
    pub key: String,
    /// Value range mapped to `[0, 1]`; the data range when `None`.
    pub clim: Option<(f32, f32)>,
    /// Colormap for single-channel data.
    pub cmap: Colormap,
}

/// Renders rows of arrays into a figure, one style per column.
#[derive(Debug, Clone, Default)]
pub struct ImageVisualizer {
    styles: Vec<PanelStyle>,
}

impl ImageVisualizer {
    /// An empty visualizer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a column.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, clim: Option<(f32, f32)>, cmap: Colormap) -> Self {
        self.styles.push(PanelStyle {
            key: key.into(),
            clim,
            cmap,
        });
        self
    }

    /// Column styles in order.
    pub fn styles(&self) -> &[PanelStyle] {
        &self.styles
    }

    /// Renders a single panel.
    pub fn render_panel(array: &ImageArray, style: &PanelStyle) -> RgbImage {
        let (lo, hi) = style.clim.unwrap_or_else(|| {
            let (min, max) = array
                .data()
                .iter()
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
            if min.is_finite() { (min, max) } else { (0.0, 1.0) }
        });
        let scale = if hi > lo { 1.0 / (hi - lo) } else { 0.0 };
        let normalize = |v: f32| ((v - lo) * scale).clamp(0.0, 1.0);

        let rgb_input = array.channels() == 3;
        let gray = if rgb_input { None } else { Some(array.channel_mean()) };
        let to_u8 = |v: f32| (v * 255.0).round() as u8;

        RgbImage::from_fn(array.width() as u32, array.height() as u32, |col, row| {
            let (row, col) = (row as usize, col as usize);
            let color = match &gray {
                None => [
                    normalize(array.get(0, row, col)),
                    normalize(array.get(1, row, col)),
                    normalize(array.get(2, row, col)),
                ],
                Some(gray) => style.cmap.map(normalize(gray.get(0, row, col))),
            };
            Rgb([to_u8(color[0]), to_u8(color[1]), to_u8(color[2])])
        })
    }

    /// Renders `rows`, each holding one array per column, into a single image.
    ///
    /// # Errors
    ///
    /// Returns `BcnnError::Render` if a row does not match the number of columns.
    pub fn render(&self, rows: &[Vec<ImageArray>]) -> BcnnResult<RgbImage> {
        let mut rendered = Vec::with_capacity(rows.len());
        for row in rows {
            if row.len() != self.styles.len() {
                return Err(BcnnError::Render {
                    message: format!(
                        "row has {} panels but the visualizer has {} columns",
                        row.len(),
                        self.styles.len()
                    ),
                });
            }
            rendered.push(
                row.iter()
                    .zip(&self.styles)
                    .map(|(array, style)| Self::render_panel(array, style))
                    .collect::<Vec<_>>(),
            );
        }
        Ok(grid(&rendered))
    }

    /// Renders `rows` and writes the figure to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if rendering or encoding fails.
    pub fn save(&self, rows: &[Vec<ImageArray>], path: impl AsRef<Path>) -> BcnnResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.render(rows)?.save(path)?;
        Ok(())
    }
}

/// Tiles panels into a grid separated by white gaps.
pub fn grid(rows: &[Vec<RgbImage>]) -> RgbImage {
    let ncols = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut widths = vec![0u32; ncols];
    let mut heights = vec![0u32; rows.len()];
    for (r, row) in rows.iter().enumerate() {
        for (c, panel) in row.iter().enumerate() {
            widths[c] = widths[c].max(panel.width());
            heights[r] = heights[r].max(panel.height());
        }
    }

    let total_w = widths.iter().sum::<u32>() + GAP * ncols.saturating_sub(1) as u32;
    let total_h = heights.iter().sum::<u32>() + GAP * rows.len().saturating_sub(1) as u32;
    let mut canvas = RgbImage::from_pixel(total_w.max(1), total_h.max(1), Rgb([255, 255, 255]));

    let mut y = 0;
    for (r, row) in rows.iter().enumerate() {
        let mut x = 0;
        for (c, panel) in row.iter().enumerate() {
            image::imageops::replace(&mut canvas, panel, i64::from(x), i64::from(y));
            x += widths[c] + GAP;
        }
        y += heights[r] + GAP;
    }
    canvas
}
