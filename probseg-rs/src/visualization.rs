//! Validation grids: input, target, each sample and the point estimate side by side.

use std::path::{Path, PathBuf};

use candle_core::{DType, Tensor};
use image::{Rgb, RgbImage};
use tracing::info;

use crate::error::{ProbSegError, Result};

/// Label colours; labels beyond the palette wrap around.
const PALETTE: [[u8; 3]; 12] = [
    [0, 0, 0],
    [230, 25, 75],
    [60, 180, 75],
    [255, 225, 25],
    [0, 130, 200],
    [245, 130, 48],
    [145, 30, 180],
    [70, 240, 240],
    [240, 50, 230],
    [210, 245, 60],
    [250, 190, 212],
    [0, 128, 128],
];

/// Gap between cells, in output pixels.
const GAP: u32 = 2;
const GAP_COLOUR: Rgb<u8> = Rgb([255, 255, 255]);

/// Colour of one label.
#[must_use]
pub fn label_colour(label: u32) -> Rgb<u8> {
    Rgb(PALETTE[label as usize % PALETTE.len()])
}

/// One validation pass, index-sorted and concatenated over batches.
#[derive(Debug, Clone)]
pub struct ValidationView {
    /// Images `[B, C, H, W]`.
    pub inputs: Tensor,
    /// Sample labels `[B, N, H, W]`.
    pub samples: Tensor,
    /// Target labels `[B, H, W]`.
    pub targets: Tensor,
    /// Point-estimate scores `[B, C, H, W]`.
    pub outputs: Tensor,
}

/// Consumer of validation results.
pub trait Visualizer {
    /// Render the first `max_examples` rows of `view` for `epoch`.
    ///
    /// # Errors
    ///
    /// Returns an error if rendering or writing fails.
    fn visualize(&mut self, epoch: usize, view: &ValidationView, max_examples: usize) -> Result<()>;
}

fn labels_2d(t: &Tensor) -> Result<Vec<u32>> {
    Ok(t.to_dtype(DType::U32)?.flatten_all()?.to_vec1()?)
}

fn paint_cell<F: Fn(usize) -> Rgb<u8>>(
    img: &mut RgbImage,
    row: u32,
    col: u32,
    (h, w): (usize, usize),
    cell: u32,
    colour: F,
) {
    let x0 = GAP + col * (w as u32 * cell + GAP);
    let y0 = GAP + row * (h as u32 * cell + GAP);
    for y in 0..h {
        for x in 0..w {
            let c = colour(y * w + x);
            for dy in 0..cell {
                for dx in 0..cell {
                    img.put_pixel(x0 + x as u32 * cell + dx, y0 + y as u32 * cell + dy, c);
                }
            }
        }
    }
}

/// Build the grid image for `view`.
///
/// Rows are examples (at most `max_examples`). Columns are the first input
/// channel as min-max normalized grey, the target, each sample and the
/// arg-max of the point estimate.
///
/// # Errors
///
/// Returns `Visualization` on inconsistent shapes.
pub fn build_segmentation_grid(
    view: &ValidationView,
    max_examples: usize,
    cell_size: u32,
) -> Result<RgbImage> {
    let (b, _, h, w) = view.inputs.dims4()?;
    let (sb, n, sh, sw) = view.samples.dims4()?;
    if (sb, sh, sw) != (b, h, w) || view.targets.dims() != &[b, h, w] {
        return Err(ProbSegError::Visualization(format!(
            "inconsistent view: inputs {:?}, samples {:?}, targets {:?}",
            view.inputs.dims(),
            view.samples.dims(),
            view.targets.dims()
        )));
    }
    let rows = b.min(max_examples);
    if rows == 0 {
        return Err(ProbSegError::Visualization("nothing to render".into()));
    }
    let cell = cell_size.max(1);
    let cols = 3 + n;

    let width = GAP + cols as u32 * (w as u32 * cell + GAP);
    let height = GAP + rows as u32 * (h as u32 * cell + GAP);
    let mut img = RgbImage::from_pixel(width, height, GAP_COLOUR);

    let px = h * w;
    let inputs: Vec<f32> = view
        .inputs
        .narrow(1, 0, 1)?
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1()?;
    let targets = labels_2d(&view.targets)?;
    let samples = labels_2d(&view.samples)?;
    let outputs = labels_2d(&view.outputs.argmax(1)?)?;

    for r in 0..rows {
        let row = r as u32;
        let image = &inputs[r * px..(r + 1) * px];
        let (lo, hi) = image
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let range = if hi > lo { hi - lo } else { 1.0 };
        paint_cell(&mut img, row, 0, (h, w), cell, |i| {
            let g = (((image[i] - lo) / range) * 255.0).round().clamp(0.0, 255.0) as u8;
            Rgb([g, g, g])
        });

        let target = &targets[r * px..(r + 1) * px];
        paint_cell(&mut img, row, 1, (h, w), cell, |i| label_colour(target[i]));

        for s in 0..n {
            let start = (r * n + s) * px;
            let sample = &samples[start..start + px];
            paint_cell(&mut img, row, 2 + s as u32, (h, w), cell, |i| {
                label_colour(sample[i])
            });
        }

        let output = &outputs[r * px..(r + 1) * px];
        paint_cell(&mut img, row, 2 + n as u32, (h, w), cell, |i| {
            label_colour(output[i])
        });
    }
    Ok(img)
}

/// Colour a `[H, W]` label map.
///
/// # Errors
///
/// Returns an error if `labels` is not rank 2.
pub fn colorize_labels(labels: &Tensor) -> Result<RgbImage> {
    let (h, w) = labels.dims2()?;
    let values = labels_2d(labels)?;
    Ok(RgbImage::from_fn(w as u32, h as u32, |x, y| {
        label_colour(values[y as usize * w + x as usize])
    }))
}

/// Writes `segmentations_epoch{N}.png` grids into a directory.
#[derive(Debug, Clone)]
pub struct GridRenderer {
    output_dir: PathBuf,
    cell_size: u32,
}

impl GridRenderer {
    /// Renderer writing into `output_dir`.
    pub fn new<P: AsRef<Path>>(output_dir: P, cell_size: u32) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            cell_size,
        }
    }

    /// Path of the grid for `epoch`.
    #[must_use]
    pub fn grid_path(&self, epoch: usize) -> PathBuf {
        self.output_dir.join(format!("segmentations_epoch{epoch}.png"))
    }
}

impl Visualizer for GridRenderer {
    fn visualize(&mut self, epoch: usize, view: &ValidationView, max_examples: usize) -> Result<()> {
        let grid = build_segmentation_grid(view, max_examples, self.cell_size)?;
        std::fs::create_dir_all(&self.output_dir)?;
        let path = self.grid_path(epoch);
        grid.save(&path)?;
        info!("Saved validation grid to {}", path.display());
        Ok(())
    }
}
