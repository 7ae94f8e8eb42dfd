use anyhow::{bail, Context, Result};

use crate::geometry::Point;

/// Largest slice a decoded labelmap may cover.
const MAX_CELLS: usize = 8192 * 8192;

/// Binary segmentation mask over one image slice, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    width: usize,
    height: usize,
    cells: Vec<bool>,
}

impl Mask {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            cells: vec![false; width * height],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn get(&self, x: usize, y: usize) -> bool {
        x < self.width && y < self.height && self.cells[y * self.width + x]
    }

    pub fn count(&self) -> usize {
        self.cells.iter().filter(|cell| **cell).count()
    }

    pub fn is_empty(&self) -> bool {
        !self.cells.iter().any(|cell| *cell)
    }

    /// Sets (or clears) every cell whose center lies within `radius` of
    /// `center`. Returns how many cells changed.
    pub fn paint_disc(&mut self, center: Point, radius: f32, value: bool) -> usize {
        if self.width == 0 || self.height == 0 || !center.is_finite() {
            return 0;
        }
        let radius = radius.max(0.5);
        let min_x = (center.x - radius).floor().max(0.0) as usize;
        let min_y = (center.y - radius).floor().max(0.0) as usize;
        let max_x = ((center.x + radius).ceil().max(0.0) as usize).min(self.width - 1);
        let max_y = ((center.y + radius).ceil().max(0.0) as usize).min(self.height - 1);

        let mut changed = 0;
        for y in min_y..=max_y {
            for x in min_x..=max_x {
                let cell_center = Point::new(x as f32 + 0.5, y as f32 + 0.5);
                if cell_center.distance_to(center) > radius {
                    continue;
                }
                let cell = &mut self.cells[y * self.width + x];
                if *cell != value {
                    *cell = value;
                    changed += 1;
                }
            }
        }
        changed
    }

    /// `"{width}x{height}:{runs}"` where runs alternate unset/set, starting
    /// with unset.
    pub fn encode(&self) -> String {
        let mut runs = Vec::new();
        let mut current = false;
        let mut run = 0usize;
        for &cell in &self.cells {
            if cell == current {
                run += 1;
            } else {
                runs.push(run.to_string());
                current = cell;
                run = 1;
            }
        }
        runs.push(run.to_string());
        format!("{}x{}:{}", self.width, self.height, runs.join(","))
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let (size, runs) = encoded
            .split_once(':')
            .context("Labelmap is missing its size header")?;
        let (width, height) = size
            .split_once('x')
            .context("Labelmap size must look like WIDTHxHEIGHT")?;
        let width: usize = width.trim().parse().context("Invalid labelmap width")?;
        let height: usize = height.trim().parse().context("Invalid labelmap height")?;
        let total = width
            .checked_mul(height)
            .context("Labelmap dimensions overflow")?;

        if total > MAX_CELLS {
            bail!("Labelmap {width}x{height} exceeds the largest supported slice");
        }

        let mut lengths = Vec::new();
        let mut covered = 0usize;
        for run in runs.split(',').filter(|run| !run.trim().is_empty()) {
            let run: usize = run
                .trim()
                .parse()
                .with_context(|| format!("Invalid labelmap run {run:?}"))?;
            covered = match covered.checked_add(run) {
                Some(covered) if covered <= total => covered,
                _ => bail!("Labelmap runs exceed {width}x{height}"),
            };
            lengths.push(run);
        }
        if covered != total {
            bail!("Labelmap runs cover {covered} cells, expected {total}");
        }

        let mut cells = Vec::with_capacity(total);
        let mut value = false;
        for run in lengths {
            cells.extend(std::iter::repeat(value).take(run));
            value = !value;
        }
        Ok(Self {
            width,
            height,
            cells,
        })
    }
}
