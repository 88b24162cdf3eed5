//! Mandelbrot-set tiling.
//!
//! Renders per-pixel escape-iteration counts for a square region of the
//! complex plane. Oversized regions decompose into quadrants until tiles are
//! small enough to render on one worker; the join node stitches the quadrant
//! grids back together. No shared value is involved: this is the
//! embarrassingly parallel end of the framework's range.

use serde::{Deserialize, Serialize};

use crate::model::{Decomposition, TaskUnit};
use crate::shared::{TaskContext, Unshared};

/// Largest tile rendered in one solve, in pixels per side.
const MAX_TILE_PIXELS: usize = 256;

/// Escape-iteration counts for a square block of pixels, positioned within
/// the root image by its lower-left pixel offsets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationCounts {
    pub row0: usize,
    pub col0: usize,
    pub pixels: usize,
    /// Row-major `pixels * pixels` grid.
    pub counts: Vec<u32>,
}

impl IterationCounts {
    pub fn at(&self, row: usize, col: usize) -> u32 {
        self.counts[row * self.pixels + col]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MandelbrotTask {
    /// Render a square region: lower-left corner `(x_min, y_min)`, side
    /// `edge`, `pixels` pixels per side, positioned at `(row0, col0)` in the
    /// root image.
    Tile {
        x_min: f64,
        y_min: f64,
        edge: f64,
        pixels: usize,
        row0: usize,
        col0: usize,
        iteration_limit: u32,
    },
    /// Join node: stitch four quadrant grids back into one.
    Assemble {
        pixels: usize,
        row0: usize,
        col0: usize,
    },
}

impl MandelbrotTask {
    pub fn root(x_min: f64, y_min: f64, edge: f64, pixels: usize, iteration_limit: u32) -> Self {
        assert!(
            pixels.is_power_of_two(),
            "pixel count must be a power of two so quadrants split evenly"
        );
        MandelbrotTask::Tile {
            x_min,
            y_min,
            edge,
            pixels,
            row0: 0,
            col0: 0,
            iteration_limit,
        }
    }
}

impl TaskUnit for MandelbrotTask {
    type Value = IterationCounts;
    type Shared = Unshared;

    fn is_atomic(&self) -> bool {
        match self {
            MandelbrotTask::Tile { pixels, .. } => *pixels <= MAX_TILE_PIXELS,
            MandelbrotTask::Assemble { .. } => true,
        }
    }

    fn solve(&self, _ctx: &TaskContext<Unshared>) -> IterationCounts {
        let MandelbrotTask::Tile {
            x_min,
            y_min,
            edge,
            pixels,
            row0,
            col0,
            iteration_limit,
        } = self
        else {
            unreachable!("join nodes are composed, never solved");
        };

        let delta = edge / *pixels as f64;
        let mut counts = Vec::with_capacity(pixels * pixels);
        for row in 0..*pixels {
            let y0 = y_min + row as f64 * delta;
            for col in 0..*pixels {
                let x0 = x_min + col as f64 * delta;
                counts.push(escape_count(x0, y0, *iteration_limit));
            }
        }
        IterationCounts {
            row0: *row0,
            col0: *col0,
            pixels: *pixels,
            counts,
        }
    }

    fn decompose(&self) -> Decomposition<Self> {
        let MandelbrotTask::Tile {
            x_min,
            y_min,
            edge,
            pixels,
            row0,
            col0,
            iteration_limit,
        } = self
        else {
            unreachable!("join nodes are composed, never decomposed");
        };

        let half_pixels = pixels / 2;
        let half_edge = edge / 2.0;
        let mut children = Vec::with_capacity(4);
        for quadrant_row in 0..2 {
            for quadrant_col in 0..2 {
                children.push(MandelbrotTask::Tile {
                    x_min: x_min + quadrant_col as f64 * half_edge,
                    y_min: y_min + quadrant_row as f64 * half_edge,
                    edge: half_edge,
                    pixels: half_pixels,
                    row0: row0 + quadrant_row * half_pixels,
                    col0: col0 + quadrant_col * half_pixels,
                    iteration_limit: *iteration_limit,
                });
            }
        }
        Decomposition::new(
            MandelbrotTask::Assemble {
                pixels: *pixels,
                row0: *row0,
                col0: *col0,
            },
            children,
        )
    }

    fn compose(&self, args: Vec<IterationCounts>) -> IterationCounts {
        let MandelbrotTask::Assemble { pixels, row0, col0 } = self else {
            unreachable!("only join nodes compose");
        };

        let mut counts = vec![0u32; pixels * pixels];
        for block in &args {
            let row_base = block.row0 - row0;
            let col_base = block.col0 - col0;
            for row in 0..block.pixels {
                for col in 0..block.pixels {
                    counts[(row_base + row) * pixels + (col_base + col)] = block.at(row, col);
                }
            }
        }
        IterationCounts {
            row0: *row0,
            col0: *col0,
            pixels: *pixels,
            counts,
        }
    }
}

fn escape_count(x0: f64, y0: f64, iteration_limit: u32) -> u32 {
    let (mut x, mut y) = (x0, y0);
    let mut iteration = 0;
    while x * x + y * y <= 4.0 && iteration < iteration_limit {
        let x_next = x * x - y * y + x0;
        y = 2.0 * x * y + y0;
        x = x_next;
        iteration += 1;
    }
    iteration
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::SharedCell;
    use std::sync::Arc;
    use tokio::sync::Notify;

    fn context() -> TaskContext<Unshared> {
        TaskContext::new(Arc::new(SharedCell::new()), Arc::new(Notify::new()))
    }

    #[test]
    fn interior_points_reach_the_iteration_limit() {
        // The origin is in the set; a far-away point escapes immediately.
        assert_eq!(escape_count(0.0, 0.0, 128), 128);
        assert!(escape_count(2.0, 2.0, 128) < 4);
    }

    #[test]
    fn tile_solve_renders_the_full_grid() {
        let tile = MandelbrotTask::root(-2.0, -2.0, 4.0, 8, 64);
        let counts = tile.solve(&context());
        assert_eq!(counts.pixels, 8);
        assert_eq!(counts.counts.len(), 64);
        // The center of this region sits in the set.
        assert_eq!(counts.at(4, 4), 64);
    }

    #[test]
    fn oversized_regions_decompose_into_quadrants() {
        let root = MandelbrotTask::root(-2.0, -2.0, 4.0, 1024, 64);
        assert!(!root.is_atomic());

        let decomposition = root.decompose();
        assert_eq!(decomposition.children.len(), 4);
        let offsets: Vec<(usize, usize)> = decomposition
            .children
            .iter()
            .map(|child| match child {
                MandelbrotTask::Tile { row0, col0, pixels, .. } => {
                    assert_eq!(*pixels, 512);
                    (*row0, *col0)
                }
                MandelbrotTask::Assemble { .. } => panic!("children are tiles"),
            })
            .collect();
        assert_eq!(offsets, vec![(0, 0), (0, 512), (512, 0), (512, 512)]);
    }

    #[test]
    fn assembled_quadrants_match_a_direct_render() {
        let root = MandelbrotTask::root(-2.0, -1.0, 3.0, 512, 32);
        let direct = root.solve(&context());

        let decomposition = root.decompose();
        let blocks: Vec<IterationCounts> = decomposition
            .children
            .iter()
            .map(|child| child.solve(&context()))
            .collect();
        let assembled = decomposition.compose.compose(blocks);

        assert_eq!(assembled, direct);
    }
}
