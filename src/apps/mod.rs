//! Demo problem implementations: a branch-and-bound Euclidean TSP search and
//! a Mandelbrot-set tiler.

pub mod euclidean_tsp;
pub mod mandelbrot;
