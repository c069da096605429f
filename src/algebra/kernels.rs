//! Pixel-level primitives used by the local evaluator
//!
//! Plain functions over ndarray planes plus validity masks, no knowledge of
//! the expression graph.

use ndarray::{Array2, Zip};
use num_traits::Float;
use std::collections::VecDeque;
use std::f32::consts::{FRAC_PI_2, PI};

use crate::types::{Grid, Plane, ValidityMask};

/// Square-window mean or population standard deviation over valid pixels
///
/// A pixel is valid in the output when at least one valid pixel falls in its
/// window. Uses summed-area tables so cost does not depend on the radius.
pub fn focal_statistic(values: &Plane, valid: &ValidityMask, radius: usize, std_dev: bool) -> (Plane, ValidityMask) {
    let (rows, cols) = values.dim();
    // Integral images carry one extra leading row/col of zeros
    let mut sum = Array2::<f64>::zeros((rows + 1, cols + 1));
    let mut sum_sq = Array2::<f64>::zeros((rows + 1, cols + 1));
    let mut count = Array2::<f64>::zeros((rows + 1, cols + 1));

    for i in 0..rows {
        for j in 0..cols {
            let (v, c) = if valid[[i, j]] {
                (values[[i, j]] as f64, 1.0)
            } else {
                (0.0, 0.0)
            };
            sum[[i + 1, j + 1]] = v + sum[[i, j + 1]] + sum[[i + 1, j]] - sum[[i, j]];
            sum_sq[[i + 1, j + 1]] = v * v + sum_sq[[i, j + 1]] + sum_sq[[i + 1, j]] - sum_sq[[i, j]];
            count[[i + 1, j + 1]] = c + count[[i, j + 1]] + count[[i + 1, j]] - count[[i, j]];
        }
    }

    let window = |table: &Array2<f64>, r0: usize, c0: usize, r1: usize, c1: usize| {
        table[[r1, c1]] - table[[r0, c1]] - table[[r1, c0]] + table[[r0, c0]]
    };

    let mut out = Plane::zeros((rows, cols));
    let mut out_valid = ValidityMask::from_elem((rows, cols), false);
    for i in 0..rows {
        let r0 = i.saturating_sub(radius);
        let r1 = (i + radius + 1).min(rows);
        for j in 0..cols {
            let c0 = j.saturating_sub(radius);
            let c1 = (j + radius + 1).min(cols);
            let n = window(&count, r0, c0, r1, c1);
            if n < 1.0 {
                continue;
            }
            let mean = window(&sum, r0, c0, r1, c1) / n;
            out[[i, j]] = if std_dev {
                let var = (window(&sum_sq, r0, c0, r1, c1) / n - mean * mean).max(0.0);
                var.sqrt() as f32
            } else {
                mean as f32
            };
            out_valid[[i, j]] = true;
        }
    }
    (out, out_valid)
}

/// Pixels of a binary partition that touch the other class (4-connectivity)
pub fn class_boundary(binary: &Array2<bool>, valid: &ValidityMask) -> Array2<bool> {
    let (rows, cols) = binary.dim();
    let mut edges = Array2::from_elem((rows, cols), false);
    for i in 0..rows {
        for j in 0..cols {
            if !valid[[i, j]] {
                continue;
            }
            let here = binary[[i, j]];
            let neighbours = [
                (i.wrapping_sub(1), j),
                (i + 1, j),
                (i, j.wrapping_sub(1)),
                (i, j + 1),
            ];
            edges[[i, j]] = neighbours
                .iter()
                .any(|&(ni, nj)| ni < rows && nj < cols && valid[[ni, nj]] && binary[[ni, nj]] != here);
        }
    }
    edges
}

/// Square dilation of a boolean plane, separable row then column passes
pub fn dilate(mask: &Array2<bool>, radius: usize) -> Array2<bool> {
    let (rows, cols) = mask.dim();
    let mut horizontal = Array2::from_elem((rows, cols), false);
    for i in 0..rows {
        for j in 0..cols {
            if mask[[i, j]] {
                let lo = j.saturating_sub(radius);
                let hi = (j + radius).min(cols - 1);
                for k in lo..=hi {
                    horizontal[[i, k]] = true;
                }
            }
        }
    }
    let mut out = Array2::from_elem((rows, cols), false);
    for j in 0..cols {
        for i in 0..rows {
            if horizontal[[i, j]] {
                let lo = i.saturating_sub(radius);
                let hi = (i + radius).min(rows - 1);
                for k in lo..=hi {
                    out[[k, j]] = true;
                }
            }
        }
    }
    out
}

/// Otsu threshold from a bucketed histogram of `samples`
///
/// Returns the bucket mean that maximises the between-class sum of squares,
/// or `None` when the histogram is degenerate (empty or single-valued). When
/// a run of empty buckets produces a plateau of equal scores the threshold
/// sits in the middle of the plateau.
pub fn otsu_threshold<T: Float>(samples: &[T], buckets: usize) -> Option<T> {
    if samples.is_empty() || buckets < 2 {
        return None;
    }
    let samples: Vec<f64> = samples.iter().filter_map(|s| s.to_f64()).collect();
    let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !(max > min) {
        return None;
    }

    let width = (max - min) / buckets as f64;
    let mut counts = vec![0.0f64; buckets];
    for &s in &samples {
        let idx = (((s - min) / width).floor() as usize).min(buckets - 1);
        counts[idx] += 1.0;
    }
    let means: Vec<f64> = (0..buckets).map(|k| min + width * (k as f64 + 0.5)).collect();

    let total: f64 = counts.iter().sum();
    let sum: f64 = counts.iter().zip(&means).map(|(c, m)| c * m).sum();
    let mean = sum / total;

    let mut best: Option<(usize, usize, f64)> = None;
    let mut a_count = 0.0;
    let mut a_sum = 0.0;
    for i in 1..buckets {
        a_count += counts[i - 1];
        a_sum += counts[i - 1] * means[i - 1];
        let b_count = total - a_count;
        if a_count == 0.0 || b_count == 0.0 {
            continue;
        }
        let a_mean = a_sum / a_count;
        let b_mean = (sum - a_sum) / b_count;
        let bss = a_count * (a_mean - mean).powi(2) + b_count * (b_mean - mean).powi(2);
        best = match best {
            Some((lo, _, b)) if (bss - b).abs() <= b * 1e-12 => Some((lo, i - 1, b)),
            Some((_, _, b)) if bss < b => best,
            _ => Some((i - 1, i - 1, bss)),
        };
    }
    best.and_then(|(lo, hi, _)| T::from((means[lo] + means[hi]) / 2.0))
}

/// Linearly interpolated percentile (0-100); `None` for an empty sample
pub fn percentile<T: Float>(values: &mut [T], p: f64) -> Option<T> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (values.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = T::from(rank - lo as f64)?;
    Some(values[lo] + (values[hi] - values[lo]) * frac)
}

fn gaussian_blur(plane: &Plane, sigma: f32) -> Plane {
    let radius = (3.0 * sigma).ceil() as isize;
    let weights: Vec<f32> = (-radius..=radius)
        .map(|k| (-((k * k) as f32) / (2.0 * sigma * sigma)).exp())
        .collect();
    let norm: f32 = weights.iter().sum();
    let (rows, cols) = plane.dim();
    let clamp = |v: isize, n: usize| v.clamp(0, n as isize - 1) as usize;

    let mut tmp = Plane::zeros((rows, cols));
    for i in 0..rows {
        for j in 0..cols {
            let mut acc = 0.0;
            for (w, k) in weights.iter().zip(-radius..=radius) {
                acc += w * plane[[i, clamp(j as isize + k, cols)]];
            }
            tmp[[i, j]] = acc / norm;
        }
    }
    let mut out = Plane::zeros((rows, cols));
    for i in 0..rows {
        for j in 0..cols {
            let mut acc = 0.0;
            for (w, k) in weights.iter().zip(-radius..=radius) {
                acc += w * tmp[[clamp(i as isize + k, rows), j]];
            }
            out[[i, j]] = acc / norm;
        }
    }
    out
}

/// Canny edge detector returning a 0/1 plane
///
/// Invalid pixels read as 0. Gradient magnitudes are raw Sobel responses, so
/// `low`/`high` compare against the unnormalised 3x3 operator output.
pub fn canny(values: &Plane, valid: &ValidityMask, low: f32, high: f32, sigma: f32) -> Plane {
    let (rows, cols) = values.dim();
    let mut out = Plane::zeros((rows, cols));
    if rows < 3 || cols < 3 {
        return out;
    }
    let src = Plane::from_shape_fn((rows, cols), |(i, j)| if valid[[i, j]] { values[[i, j]] } else { 0.0 });
    let smoothed = if sigma > 0.0 { gaussian_blur(&src, sigma) } else { src };

    let mut magnitude = Plane::zeros((rows, cols));
    let mut direction = Array2::<u8>::zeros((rows, cols));
    for i in 1..rows - 1 {
        for j in 1..cols - 1 {
            let z = |r: usize, c: usize| smoothed[[r, c]];
            let gx = (z(i - 1, j + 1) + 2.0 * z(i, j + 1) + z(i + 1, j + 1))
                - (z(i - 1, j - 1) + 2.0 * z(i, j - 1) + z(i + 1, j - 1));
            let gy = (z(i + 1, j - 1) + 2.0 * z(i + 1, j) + z(i + 1, j + 1))
                - (z(i - 1, j - 1) + 2.0 * z(i - 1, j) + z(i - 1, j + 1));
            magnitude[[i, j]] = (gx * gx + gy * gy).sqrt();
            let angle = gy.atan2(gx).to_degrees().rem_euclid(180.0);
            direction[[i, j]] = match angle {
                a if !(22.5..157.5).contains(&a) => 0,
                a if a < 67.5 => 1,
                a if a < 112.5 => 2,
                _ => 3,
            };
        }
    }

    // Non-maximum suppression along the gradient direction
    let mut thin = Plane::zeros((rows, cols));
    for i in 1..rows - 1 {
        for j in 1..cols - 1 {
            let m = magnitude[[i, j]];
            if m <= 0.0 {
                continue;
            }
            let (a, b) = match direction[[i, j]] {
                0 => (magnitude[[i, j - 1]], magnitude[[i, j + 1]]),
                1 => (magnitude[[i - 1, j - 1]], magnitude[[i + 1, j + 1]]),
                2 => (magnitude[[i - 1, j]], magnitude[[i + 1, j]]),
                _ => (magnitude[[i - 1, j + 1]], magnitude[[i + 1, j - 1]]),
            };
            if m >= a && m >= b {
                thin[[i, j]] = m;
            }
        }
    }

    // Hysteresis: grow strong edges through weak ones (8-connectivity)
    let mut queue = VecDeque::new();
    for ((i, j), &m) in thin.indexed_iter() {
        if m >= high {
            out[[i, j]] = 1.0;
            queue.push_back((i, j));
        }
    }
    while let Some((i, j)) = queue.pop_front() {
        for di in -1isize..=1 {
            for dj in -1isize..=1 {
                let ni = i as isize + di;
                let nj = j as isize + dj;
                if ni < 0 || nj < 0 || ni >= rows as isize || nj >= cols as isize {
                    continue;
                }
                let (ni, nj) = (ni as usize, nj as usize);
                if out[[ni, nj]] == 0.0 && thin[[ni, nj]] >= low {
                    out[[ni, nj]] = 1.0;
                    queue.push_back((ni, nj));
                }
            }
        }
    }
    out
}

/// One-dimensional squared distance transform (Felzenszwalb & Huttenlocher)
fn distance_1d(f: &[f64], out: &mut [f64]) {
    let n = f.len();
    if n == 0 {
        return;
    }
    let mut v = vec![0usize; n];
    let mut z = vec![0.0f64; n + 1];
    let mut k = 0usize;
    z[0] = f64::NEG_INFINITY;
    z[1] = f64::INFINITY;
    let intersect = |q: usize, p: usize| {
        ((f[q] + (q * q) as f64) - (f[p] + (p * p) as f64)) / (2.0 * (q as f64 - p as f64))
    };
    for q in 1..n {
        let mut s = intersect(q, v[k]);
        // z[0] is -inf so this never walks past the first parabola
        while s <= z[k] {
            k -= 1;
            s = intersect(q, v[k]);
        }
        k += 1;
        v[k] = q;
        z[k] = s;
        z[k + 1] = f64::INFINITY;
    }
    k = 0;
    for (q, slot) in out.iter_mut().enumerate() {
        while z[k + 1] < q as f64 {
            k += 1;
        }
        let p = v[k];
        let d = q as f64 - p as f64;
        *slot = d * d + f[p];
    }
}

/// Squared Euclidean pixel distance to the nearest `true` pixel, capped at `cap`
pub fn squared_distance_transform(features: &Array2<bool>, cap: f32) -> Plane {
    let (rows, cols) = features.dim();
    let far = 1e20f64;
    let mut grid = Array2::from_shape_fn((rows, cols), |(i, j)| if features[[i, j]] { 0.0 } else { far });

    let mut column = vec![0.0; rows];
    let mut column_out = vec![0.0; rows];
    for j in 0..cols {
        for i in 0..rows {
            column[i] = grid[[i, j]];
        }
        distance_1d(&column, &mut column_out);
        for i in 0..rows {
            grid[[i, j]] = column_out[i];
        }
    }
    let mut row = vec![0.0; cols];
    let mut row_out = vec![0.0; cols];
    for i in 0..rows {
        for j in 0..cols {
            row[j] = grid[[i, j]];
        }
        distance_1d(&row, &mut row_out);
        for j in 0..cols {
            grid[[i, j]] = row_out[j];
        }
    }
    grid.mapv(|d| (d as f32).min(cap))
}

/// Terrain slope and downslope aspect (radians) of a north-up surface
///
/// Central differences inside the plane, one-sided differences on its border.
/// Aspect is clockwise from north in `[0, 2π)`; a flat pixel has slope 0.
pub fn slope_aspect(surface: &Plane, spacing_m: f64) -> (Plane, Plane) {
    let (rows, cols) = surface.dim();
    let spacing = spacing_m as f32;
    let mut slope = Plane::zeros((rows, cols));
    let mut aspect = Plane::zeros((rows, cols));
    for i in 0..rows {
        let (north, south) = (i.saturating_sub(1), (i + 1).min(rows - 1));
        for j in 0..cols {
            let (west, east) = (j.saturating_sub(1), (j + 1).min(cols - 1));
            let dz_dx = if east > west {
                (surface[[i, east]] - surface[[i, west]]) / ((east - west) as f32 * spacing)
            } else {
                0.0
            };
            // rows run north to south
            let dz_dy = if south > north {
                (surface[[north, j]] - surface[[south, j]]) / ((south - north) as f32 * spacing)
            } else {
                0.0
            };
            slope[[i, j]] = dz_dx.hypot(dz_dy).atan();
            aspect[[i, j]] = (-dz_dx).atan2(-dz_dy).rem_euclid(2.0 * PI);
        }
    }
    (slope, aspect)
}

/// Mean direction (radians) of the angles at valid pixels
pub fn circular_mean(angles: &Plane, valid: &ValidityMask) -> Option<f32> {
    let (mut sin, mut cos, mut n) = (0.0f64, 0.0f64, 0usize);
    Zip::from(angles).and(valid).for_each(|&a, &ok| {
        if ok {
            sin += (a as f64).sin();
            cos += (a as f64).cos();
            n += 1;
        }
    });
    if n == 0 {
        None
    } else {
        Some(sin.atan2(cos) as f32)
    }
}

/// Slope steepness in the range direction
///
/// `heading` and `aspect` are azimuths, `slope` the terrain inclination, all
/// in radians.
pub fn range_slope(slope: f32, aspect: f32, heading: f32) -> f32 {
    (slope.tan() * (heading - aspect).cos()).atan()
}

/// True where the range slope neither folds over (layover) nor hides (shadow)
/// the pixel at incidence angle `theta`
pub fn is_visible(alpha_r: f32, theta: f32) -> bool {
    alpha_r < theta && alpha_r > -(FRAC_PI_2 - theta)
}

/// Volumetric-model terrain flattening of one sigma0 sample in dB
///
/// Converts to gamma0 over the ellipsoid incidence angle `theta`, then divides
/// by the slope correction factor for range slope `alpha_r` (both radians).
pub fn volumetric_flatten_db(sigma0_db: f32, theta: f32, alpha_r: f32) -> f32 {
    let gamma0 = 10f32.powf(sigma0_db / 10.0) / theta.cos();
    let scf = (FRAC_PI_2 - theta + alpha_r).tan() / (FRAC_PI_2 - theta).tan();
    10.0 * (gamma0 / scf).log10()
}

/// Nearest-neighbour transfer of a plane between grids
pub fn resample_nearest(values: &Plane, valid: &ValidityMask, from: &Grid, to: &Grid) -> (Plane, ValidityMask) {
    let (rows, cols) = to.shape();
    let mut out = Plane::zeros((rows, cols));
    let mut out_valid = ValidityMask::from_elem((rows, cols), false);
    for i in 0..rows {
        for j in 0..cols {
            let (x, y) = to.pixel_center(i, j);
            if let Some((si, sj)) = from.locate(x, y) {
                out[[i, j]] = values[[si, sj]];
                out_valid[[i, j]] = valid[[si, sj]];
            }
        }
    }
    (out, out_valid)
}
