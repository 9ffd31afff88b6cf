//! Lattice assembly for detected chessboard corners.

use std::collections::{BTreeMap, HashSet};

use nalgebra::{Point2, Vector2};

use crate::chessboard::ChessboardPattern;

type Cell = (i32, i32);

const DIRS: [Cell; 4] = [(1, 0), (-1, 0), (0, 1), (0, -1)];

/// Fraction of the local step a match may deviate from its prediction.
const MATCH_TOLERANCE: f64 = 0.3;

fn cosine(a: &Vector2<f64>, b: &Vector2<f64>) -> f64 {
    a.dot(b) / (a.norm() * b.norm()).max(f64::EPSILON)
}

/// Grow a lattice from corners nearest the centroid until one matches
/// `pattern`; returns the corners row-major.
pub(crate) fn assemble_grid(
    points: &[Point2<f64>],
    pattern: ChessboardPattern,
    max_seeds: usize,
) -> Option<Vec<Point2<f64>>> {
    if points.len() < pattern.corner_count() || points.len() < 5 {
        return None;
    }
    let centroid = points
        .iter()
        .fold(Vector2::zeros(), |acc: Vector2<f64>, p| acc + p.coords)
        / points.len() as f64;
    let mut order: Vec<usize> = (0..points.len()).collect();
    order.sort_by(|&a, &b| {
        (points[a].coords - centroid)
            .norm_squared()
            .total_cmp(&(points[b].coords - centroid).norm_squared())
    });

    order
        .iter()
        .take(max_seeds)
        .filter_map(|&seed| grow(points, seed, pattern))
        .find_map(|cells| order_grid(points, &cells, pattern))
}

/// The seed and its four lattice neighbours, or `None` if the nearest four
/// corners do not form two opposite pairs.
fn seed_cells(points: &[Point2<f64>], seed: usize) -> Option<BTreeMap<Cell, usize>> {
    let origin = points[seed];
    let mut near: Vec<(usize, f64)> = points
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != seed)
        .map(|(i, p)| (i, (p - origin).norm()))
        .collect();
    near.sort_by(|a, b| a.1.total_cmp(&b.1));
    near.truncate(4);
    if near.len() < 4 {
        return None;
    }
    let v: Vec<Vector2<f64>> = near.iter().map(|(i, _)| points[*i] - origin).collect();

    let partner = (1..4).min_by(|&a, &b| cosine(&v[0], &v[a]).total_cmp(&cosine(&v[0], &v[b])))?;
    let rest: Vec<usize> = (1..4).filter(|k| *k != partner).collect();
    let (c, d) = (rest[0], rest[1]);

    let similar = |a: f64, b: f64| a < 2.0 * b && b < 2.0 * a;
    if cosine(&v[0], &v[partner]) > -0.7
        || cosine(&v[c], &v[d]) > -0.7
        || cosine(&v[0], &v[c]).abs() > 0.8
        || !similar(v[0].norm(), v[partner].norm())
        || !similar(v[c].norm(), v[d].norm())
    {
        return None;
    }

    let mut cells = BTreeMap::new();
    cells.insert((0, 0), seed);
    cells.insert((1, 0), near[0].0);
    cells.insert((-1, 0), near[partner].0);
    cells.insert((0, 1), near[c].0);
    cells.insert((0, -1), near[d].0);
    Some(cells)
}

/// Expected position of `cell + d` and the local step length.
fn predict(
    points: &[Point2<f64>],
    cells: &BTreeMap<Cell, usize>,
    cell: Cell,
    d: Cell,
) -> Option<(Point2<f64>, f64)> {
    let here = points[*cells.get(&cell)?];
    let back = (cell.0 - d.0, cell.1 - d.1);
    if let Some(&b) = cells.get(&back) {
        let step = here - points[b];
        return Some((here + step, step.norm()));
    }
    for perp in [(d.1, d.0), (-d.1, -d.0)] {
        let side = (cell.0 + perp.0, cell.1 + perp.1);
        let side_next = (side.0 + d.0, side.1 + d.1);
        if let (Some(&s), Some(&sn)) = (cells.get(&side), cells.get(&side_next)) {
            let step = points[sn] - points[s];
            return Some((here + step, step.norm()));
        }
    }
    None
}

fn grow(
    points: &[Point2<f64>],
    seed: usize,
    pattern: ChessboardPattern,
) -> Option<BTreeMap<Cell, usize>> {
    let mut cells = seed_cells(points, seed)?;
    let mut used: HashSet<usize> = cells.values().copied().collect();

    loop {
        let mut added = false;
        let frontier: Vec<Cell> = cells.keys().copied().collect();
        for cell in frontier {
            for d in DIRS {
                let target = (cell.0 + d.0, cell.1 + d.1);
                if cells.contains_key(&target) {
                    continue;
                }
                let Some((expected, step)) = predict(points, &cells, cell, d) else {
                    continue;
                };
                let best = points
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !used.contains(i))
                    .map(|(i, p)| (i, (p - expected).norm()))
                    .min_by(|a, b| a.1.total_cmp(&b.1));
                if let Some((i, dist)) = best {
                    if dist < MATCH_TOLERANCE * step {
                        cells.insert(target, i);
                        used.insert(i);
                        added = true;
                    }
                }
            }
        }
        if cells.len() > pattern.corner_count() {
            return None;
        }
        if !added {
            return Some(cells);
        }
    }
}

/// Orders a complete lattice: rows carry `pattern.cols` corners, the row
/// direction points to +x in the image and the grid is right-handed with y
/// pointing down.
fn order_grid(
    points: &[Point2<f64>],
    cells: &BTreeMap<Cell, usize>,
    pattern: ChessboardPattern,
) -> Option<Vec<Point2<f64>>> {
    let min_i = cells.keys().map(|c| c.0).min()?;
    let max_i = cells.keys().map(|c| c.0).max()?;
    let min_j = cells.keys().map(|c| c.1).min()?;
    let max_j = cells.keys().map(|c| c.1).max()?;
    let ni = (max_i - min_i + 1) as usize;
    let nj = (max_j - min_j + 1) as usize;
    if ni * nj != cells.len() {
        return None;
    }
    let at = |i: usize, j: usize| -> Option<Point2<f64>> {
        cells
            .get(&(min_i + i as i32, min_j + j as i32))
            .map(|&k| points[k])
    };

    let rows_along_i = if pattern.cols == pattern.rows {
        if ni != pattern.cols || nj != pattern.rows {
            return None;
        }
        let i_span = at(ni - 1, 0)? - at(0, 0)?;
        let j_span = at(0, nj - 1)? - at(0, 0)?;
        i_span.x.abs() >= j_span.x.abs()
    } else if ni == pattern.cols && nj == pattern.rows {
        true
    } else if ni == pattern.rows && nj == pattern.cols {
        false
    } else {
        return None;
    };

    let mut grid: Vec<Vec<Point2<f64>>> = Vec::with_capacity(pattern.rows);
    for r in 0..pattern.rows {
        let mut row = Vec::with_capacity(pattern.cols);
        for c in 0..pattern.cols {
            row.push(if rows_along_i { at(c, r)? } else { at(r, c)? });
        }
        grid.push(row);
    }

    let span = |g: &Vec<Vec<Point2<f64>>>| -> (Vector2<f64>, Vector2<f64>) {
        let last_c = pattern.cols - 1;
        let last_r = pattern.rows - 1;
        let row_dir = g.iter().fold(Vector2::zeros(), |acc: Vector2<f64>, row| acc + (row[last_c] - row[0]));
        let col_dir = (0..pattern.cols).fold(Vector2::zeros(), |acc: Vector2<f64>, c| acc + (g[last_r][c] - g[0][c]));
        (row_dir, col_dir)
    };

    let (row_dir, _) = span(&grid);
    if row_dir.x < 0.0 || (row_dir.x == 0.0 && row_dir.y < 0.0) {
        grid.iter_mut().for_each(|row| row.reverse());
    }
    let (row_dir, col_dir) = span(&grid);
    if row_dir.x * col_dir.y - row_dir.y * col_dir.x < 0.0 {
        grid.reverse();
    }
    Some(grid.into_iter().flatten().collect())
}
