//! Step 4: Local minima of the roughness surface
//!
//! Scan the normalized surface for candidate cells whose value is, within a
//! tie tolerance, the lowest among their 4- or 8-connected neighbors. Tied
//! cells form plateaus that are flood filled and collapsed to a single
//! representative. Each minimum carries:
//!
//!   depth  = (average neighbor value) - (cell value)
//!   basin  = connected region grown while values stay below
//!            value + basin_threshold * depth, measured in cells and in
//!            linear-space area
//!
//! plus an optional continued-fraction rational reading of its (x, y)
//! coordinates. Near-coincident minima collapse onto the deeper one and the
//! list is returned sorted by descending depth.
//!
//! All flood fills are iterative with explicit stacks; grids can be large.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::common::{log2_distance, ratio_to_cents};
use crate::grid::GridData;

/// Neighborhood shape for candidate tests and flood fills.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Connectivity {
    Four,
    Eight,
}

/// Out-of-bounds neighbor handling at grid edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BoundaryPolicy {
    /// Drop neighbors that fall outside the grid.
    Skip,
    /// Reflect indices back into the grid.
    Mirror,
}

/// Configuration for Step 4.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinimaConfig {
    pub connectivity: Connectivity,
    pub boundary: BoundaryPolicy,
    /// Values this close count as tied, both in the candidate test and when
    /// growing plateaus.
    pub tie_tolerance: f32, // e.g., 1e-6
    /// Basin cutoff as a fraction of the local depth above the minimum.
    pub basin_threshold: f32, // e.g., 0.5
    /// A minimum this close (log2 octaves, both axes) to a deeper accepted
    /// one is a duplicate.
    pub dedup_log_tolerance: f32, // e.g., 5e-3
    pub max_minima: usize, // e.g., 24
    /// Rational reading of the minimum coordinates.
    pub refine: bool,
    pub max_denominator: u32, // e.g., 64
}

impl Default for MinimaConfig {
    fn default() -> Self {
        Self {
            connectivity: Connectivity::Four,
            boundary: BoundaryPolicy::Skip,
            tie_tolerance: 1e-6,
            basin_threshold: 0.5,
            dedup_log_tolerance: 5e-3,
            max_minima: 24,
            refine: true,
            max_denominator: 64,
        }
    }
}

/// Rational reading of one coordinate, p/q with a denominator cap.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RatioApprox {
    pub num: u32,
    pub den: u32,
    pub value: f32,
    pub error_cents: f32,
}

/// One local minimum of the surface. Never mutated after creation.
#[derive(Clone, Debug)]
pub struct MinimaPoint {
    pub x: f32,
    pub y: f32,
    pub ix: usize,
    pub iy: usize,
    /// Normalized roughness at the cell.
    pub value: f32,
    /// Average neighbor value minus the cell value.
    pub depth: f32,
    /// Cells in the tied plateau containing this minimum (1 when isolated).
    pub plateau_size: usize,
    pub basin_cells: usize,
    /// Linear-space area of the basin.
    pub basin_area: f32,
    /// Radius of the circle with the basin's area.
    pub basin_radius: f32,
    /// Absolute cutoff the basin was grown under.
    pub basin_threshold_value: f32,
    pub x_approx: Option<RatioApprox>,
    pub y_approx: Option<RatioApprox>,
}

/// Output of Step 4.
#[derive(Clone, Debug, Default)]
pub struct MinimaResult {
    pub minima: Vec<MinimaPoint>,
    /// Minima that went through rational refinement.
    pub refine_passes: usize,
    /// Continued-fraction candidates examined across all refinements.
    pub refine_steps: usize,
}

/// Main entry point for Step 4.
pub fn run_minima_step(grid: &GridData, cfg: &MinimaConfig) -> MinimaResult {
    let nx = grid.nx();
    let ny = grid.ny();
    if nx < 3 || ny < 3 {
        return MinimaResult::default();
    }
    let values = &grid.normalized;

    // 1) Candidate scan over interior cells; each plateau is claimed once.
    let mut claimed = vec![false; nx * ny];
    let mut found: Vec<MinimaPoint> = Vec::new();
    for iy in 1..ny - 1 {
        for ix in 1..nx - 1 {
            if claimed[iy * nx + ix] || !is_candidate(values, nx, ny, ix, iy, cfg) {
                continue;
            }

            // 2) Collapse the tied plateau to its lowest cell.
            let plateau = flood_plateau(values, nx, ny, ix, iy, cfg, &mut claimed);
            let (rix, riy) = representative(&plateau, values, nx);
            let value = values[riy * nx + rix];
            let depth = neighbor_average(values, nx, ny, rix, riy, cfg) - value;
            if depth <= 0.0 {
                // Flat or inverted neighborhoods carry no usable minimum.
                continue;
            }

            // 3) Grow the basin below a fraction of the local depth.
            let threshold_value = value + cfg.basin_threshold * depth;
            let (basin_cells, basin_area) =
                flood_basin(grid, values, nx, ny, rix, riy, threshold_value, cfg);

            found.push(MinimaPoint {
                x: grid.xs[rix],
                y: grid.ys[riy],
                ix: rix,
                iy: riy,
                value,
                depth,
                plateau_size: plateau.len(),
                basin_cells,
                basin_area,
                basin_radius: (basin_area / std::f32::consts::PI).max(0.0).sqrt(),
                basin_threshold_value: threshold_value,
                x_approx: None,
                y_approx: None,
            });
        }
    }

    // 4) Deepest first; nearby shallower ones are duplicates.
    found.sort_by(|a, b| b.depth.partial_cmp(&a.depth).unwrap());
    let mut minima: Vec<MinimaPoint> = Vec::new();
    for m in found {
        let duplicate = minima.iter().any(|k| {
            log2_distance(m.x, k.x) < cfg.dedup_log_tolerance
                && log2_distance(m.y, k.y) < cfg.dedup_log_tolerance
        });
        if !duplicate {
            minima.push(m);
        }
    }
    minima.truncate(cfg.max_minima);

    // 5) Rational reading of the surviving coordinates.
    let mut refine_passes = 0;
    let mut refine_steps = 0;
    if cfg.refine {
        for m in &mut minima {
            let (xa, xs) = rational_reading(m.x, cfg.max_denominator);
            let (ya, ys) = rational_reading(m.y, cfg.max_denominator);
            m.x_approx = xa;
            m.y_approx = ya;
            refine_steps += xs + ys;
            refine_passes += 1;
        }
    }

    debug!(minima = minima.len(), refine_passes, "minima scan done");
    MinimaResult {
        minima,
        refine_passes,
        refine_steps,
    }
}

const FOUR: &[(isize, isize)] = &[(-1, 0), (1, 0), (0, -1), (0, 1)];
const EIGHT: &[(isize, isize)] = &[
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

fn offsets(conn: Connectivity) -> &'static [(isize, isize)] {
    match conn {
        Connectivity::Four => FOUR,
        Connectivity::Eight => EIGHT,
    }
}

/// Neighbor index under the boundary policy, or `None` when skipped.
fn resolve(
    nx: usize,
    ny: usize,
    ix: usize,
    iy: usize,
    (dx, dy): (isize, isize),
    boundary: BoundaryPolicy,
) -> Option<(usize, usize)> {
    let mut jx = ix as isize + dx;
    let mut jy = iy as isize + dy;
    match boundary {
        BoundaryPolicy::Skip => {
            if jx < 0 || jy < 0 || jx >= nx as isize || jy >= ny as isize {
                return None;
            }
        }
        BoundaryPolicy::Mirror => {
            if jx < 0 {
                jx = -jx;
            }
            if jx >= nx as isize {
                jx = 2 * (nx as isize - 1) - jx;
            }
            if jy < 0 {
                jy = -jy;
            }
            if jy >= ny as isize {
                jy = 2 * (ny as isize - 1) - jy;
            }
            jx = jx.clamp(0, nx as isize - 1);
            jy = jy.clamp(0, ny as isize - 1);
        }
    }
    Some((jx as usize, jy as usize))
}

fn is_candidate(values: &[f32], nx: usize, ny: usize, ix: usize, iy: usize, cfg: &MinimaConfig) -> bool {
    let v = values[iy * nx + ix];
    offsets(cfg.connectivity).iter().all(|&off| {
        match resolve(nx, ny, ix, iy, off, cfg.boundary) {
            Some((jx, jy)) => v <= values[jy * nx + jx] + cfg.tie_tolerance,
            None => true,
        }
    })
}

fn neighbor_average(values: &[f32], nx: usize, ny: usize, ix: usize, iy: usize, cfg: &MinimaConfig) -> f32 {
    let mut sum = 0.0f64;
    let mut count = 0u32;
    for &off in offsets(cfg.connectivity) {
        if let Some((jx, jy)) = resolve(nx, ny, ix, iy, off, cfg.boundary) {
            sum += f64::from(values[jy * nx + jx]);
            count += 1;
        }
    }
    if count == 0 {
        return values[iy * nx + ix];
    }
    (sum / f64::from(count)) as f32
}

/// Connected cells within the tie tolerance of the seed value. Marks every
/// member claimed so a plateau yields exactly one minimum.
fn flood_plateau(
    values: &[f32],
    nx: usize,
    ny: usize,
    ix: usize,
    iy: usize,
    cfg: &MinimaConfig,
    claimed: &mut [bool],
) -> Vec<(usize, usize)> {
    let seed_value = values[iy * nx + ix];
    let mut members = Vec::new();
    let mut stack = vec![(ix, iy)];
    claimed[iy * nx + ix] = true;
    while let Some((cx, cy)) = stack.pop() {
        members.push((cx, cy));
        for &off in offsets(cfg.connectivity) {
            if let Some((jx, jy)) = resolve(nx, ny, cx, cy, off, cfg.boundary) {
                let at = jy * nx + jx;
                if !claimed[at] && (values[at] - seed_value).abs() <= cfg.tie_tolerance {
                    claimed[at] = true;
                    stack.push((jx, jy));
                }
            }
        }
    }
    members
}

/// Lowest-valued plateau cell; ties break on (iy, ix) scan order.
fn representative(plateau: &[(usize, usize)], values: &[f32], nx: usize) -> (usize, usize) {
    let mut best = plateau[0];
    for &(ix, iy) in &plateau[1..] {
        let (bx, by) = best;
        let v = values[iy * nx + ix];
        let bv = values[by * nx + bx];
        if v < bv || (v == bv && (iy, ix) < (by, bx)) {
            best = (ix, iy);
        }
    }
    best
}

/// Grow the basin from the minimum while values stay strictly below the
/// cutoff, accumulating linear-space cell areas.
fn flood_basin(
    grid: &GridData,
    values: &[f32],
    nx: usize,
    ny: usize,
    ix: usize,
    iy: usize,
    threshold_value: f32,
    cfg: &MinimaConfig,
) -> (usize, f32) {
    let mut visited = vec![false; nx * ny];
    let mut stack = vec![(ix, iy)];
    visited[iy * nx + ix] = true;
    let mut cells = 0usize;
    let mut area = 0.0f64;
    while let Some((cx, cy)) = stack.pop() {
        cells += 1;
        area += f64::from(grid.area_at(cx, cy));
        for &off in offsets(cfg.connectivity) {
            if let Some((jx, jy)) = resolve(nx, ny, cx, cy, off, cfg.boundary) {
                let at = jy * nx + jx;
                if !visited[at] && values[at] < threshold_value {
                    visited[at] = true;
                    stack.push((jx, jy));
                }
            }
        }
    }
    (cells, area as f32)
}

/// Best p/q reading of `target` under the denominator cap, preferring the
/// smaller denominator on near-equal error. Returns the pick and the number
/// of candidates examined.
fn rational_reading(target: f32, max_den: u32) -> (Option<RatioApprox>, usize) {
    if !target.is_finite() || target <= 0.0 {
        return (None, 0);
    }
    let cents = ratio_to_cents(target);
    let mut best: Option<RatioApprox> = None;
    let mut steps = 0usize;
    for (num, den) in convergents_with_mediants(target, max_den) {
        steps += 1;
        if den == 0 {
            continue;
        }
        let value = num as f32 / den as f32;
        let error_cents = (ratio_to_cents(value) - cents).abs();
        let better = match &best {
            None => true,
            Some(b) => {
                error_cents + 1e-6 < b.error_cents
                    || ((error_cents - b.error_cents).abs() <= 1e-6 && den < b.den)
            }
        };
        if better {
            best = Some(RatioApprox {
                num,
                den,
                value,
                error_cents,
            });
        }
    }
    (best, steps)
}

/// Continued-fraction convergents of `target` with a denominator cap,
/// densified with the mediants of consecutive convergents.
fn convergents_with_mediants(target: f32, max_den: u32) -> Vec<(u32, u32)> {
    let cap = u64::from(max_den.max(1));
    let mut out: Vec<(u32, u32)> = Vec::new();
    let mut x = f64::from(target);
    let (mut p0, mut q0): (u64, u64) = (1, 0);
    let (mut p1, mut q1): (u64, u64) = (x.floor() as u64, 1);
    out.push((p1 as u32, 1));
    for _ in 0..24 {
        let frac = x - x.floor();
        if frac.abs() < 1e-12 {
            break;
        }
        x = 1.0 / frac;
        let a = x.floor() as u64;
        let p2 = a.saturating_mul(p1).saturating_add(p0);
        let q2 = a.saturating_mul(q1).saturating_add(q0);
        if q2 > cap || p2 > u64::from(u32::MAX) {
            break;
        }
        out.push((p2 as u32, q2 as u32));
        (p0, q0, p1, q1) = (p1, q1, p2, q2);
    }
    let mut mediants: Vec<(u32, u32)> = Vec::new();
    for w in out.windows(2) {
        let (pa, qa) = w[0];
        let (pb, qb) = w[1];
        let pm = u64::from(pa) + u64::from(pb);
        let qm = u64::from(qa) + u64::from(qb);
        if qm <= cap && pm <= u64::from(u32::MAX) {
            mediants.push((pm as u32, qm as u32));
        }
    }
    out.extend(mediants);
    out.sort_unstable();
    out.dedup();
    out
}
