//! Step 3: Roughness surface over a 2D ratio grid
//!
//! Sweep the roughness of a root tone plus two transposed interval tones
//! over a grid of (x, y) frequency-ratio multipliers:
//!
//! ```text
//! D(x, y) = roughness( root@1  +  interval@x  +  interval@y )
//! ```
//!
//! Axes are linear or log-spaced; resolution is fixed or chosen by a
//! pair-count cost heuristic; progressive refinement inserts samples where
//! the surface is steep or near coarse minima, never discarding computed
//! cells. Rows are evaluated in parallel. Cancellation is cooperative at
//! refinement-pass granularity and returns the last completed pass's grid;
//! the baseline pass always completes (its cost is capped by `max_steps`).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::common::{cents_to_ratio, log2_distance, ratio_to_cents};
use crate::pairs::PairIndexCache;
use crate::roughness::{
    PointDiagnostics, RoughnessConstants, RoughnessOptions, TONE_ROOT, TONE_X, TONE_Y,
    TonePartial, evaluate_point, realize_template,
};
use crate::timbre::TimbreTemplate;

/// Kernel evaluations targeted by one auto-resolution baseline pass.
const PAIR_EVAL_BUDGET: usize = 2_000_000;

/// Inserted samples closer than this (log2 octaves) to an existing one are
/// dropped to keep the axes strictly increasing.
const MIN_AXIS_SEPARATION: f32 = 1e-7;

/// Two coarse minima within this log2 distance count as the same one.
const NEW_MINIMUM_LOG2_EPS: f32 = 2e-3;

/// Configuration rejection; raised before any grid allocation.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid range: {0}")]
    InvalidRange(String),
    #[error("invalid resolution: {0}")]
    InvalidResolution(String),
    #[error("invalid refinement: {0}")]
    InvalidRefinement(String),
}

/// Resolution selection for the baseline pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    /// Explicit per-axis step counts.
    Fixed { x_steps: usize, y_steps: usize },
    /// Square resolution between the bounds, picked by the cost heuristic.
    Auto { low_steps: usize, high_steps: usize },
}

/// How `normalized` derives from `raw`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NormalizationMode {
    None,
    /// Divide by the grid's maximum raw value.
    Max,
    /// Divide by the root-mean-square of the raw values.
    Energy,
    /// Divide by a caller-supplied value (e.g. the unison roughness).
    Reference(f32),
}

/// Progressive refinement block. A zero `progressive_steps`, an infinite
/// `gradient_threshold`, or a zero `minima_neighborhood`/`density` switches
/// the corresponding strategy off.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineConfig {
    pub enabled: bool,
    /// Sliding-window advance per pass, in cells.
    pub window: usize, // e.g., 4
    /// Width of the densified window, in cells.
    pub progressive_steps: usize, // e.g., 8
    /// Insert where adjacent raw values differ by more than this.
    pub gradient_threshold: f32, // e.g., 0.05
    /// Cells around each coarse minimum eligible for extra samples.
    pub minima_neighborhood: usize, // e.g., 2
    /// Box-smoothing radius for the coarse minima scan (0 = off).
    pub minima_smoothing: usize, // e.g., 1
    /// Extra samples per axis inside each minima band.
    pub density: usize, // e.g., 4
    /// Width of the minima band, in cents.
    pub band_cents: f32, // e.g., 30.0
    /// Pass budget.
    pub base_steps: usize, // e.g., 2
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window: 4,
            progressive_steps: 8,
            gradient_threshold: 0.05,
            minima_neighborhood: 2,
            minima_smoothing: 1,
            density: 4,
            band_cents: 30.0,
            base_steps: 2,
        }
    }
}

/// Configuration for Step 3.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Frequency-ratio domain of the x axis (low, high).
    pub x_range: (f32, f32), // e.g., (1.0, 2.0)
    pub y_range: (f32, f32),
    pub resolution: Resolution,
    /// Global per-axis sample cap; the caller's cost budget.
    pub max_steps: usize, // e.g., 257
    /// Geometric axis spacing (uniform in log space).
    pub log_sampling: bool,
    /// Restrict the y-domain to one octave above its low bound.
    pub fold_octave: bool,
    /// Absolute frequency of ratio 1.0 (Hz).
    pub base_freq_hz: f32, // e.g., 261.63
    pub normalization: NormalizationMode,
    pub refine: RefineConfig,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            x_range: (1.0, 2.0),
            y_range: (1.0, 2.0),
            resolution: Resolution::Auto {
                low_steps: 33,
                high_steps: 129,
            },
            max_steps: 257,
            log_sampling: true,
            fold_octave: false,
            base_freq_hz: 261.63,
            normalization: NormalizationMode::Max,
            refine: RefineConfig::default(),
        }
    }
}

impl SamplingConfig {
    /// Fail-fast validation, run before any allocation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("x_range", self.x_range)?;
        check_range("y_range", self.y_range)?;
        if !self.base_freq_hz.is_finite() || self.base_freq_hz <= 0.0 {
            return Err(ConfigError::InvalidRange(format!(
                "base_freq_hz must be positive and finite (got {})",
                self.base_freq_hz
            )));
        }
        if self.max_steps < 2 {
            return Err(ConfigError::InvalidResolution(format!(
                "max_steps must be at least 2 (got {})",
                self.max_steps
            )));
        }
        match self.resolution {
            Resolution::Fixed { x_steps, y_steps } => {
                if x_steps < 2 || y_steps < 2 {
                    return Err(ConfigError::InvalidResolution(format!(
                        "fixed resolution needs at least 2 steps per axis (got {x_steps}x{y_steps})"
                    )));
                }
            }
            Resolution::Auto {
                low_steps,
                high_steps,
            } => {
                if low_steps < 2 || high_steps < low_steps {
                    return Err(ConfigError::InvalidResolution(format!(
                        "auto bounds must satisfy 2 <= low <= high (got {low_steps}..{high_steps})"
                    )));
                }
                if self.max_steps < low_steps {
                    return Err(ConfigError::InvalidResolution(format!(
                        "max_steps {} is below the auto low bound {}",
                        self.max_steps, low_steps
                    )));
                }
            }
        }
        if let NormalizationMode::Reference(v) = self.normalization
            && !v.is_finite()
        {
            return Err(ConfigError::InvalidRange(
                "normalization reference must be finite".to_string(),
            ));
        }
        let r = &self.refine;
        if r.enabled {
            if r.base_steps == 0 || r.window == 0 {
                return Err(ConfigError::InvalidRefinement(format!(
                    "base_steps and window must be positive (got {} and {})",
                    r.base_steps, r.window
                )));
            }
            if r.gradient_threshold.is_nan() || r.gradient_threshold < 0.0 {
                return Err(ConfigError::InvalidRefinement(format!(
                    "gradient_threshold must be non-negative (got {})",
                    r.gradient_threshold
                )));
            }
            if r.minima_neighborhood > 0 && r.density > 0 && !(r.band_cents > 0.0) {
                return Err(ConfigError::InvalidRefinement(format!(
                    "band_cents must be positive when the minima strategy is on (got {})",
                    r.band_cents
                )));
            }
        }
        Ok(())
    }
}

fn check_range(name: &str, (lo, hi): (f32, f32)) -> Result<(), ConfigError> {
    if !lo.is_finite() || !hi.is_finite() || lo <= 0.0 || hi <= lo {
        return Err(ConfigError::InvalidRange(format!(
            "{name} must be finite, positive, and increasing (got {lo}..{hi})"
        )));
    }
    Ok(())
}

/// Cooperative cancellation flag shared with the caller.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Grid axis selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GridAxis {
    X,
    Y,
}

/// Display scale for axis values. A closed set, matched exhaustively;
/// unrecognized kinds cannot exist.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AxisScale {
    /// Plain frequency ratio.
    Ratio,
    /// Natural log of the ratio.
    NaturalLog,
    /// 1200 * log2(ratio).
    Cents,
}

/// Optional per-point diagnostic arrays, parallel to `raw`.
#[derive(Clone, Debug, Default)]
pub struct PointDiagnosticsGrid {
    pub total_pairs: Vec<u32>,
    pub skipped_pairs: Vec<u32>,
    pub invalid_partials: Vec<u32>,
    pub pruned_partials: Vec<u32>,
    pub max_pair: Vec<f32>,
    pub silent: Vec<bool>,
}

/// Aggregated diagnostics for a finished grid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GridSummary {
    pub points: usize,
    pub silent_points: usize,
    pub total_pairs: u64,
    pub skipped_pairs: u64,
    pub invalid_partials: u64,
    pub pruned_partials: u64,
    pub refine_passes_run: usize,
    pub samples_inserted: usize,
    pub cancelled: bool,
}

/// Roughness surface. Values are row-major: index = iy * xs.len() + ix.
#[derive(Clone, Debug)]
pub struct GridData {
    pub xs: Vec<f32>,
    pub ys: Vec<f32>,
    /// Natural logs of the axes; strictly monotonic, always populated.
    pub log_x: Vec<f32>,
    pub log_y: Vec<f32>,
    pub raw: Vec<f32>,
    pub normalized: Vec<f32>,
    /// Per-sample linear-space cell extents, populated under log sampling
    /// (uniform index spacing is then non-uniform in ratio space). End
    /// cells cover their single-sided half interval.
    pub cell_width: Option<Vec<f32>>,
    pub cell_height: Option<Vec<f32>>,
    /// Outer product of width and height, parallel to `raw`.
    pub cell_area: Option<Vec<f32>>,
    pub diagnostics: Option<PointDiagnosticsGrid>,
    pub summary: GridSummary,
    pub normalization: NormalizationMode,
    pub min_raw: f32,
    pub max_raw: f32,
    pub min_norm: f32,
    pub max_norm: f32,
}

impl GridData {
    pub fn nx(&self) -> usize {
        self.xs.len()
    }

    pub fn ny(&self) -> usize {
        self.ys.len()
    }

    #[inline]
    pub fn idx(&self, ix: usize, iy: usize) -> usize {
        iy * self.xs.len() + ix
    }

    pub fn value_at(&self, ix: usize, iy: usize) -> f32 {
        self.normalized[self.idx(ix, iy)]
    }

    /// Axis coordinates under a display scale.
    pub fn axis_values(&self, axis: GridAxis, scale: AxisScale) -> Vec<f32> {
        let (ratios, logs) = match axis {
            GridAxis::X => (&self.xs, &self.log_x),
            GridAxis::Y => (&self.ys, &self.log_y),
        };
        match scale {
            AxisScale::Ratio => ratios.clone(),
            AxisScale::NaturalLog => logs.clone(),
            AxisScale::Cents => ratios.iter().map(|&r| ratio_to_cents(r)).collect(),
        }
    }

    /// Linear-space area of one cell, falling back to uniform spacing when
    /// the cell metrics are absent.
    pub fn area_at(&self, ix: usize, iy: usize) -> f32 {
        if let Some(area) = &self.cell_area {
            return area[self.idx(ix, iy)];
        }
        let w = uniform_extent(&self.xs, ix);
        let h = uniform_extent(&self.ys, iy);
        w * h
    }
}

fn uniform_extent(axis: &[f32], k: usize) -> f32 {
    let n = axis.len();
    if n < 2 {
        return 0.0;
    }
    let left = if k == 0 { axis[0] } else { 0.5 * (axis[k - 1] + axis[k]) };
    let right = if k + 1 == n {
        axis[n - 1]
    } else {
        0.5 * (axis[k] + axis[k + 1])
    };
    right - left
}

/// Main entry point for Step 3.
#[allow(clippy::too_many_arguments)]
pub fn run_grid_step(
    root: &TimbreTemplate,
    interval: &TimbreTemplate,
    consts: &RoughnessConstants,
    opts: &RoughnessOptions,
    cfg: &SamplingConfig,
    cache: &PairIndexCache,
    cancel: &CancelToken,
) -> Result<GridData, ConfigError> {
    cfg.validate()?;

    // 1) Domain and baseline resolution.
    let x_range = cfg.x_range;
    let mut y_range = cfg.y_range;
    if cfg.fold_octave {
        y_range.1 = y_range.1.min(2.0 * y_range.0);
    }
    let (x_steps, y_steps) = baseline_steps(cfg, root.len(), interval.len());
    debug!(x_steps, y_steps, "baseline resolution");

    let mut state = GridState::new(
        build_axis(x_range, x_steps, cfg.log_sampling),
        build_axis(y_range, y_steps, cfg.log_sampling),
    );

    // 2) Baseline pass; always runs to completion.
    compute_missing(&mut state, root, interval, consts, opts, cfg, cache);

    // 3) Refinement passes, cancel-checked at pass boundaries.
    let mut passes_run = 0usize;
    let mut inserted_total = 0usize;
    let mut cancelled = false;
    if cfg.refine.enabled {
        let mut prev_minima = coarse_minima_locations(&state, &cfg.refine);
        for pass in 0..cfg.refine.base_steps {
            if cancel.is_cancelled() {
                cancelled = true;
                debug!(pass, "cancelled; keeping last completed pass");
                break;
            }
            let (new_xs, new_ys) = plan_refinement(&state, cfg, pass);
            if new_xs.is_empty() && new_ys.is_empty() {
                debug!(pass, "refinement converged: nothing to insert");
                break;
            }
            let before = state.xs.len() + state.ys.len();
            state.insert_samples(&new_xs, &new_ys);
            compute_missing(&mut state, root, interval, consts, opts, cfg, cache);
            inserted_total += state.xs.len() + state.ys.len() - before;
            passes_run += 1;

            let now_minima = coarse_minima_locations(&state, &cfg.refine);
            if !has_new_minima(&prev_minima, &now_minima) {
                debug!(pass, "refinement converged: no new minima");
                break;
            }
            prev_minima = now_minima;
        }
    }

    // 4) Normalize and package.
    Ok(state.finish(cfg, passes_run, inserted_total, cancelled, opts.collect_diagnostics))
}

fn baseline_steps(cfg: &SamplingConfig, root_len: usize, interval_len: usize) -> (usize, usize) {
    match cfg.resolution {
        Resolution::Fixed { x_steps, y_steps } => {
            (x_steps.min(cfg.max_steps), y_steps.min(cfg.max_steps))
        }
        Resolution::Auto {
            low_steps,
            high_steps,
        } => {
            let m = root_len + 2 * interval_len;
            let pairs_per_point = (m * m.saturating_sub(1) / 2).max(1);
            let points = PAIR_EVAL_BUDGET / pairs_per_point;
            let steps = (points as f64).sqrt().floor() as usize;
            let s = steps.clamp(low_steps, high_steps).min(cfg.max_steps);
            (s, s)
        }
    }
}

fn build_axis((lo, hi): (f32, f32), steps: usize, log: bool) -> Vec<f32> {
    let n = steps.max(2);
    let mut out = Vec::with_capacity(n);
    if log {
        let llo = (lo as f64).ln();
        let lhi = (hi as f64).ln();
        for k in 0..n {
            let t = k as f64 / (n - 1) as f64;
            out.push((llo + t * (lhi - llo)).exp() as f32);
        }
    } else {
        for k in 0..n {
            let t = k as f32 / (n - 1) as f32;
            out.push(lo + t * (hi - lo));
        }
    }
    out[0] = lo;
    out[n - 1] = hi;
    out
}

/// One computed cell, carried over verbatim across refinement inserts.
#[derive(Clone, Copy, Debug, Default)]
struct CellRecord {
    raw: f32,
    diag: PointDiagnostics,
}

struct GridState {
    xs: Vec<f32>,
    ys: Vec<f32>,
    /// Row-major; `None` marks cells not yet evaluated.
    cells: Vec<Option<CellRecord>>,
}

impl GridState {
    fn new(xs: Vec<f32>, ys: Vec<f32>) -> Self {
        let cells = vec![None; xs.len() * ys.len()];
        Self { xs, ys, cells }
    }

    /// Grow the axes, keeping every computed cell at its coordinates.
    fn insert_samples(&mut self, new_xs: &[f32], new_ys: &[f32]) {
        let xs2 = merge_axis(&self.xs, new_xs);
        let ys2 = merge_axis(&self.ys, new_ys);
        if xs2.len() == self.xs.len() && ys2.len() == self.ys.len() {
            return;
        }
        let nx2 = xs2.len();
        let mut cells2: Vec<Option<CellRecord>> = vec![None; nx2 * ys2.len()];
        let nx = self.xs.len();
        // Old coordinates are copied bit-identical into the merged axes, so
        // exact binary search recovers every prior cell.
        let x_map: Vec<usize> = self
            .xs
            .iter()
            .map(|x| {
                xs2.binary_search_by(|p| p.partial_cmp(x).unwrap())
                    .unwrap_or(usize::MAX)
            })
            .collect();
        let y_map: Vec<usize> = self
            .ys
            .iter()
            .map(|y| {
                ys2.binary_search_by(|p| p.partial_cmp(y).unwrap())
                    .unwrap_or(usize::MAX)
            })
            .collect();
        debug_assert!(x_map.iter().chain(&y_map).all(|&m| m != usize::MAX));
        for (iy, &iy2) in y_map.iter().enumerate() {
            for (ix, &ix2) in x_map.iter().enumerate() {
                if iy2 != usize::MAX && ix2 != usize::MAX {
                    cells2[iy2 * nx2 + ix2] = self.cells[iy * nx + ix].take();
                }
            }
        }
        self.xs = xs2;
        self.ys = ys2;
        self.cells = cells2;
    }

    fn raw_at(&self, ix: usize, iy: usize) -> f32 {
        self.cells[iy * self.xs.len() + ix]
            .as_ref()
            .map_or(0.0, |c| c.raw)
    }

    fn finish(
        self,
        cfg: &SamplingConfig,
        refine_passes_run: usize,
        samples_inserted: usize,
        cancelled: bool,
        keep_point_diagnostics: bool,
    ) -> GridData {
        debug_assert!(self.cells.iter().all(Option::is_some));
        let nx = self.xs.len();
        let ny = self.ys.len();
        let points = nx * ny;

        let mut raw = Vec::with_capacity(points);
        let mut summary = GridSummary {
            points,
            refine_passes_run,
            samples_inserted,
            cancelled,
            ..Default::default()
        };
        let mut diag_arrays = keep_point_diagnostics.then(|| PointDiagnosticsGrid {
            total_pairs: Vec::with_capacity(points),
            skipped_pairs: Vec::with_capacity(points),
            invalid_partials: Vec::with_capacity(points),
            pruned_partials: Vec::with_capacity(points),
            max_pair: Vec::with_capacity(points),
            silent: Vec::with_capacity(points),
        });
        for cell in &self.cells {
            let c = cell.unwrap_or_default();
            raw.push(c.raw);
            summary.total_pairs += u64::from(c.diag.total_pairs);
            summary.skipped_pairs += u64::from(c.diag.skipped_pairs);
            summary.invalid_partials += u64::from(c.diag.invalid_partials);
            summary.pruned_partials += u64::from(c.diag.pruned_partials);
            if c.diag.silent {
                summary.silent_points += 1;
            }
            if let Some(d) = &mut diag_arrays {
                d.total_pairs.push(c.diag.total_pairs);
                d.skipped_pairs.push(c.diag.skipped_pairs);
                d.invalid_partials.push(c.diag.invalid_partials);
                d.pruned_partials.push(c.diag.pruned_partials);
                d.max_pair.push(c.diag.max_pair);
                d.silent.push(c.diag.silent);
            }
        }

        let min_raw = raw.iter().copied().fold(f32::INFINITY, f32::min);
        let max_raw = raw.iter().copied().fold(f32::NEG_INFINITY, f32::max);

        let normalized = normalize_values(&raw, cfg.normalization);
        let min_norm = normalized.iter().copied().fold(f32::INFINITY, f32::min);
        let max_norm = normalized.iter().copied().fold(f32::NEG_INFINITY, f32::max);

        let (cell_width, cell_height, cell_area) = if cfg.log_sampling {
            let w: Vec<f32> = (0..nx).map(|k| uniform_extent(&self.xs, k)).collect();
            let h: Vec<f32> = (0..ny).map(|k| uniform_extent(&self.ys, k)).collect();
            let mut area = Vec::with_capacity(points);
            for hy in &h {
                for wx in &w {
                    area.push(wx * hy);
                }
            }
            (Some(w), Some(h), Some(area))
        } else {
            (None, None, None)
        };

        GridData {
            log_x: self.xs.iter().map(|&x| x.ln()).collect(),
            log_y: self.ys.iter().map(|&y| y.ln()).collect(),
            xs: self.xs,
            ys: self.ys,
            raw,
            normalized,
            cell_width,
            cell_height,
            cell_area,
            diagnostics: diag_arrays,
            summary,
            normalization: cfg.normalization,
            min_raw,
            max_raw,
            min_norm,
            max_norm,
        }
    }
}

fn normalize_values(raw: &[f32], mode: NormalizationMode) -> Vec<f32> {
    let denom = match mode {
        NormalizationMode::None => return raw.to_vec(),
        NormalizationMode::Max => raw.iter().copied().fold(f32::NEG_INFINITY, f32::max),
        NormalizationMode::Energy => {
            let sum: f64 = raw.iter().map(|&v| (v as f64) * (v as f64)).sum();
            (sum / raw.len().max(1) as f64).sqrt() as f32
        }
        NormalizationMode::Reference(v) => v,
    };
    if denom.abs() > 1e-12 {
        raw.iter().map(|&v| v / denom).collect()
    } else {
        raw.to_vec()
    }
}

/// Evaluate every not-yet-computed cell, rows in parallel.
fn compute_missing(
    state: &mut GridState,
    root: &TimbreTemplate,
    interval: &TimbreTemplate,
    consts: &RoughnessConstants,
    opts: &RoughnessOptions,
    cfg: &SamplingConfig,
    cache: &PairIndexCache,
) {
    let nx = state.xs.len();
    let xs = &state.xs;
    let ys = &state.ys;
    let cells = &state.cells;
    let base = cfg.base_freq_hz;
    let capacity = root.len() + 2 * interval.len();

    let rows: Vec<(usize, Vec<(usize, CellRecord)>)> = (0..ys.len())
        .into_par_iter()
        .map(|iy| {
            let mut scratch: Vec<TonePartial> = Vec::with_capacity(capacity);
            let mut row = Vec::new();
            for ix in 0..nx {
                if cells[iy * nx + ix].is_some() {
                    continue;
                }
                scratch.clear();
                realize_template(root, base, 1.0, TONE_ROOT, &mut scratch);
                realize_template(interval, base, xs[ix], TONE_X, &mut scratch);
                realize_template(interval, base, ys[iy], TONE_Y, &mut scratch);
                let point = evaluate_point(&scratch, consts, opts, cache);
                row.push((
                    ix,
                    CellRecord {
                        raw: point.total,
                        diag: point.diag,
                    },
                ));
            }
            (iy, row)
        })
        .collect();

    for (iy, row) in rows {
        for (ix, cell) in row {
            state.cells[iy * nx + ix] = Some(cell);
        }
    }
}

/// Candidate sample coordinates for one refinement pass, capped so the axes
/// never exceed `max_steps`. Fixed-window inserts are planned first, then
/// gradient midpoints, then minima bands; the cap truncates from the back.
fn plan_refinement(state: &GridState, cfg: &SamplingConfig, pass: usize) -> (Vec<f32>, Vec<f32>) {
    let r = &cfg.refine;
    let mut new_x: Vec<f32> = Vec::new();
    let mut new_y: Vec<f32> = Vec::new();

    refine_fixed_axis(&state.xs, r, pass, cfg.log_sampling, &mut new_x);
    refine_fixed_axis(&state.ys, r, pass, cfg.log_sampling, &mut new_y);
    refine_gradient(state, r, cfg.log_sampling, &mut new_x, &mut new_y);
    refine_minima_bands(state, r, &mut new_x, &mut new_y);

    new_x.truncate(cfg.max_steps.saturating_sub(state.xs.len()));
    new_y.truncate(cfg.max_steps.saturating_sub(state.ys.len()));
    (new_x, new_y)
}

fn midpoint(a: f32, b: f32, log: bool) -> f32 {
    if log {
        ((a as f64) * (b as f64)).sqrt() as f32
    } else {
        0.5 * (a + b)
    }
}

/// Uniform densification inside a window that slides along the axis.
fn refine_fixed_axis(axis: &[f32], r: &RefineConfig, pass: usize, log: bool, out: &mut Vec<f32>) {
    if r.progressive_steps == 0 {
        return;
    }
    let cells = axis.len() - 1;
    let width = r.progressive_steps.min(cells);
    let positions = (cells - width + 1).max(1);
    let start = (pass * r.window) % positions;
    for k in start..start + width {
        out.push(midpoint(axis[k], axis[k + 1], log));
    }
}

/// Midpoints wherever adjacent raw values jump by more than the threshold
/// in any row (x axis) or column (y axis).
fn refine_gradient(
    state: &GridState,
    r: &RefineConfig,
    log: bool,
    out_x: &mut Vec<f32>,
    out_y: &mut Vec<f32>,
) {
    if !r.gradient_threshold.is_finite() {
        return;
    }
    let nx = state.xs.len();
    let ny = state.ys.len();
    for ix in 0..nx - 1 {
        let steep = (0..ny)
            .any(|iy| (state.raw_at(ix + 1, iy) - state.raw_at(ix, iy)).abs() > r.gradient_threshold);
        if steep {
            out_x.push(midpoint(state.xs[ix], state.xs[ix + 1], log));
        }
    }
    for iy in 0..ny - 1 {
        let steep = (0..nx)
            .any(|ix| (state.raw_at(ix, iy + 1) - state.raw_at(ix, iy)).abs() > r.gradient_threshold);
        if steep {
            out_y.push(midpoint(state.ys[iy], state.ys[iy + 1], log));
        }
    }
}

/// Extra samples in a cents band around each coarse minimum.
fn refine_minima_bands(state: &GridState, r: &RefineConfig, out_x: &mut Vec<f32>, out_y: &mut Vec<f32>) {
    if r.minima_neighborhood == 0 || r.density == 0 {
        return;
    }
    for (ix, iy) in coarse_minima_indices(state, r) {
        push_band(&state.xs, ix, r, out_x);
        push_band(&state.ys, iy, r, out_y);
    }
}

fn push_band(axis: &[f32], idx: usize, r: &RefineConfig, out: &mut Vec<f32>) {
    let lo_lim = axis[idx.saturating_sub(r.minima_neighborhood)];
    let hi_lim = axis[(idx + r.minima_neighborhood).min(axis.len() - 1)];
    let half = cents_to_ratio(0.5 * r.band_cents);
    let lo = (axis[idx] / half).max(lo_lim);
    let hi = (axis[idx] * half).min(hi_lim);
    if hi <= lo {
        return;
    }
    let llo = (lo as f64).ln();
    let lhi = (hi as f64).ln();
    for k in 1..=r.density {
        let t = k as f64 / (r.density + 1) as f64;
        out.push((llo + t * (lhi - llo)).exp() as f32);
    }
}

/// Strict interior minima of the (optionally box-smoothed) raw surface.
/// Plateaus, basins, and ranking belong to the full Step 4 finder; this
/// scan only targets refinement.
fn coarse_minima_indices(state: &GridState, r: &RefineConfig) -> Vec<(usize, usize)> {
    let nx = state.xs.len();
    let ny = state.ys.len();
    let mut values: Vec<f32> = Vec::with_capacity(nx * ny);
    for iy in 0..ny {
        for ix in 0..nx {
            values.push(state.raw_at(ix, iy));
        }
    }
    let values = box_smooth(&values, nx, ny, r.minima_smoothing);

    let mut out = Vec::new();
    for iy in 1..ny.saturating_sub(1) {
        for ix in 1..nx.saturating_sub(1) {
            let v = values[iy * nx + ix];
            if v < values[iy * nx + ix - 1]
                && v < values[iy * nx + ix + 1]
                && v < values[(iy - 1) * nx + ix]
                && v < values[(iy + 1) * nx + ix]
            {
                out.push((ix, iy));
            }
        }
    }
    out
}

fn coarse_minima_locations(state: &GridState, r: &RefineConfig) -> Vec<(f32, f32)> {
    coarse_minima_indices(state, r)
        .into_iter()
        .map(|(ix, iy)| (state.xs[ix], state.ys[iy]))
        .collect()
}

fn has_new_minima(prev: &[(f32, f32)], now: &[(f32, f32)]) -> bool {
    now.iter().any(|&(x, y)| {
        !prev.iter().any(|&(px, py)| {
            log2_distance(x, px) < NEW_MINIMUM_LOG2_EPS && log2_distance(y, py) < NEW_MINIMUM_LOG2_EPS
        })
    })
}

fn box_smooth(values: &[f32], nx: usize, ny: usize, radius: usize) -> Vec<f32> {
    if radius == 0 {
        return values.to_vec();
    }
    let r = radius as isize;
    let mut out = Vec::with_capacity(values.len());
    for iy in 0..ny as isize {
        for ix in 0..nx as isize {
            let mut sum = 0.0f64;
            let mut count = 0u32;
            for dy in -r..=r {
                for dx in -r..=r {
                    let (jx, jy) = (ix + dx, iy + dy);
                    if jx >= 0 && jy >= 0 && (jx as usize) < nx && (jy as usize) < ny {
                        sum += values[jy as usize * nx + jx as usize] as f64;
                        count += 1;
                    }
                }
            }
            out.push((sum / f64::from(count)) as f32);
        }
    }
    out
}

/// Merge insert candidates into an axis, keeping every existing sample and
/// dropping candidates that would land on top of one.
fn merge_axis(axis: &[f32], inserts: &[f32]) -> Vec<f32> {
    let mut cand: Vec<f32> = inserts
        .iter()
        .copied()
        .filter(|v| v.is_finite() && *v > 0.0)
        .collect();
    cand.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let mut out: Vec<f32> = Vec::with_capacity(axis.len() + cand.len());
    let mut ai = 0usize;
    for v in cand {
        while ai < axis.len() && axis[ai] < v {
            out.push(axis[ai]);
            ai += 1;
        }
        let near_prev = out.last().is_some_and(|&p| log2_distance(p, v) < MIN_AXIS_SEPARATION);
        let near_next = ai < axis.len() && log2_distance(axis[ai], v) < MIN_AXIS_SEPARATION;
        if !near_prev && !near_next {
            out.push(v);
        }
    }
    out.extend_from_slice(&axis[ai..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timbre::{TimbreConfig, TimbreSource, RawPartial, run_timbre_step};

    fn two_partial_template() -> TimbreTemplate {
        run_timbre_step(&TimbreConfig {
            source: TimbreSource::Custom(vec![
                RawPartial { ratio: 1.0, amp: 1.0 },
                RawPartial { ratio: 2.0, amp: 0.5 },
            ]),
            merge_close_partials: false,
            ..Default::default()
        })
    }

    fn small_cfg(steps: usize) -> SamplingConfig {
        SamplingConfig {
            resolution: Resolution::Fixed {
                x_steps: steps,
                y_steps: steps,
            },
            ..Default::default()
        }
    }

    #[test]
    fn validation_rejects_bad_configs() {
        let mut cfg = SamplingConfig::default();
        cfg.x_range = (2.0, 1.0);
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidRange(_))));

        let mut cfg = SamplingConfig::default();
        cfg.resolution = Resolution::Fixed { x_steps: 1, y_steps: 64 };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidResolution(_))));

        let mut cfg = SamplingConfig::default();
        cfg.resolution = Resolution::Auto { low_steps: 33, high_steps: 129 };
        cfg.max_steps = 16;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidResolution(_))));

        let mut cfg = SamplingConfig::default();
        cfg.refine.enabled = true;
        cfg.refine.window = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidRefinement(_))));

        assert!(SamplingConfig::default().validate().is_ok());
    }

    #[test]
    fn axes_hit_endpoints_and_stay_monotonic() {
        for log in [false, true] {
            let axis = build_axis((1.0, 2.0), 17, log);
            assert_eq!(axis.len(), 17);
            assert_eq!(axis[0], 1.0);
            assert_eq!(axis[16], 2.0);
            for w in axis.windows(2) {
                assert!(w[0] < w[1]);
            }
        }
    }

    #[test]
    fn auto_resolution_respects_bounds() {
        let cfg = SamplingConfig::default();
        // Tiny pair count drives the heuristic to the high bound.
        let (sx, _) = baseline_steps(&cfg, 1, 1);
        assert_eq!(sx, 129);
        // Huge pair count drives it to the low bound.
        let (sx, sy) = baseline_steps(&cfg, 60, 60);
        assert_eq!((sx, sy), (33, 33));
        // max_steps caps everything.
        let capped = SamplingConfig {
            max_steps: 40,
            resolution: Resolution::Auto { low_steps: 33, high_steps: 129 },
            ..Default::default()
        };
        let (sx, _) = baseline_steps(&capped, 1, 1);
        assert_eq!(sx, 40);
    }

    #[test]
    fn grid_shape_and_logs() {
        let t = two_partial_template();
        let cache = PairIndexCache::new();
        let g = run_grid_step(
            &t,
            &t,
            &RoughnessConstants::default(),
            &RoughnessOptions::default(),
            &small_cfg(9),
            &cache,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(g.nx(), 9);
        assert_eq!(g.ny(), 9);
        assert_eq!(g.raw.len(), 81);
        assert_eq!(g.normalized.len(), 81);
        assert_eq!(g.log_x.len(), 9);
        for w in g.log_x.windows(2) {
            assert!(w[0] < w[1]);
        }
        assert!((g.log_x[0] - 0.0).abs() < 1e-7);
        assert_eq!(g.summary.points, 81);
    }

    #[test]
    fn fold_octave_clamps_y_domain() {
        let t = two_partial_template();
        let cache = PairIndexCache::new();
        let cfg = SamplingConfig {
            y_range: (1.0, 4.0),
            fold_octave: true,
            ..small_cfg(5)
        };
        let g = run_grid_step(
            &t,
            &t,
            &RoughnessConstants::default(),
            &RoughnessOptions::default(),
            &cfg,
            &cache,
            &CancelToken::new(),
        )
        .unwrap();
        assert!((g.ys[g.ny() - 1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn cell_metrics_follow_log_sampling() {
        let t = two_partial_template();
        let cache = PairIndexCache::new();
        let logged = run_grid_step(
            &t,
            &t,
            &RoughnessConstants::default(),
            &RoughnessOptions::default(),
            &small_cfg(9),
            &cache,
            &CancelToken::new(),
        )
        .unwrap();
        let widths = logged.cell_width.as_ref().unwrap();
        assert_eq!(widths.len(), 9);
        let span: f32 = widths.iter().sum();
        assert!((span - 1.0).abs() < 1e-4, "widths should tile 1.0..2.0, got {span}");
        // Log spacing widens cells toward the high end.
        assert!(widths[7] > widths[1]);
        assert_eq!(logged.cell_area.as_ref().unwrap().len(), 81);

        let linear = run_grid_step(
            &t,
            &t,
            &RoughnessConstants::default(),
            &RoughnessOptions::default(),
            &SamplingConfig {
                log_sampling: false,
                ..small_cfg(9)
            },
            &cache,
            &CancelToken::new(),
        )
        .unwrap();
        assert!(linear.cell_width.is_none());
        assert!(linear.area_at(4, 4) > 0.0);
    }

    #[test]
    fn normalization_modes() {
        let t = two_partial_template();
        let cache = PairIndexCache::new();
        let base = small_cfg(7);

        let maxed = run_grid_step(
            &t, &t,
            &RoughnessConstants::default(),
            &RoughnessOptions::default(),
            &base,
            &cache,
            &CancelToken::new(),
        )
        .unwrap();
        assert!((maxed.max_norm - 1.0).abs() < 1e-6);

        let none = run_grid_step(
            &t, &t,
            &RoughnessConstants::default(),
            &RoughnessOptions::default(),
            &SamplingConfig { normalization: NormalizationMode::None, ..base.clone() },
            &cache,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(none.raw, none.normalized);

        let referenced = run_grid_step(
            &t, &t,
            &RoughnessConstants::default(),
            &RoughnessOptions::default(),
            &SamplingConfig {
                normalization: NormalizationMode::Reference(2.0 * maxed.max_raw),
                ..base.clone()
            },
            &cache,
            &CancelToken::new(),
        )
        .unwrap();
        assert!((referenced.max_norm - 0.5).abs() < 1e-6);

        // A zero reference degrades to a plain copy instead of dividing.
        let degenerate = run_grid_step(
            &t, &t,
            &RoughnessConstants::default(),
            &RoughnessOptions::default(),
            &SamplingConfig { normalization: NormalizationMode::Reference(0.0), ..base },
            &cache,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(degenerate.raw, degenerate.normalized);
    }

    #[test]
    fn identical_configs_are_deterministic() {
        let t = two_partial_template();
        let cache = PairIndexCache::new();
        let cfg = small_cfg(11);
        let run = |cache: &PairIndexCache| {
            run_grid_step(
                &t, &t,
                &RoughnessConstants::default(),
                &RoughnessOptions::default(),
                &cfg,
                cache,
                &CancelToken::new(),
            )
            .unwrap()
        };
        let a = run(&cache);
        let b = run(&cache);
        assert_eq!(a.raw, b.raw);
        assert_eq!(a.normalized, b.normalized);
    }

    #[test]
    fn refinement_inserts_and_keeps_samples() {
        let t = two_partial_template();
        let cache = PairIndexCache::new();
        let mut cfg = small_cfg(13);
        cfg.refine.enabled = true;
        cfg.refine.base_steps = 2;
        cfg.refine.gradient_threshold = 1e-4;
        let coarse = run_grid_step(
            &t, &t,
            &RoughnessConstants::default(),
            &RoughnessOptions::default(),
            &small_cfg(13),
            &cache,
            &CancelToken::new(),
        )
        .unwrap();
        let refined = run_grid_step(
            &t, &t,
            &RoughnessConstants::default(),
            &RoughnessOptions::default(),
            &cfg,
            &cache,
            &CancelToken::new(),
        )
        .unwrap();
        assert!(refined.nx() > coarse.nx() || refined.ny() > coarse.ny());
        assert!(refined.nx() <= cfg.max_steps);
        assert!(refined.summary.refine_passes_run >= 1);
        assert!(refined.summary.samples_inserted > 0);
        for x in &coarse.xs {
            assert!(refined.xs.iter().any(|r| r == x), "coarse sample {x} lost");
        }
        for w in refined.xs.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn cancelled_run_returns_baseline() {
        let t = two_partial_template();
        let cache = PairIndexCache::new();
        let mut cfg = small_cfg(9);
        cfg.refine.enabled = true;
        cfg.refine.base_steps = 4;
        cfg.refine.gradient_threshold = 1e-4;
        let token = CancelToken::new();
        token.cancel();
        let g = run_grid_step(
            &t, &t,
            &RoughnessConstants::default(),
            &RoughnessOptions::default(),
            &cfg,
            &cache,
            &CancelToken::new(),
        )
        .unwrap();
        let cancelled = run_grid_step(
            &t, &t,
            &RoughnessConstants::default(),
            &RoughnessOptions::default(),
            &cfg,
            &cache,
            &token,
        )
        .unwrap();
        assert!(cancelled.summary.cancelled);
        assert_eq!(cancelled.summary.refine_passes_run, 0);
        assert_eq!(cancelled.nx(), 9);
        // The uncancelled run got further.
        assert!(g.nx() >= cancelled.nx());
    }

    #[test]
    fn empty_template_grid_is_all_silent() {
        let empty = TimbreTemplate::default();
        let cache = PairIndexCache::new();
        let g = run_grid_step(
            &empty,
            &empty,
            &RoughnessConstants::default(),
            &RoughnessOptions::default(),
            &small_cfg(5),
            &cache,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(g.summary.silent_points, g.summary.points);
        assert!(g.raw.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn axis_value_scales() {
        let t = two_partial_template();
        let cache = PairIndexCache::new();
        let g = run_grid_step(
            &t, &t,
            &RoughnessConstants::default(),
            &RoughnessOptions::default(),
            &small_cfg(5),
            &cache,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(g.axis_values(GridAxis::X, AxisScale::Ratio), g.xs);
        assert_eq!(g.axis_values(GridAxis::Y, AxisScale::NaturalLog), g.log_y);
        let cents = g.axis_values(GridAxis::X, AxisScale::Cents);
        assert!((cents[0] - 0.0).abs() < 1e-3);
        assert!((cents[4] - 1200.0).abs() < 1e-2);
    }

    #[test]
    fn merge_axis_dedups_near_hits() {
        let axis = vec![1.0, 1.5, 2.0];
        let merged = merge_axis(&axis, &[1.25, 1.5, 1.500_000_01, 0.0, f32::NAN]);
        assert_eq!(merged, vec![1.0, 1.25, 1.5, 2.0]);
    }
}
