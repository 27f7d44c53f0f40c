//! Step 2: Pairwise roughness at one grid point
//!
//! Combine the tone-tagged partials present at a grid point and accumulate
//! the Sethares/Plomp–Levelt pair kernel over every unordered pair:
//!
//! ```text
//! f1 = min(fa, fb),  d = |fb - fa|
//! s  = d_star / (s1*f1 + s2)
//! R(a, b) = (amp_a * amp_b) * (exp(-a*s*d) - exp(-b*s*d))
//! ```
//!
//! with a=3.5, b=5.75, d_star=0.24, s1=0.021, s2=19 by default, which places
//! the roughness maximum near one quarter of the critical bandwidth. See:
//! - Sethares, "Local consonance and the relationship between timbre and scale" (1993/1998).
//! - Plomp & Levelt, "Tonal Consonance and Critical Bandwidth" (1965).
//!
//! Partials are filtered first (non-finite -> invalid, amplitude below the
//! threshold -> pruned), pair order comes from the shared `PairIndexCache`,
//! and the result carries per-point diagnostics plus the top contributing
//! pairs for the suggestion stage. Same-tone pairs are counted toward the
//! pair total whether or not self-interaction is enabled; when disabled they
//! are recorded as skipped.

use serde::{Deserialize, Serialize};

use crate::pairs::PairIndexCache;
use crate::timbre::TimbreTemplate;

/// Tone bit for the untransposed root.
pub const TONE_ROOT: u8 = 1;
/// Tone bit for the x-axis interval.
pub const TONE_X: u8 = 2;
/// Tone bit for the y-axis interval.
pub const TONE_Y: u8 = 4;

/// Aggregates below this are considered silence.
const SILENT_EPS: f64 = 1e-9;

/// One partial realized at an absolute frequency for a single grid point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TonePartial {
    pub freq_hz: f32,
    pub amp: f32,
    /// Index of the originating template partial.
    pub index: usize,
    /// Bitmask of the tone this partial belongs to.
    pub tone: u8,
}

/// Kernel constants. Fixed per engine pass; never mutated during computation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoughnessConstants {
    pub a: f32,      // e.g., 3.5
    pub b: f32,      // e.g., 5.75
    pub d_star: f32, // e.g., 0.24
    pub s1: f32,     // e.g., 0.021
    pub s2: f32,     // e.g., 19.0
    /// Floor for the exponent arguments; `None` leaves them unclamped.
    pub exp_clamp_min: Option<f32>,
}

impl Default for RoughnessConstants {
    fn default() -> Self {
        Self {
            a: 3.5,
            b: 5.75,
            d_star: 0.24,
            s1: 0.021,
            s2: 19.0,
            exp_clamp_min: None,
        }
    }
}

/// Tuning knobs for the point evaluation. Immutable per grid computation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoughnessOptions {
    /// Partials below this amplitude are pruned before pairing.
    pub amp_threshold: f32, // e.g., 0.0
    /// Contributions whose magnitude is at or below this floor are
    /// negligible: counted toward the pair total, never accumulated.
    pub epsilon_contribution: f32,
    /// Pairs whose amplitude product falls below this are skipped outright.
    pub pair_skip_epsilon: f32, // e.g., 1e-9
    /// Same-tone pairs participate when true, scaled by
    /// `self_interaction_weight`.
    pub enable_self_interaction: bool,
    pub self_interaction_weight: f32, // e.g., 1.0
    /// Combine same-tone partials at identical frequencies before pairing;
    /// removed duplicates count as pruned.
    pub merge_duplicates: bool,
    /// Retain this many largest pair contributions (0 disables retention).
    pub top_pairs: usize, // e.g., 8
    /// Keep per-point diagnostic arrays on the grid.
    pub collect_diagnostics: bool,
    /// Skip debug-only finiteness self-checks.
    pub performance_mode: bool,
}

impl Default for RoughnessOptions {
    fn default() -> Self {
        Self {
            amp_threshold: 0.0,
            epsilon_contribution: 0.0,
            pair_skip_epsilon: 1e-9,
            enable_self_interaction: false,
            self_interaction_weight: 1.0,
            merge_duplicates: false,
            top_pairs: 8,
            collect_diagnostics: true,
            performance_mode: false,
        }
    }
}

/// One retained pair contribution, for the suggestion stage.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PairContribution {
    pub freq_a: f32,
    pub freq_b: f32,
    pub index_a: usize,
    pub index_b: usize,
    pub tone_a: u8,
    pub tone_b: u8,
    pub value: f32,
}

/// Per-point diagnostics. Skip counts never exceed the pair total.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PointDiagnostics {
    pub original_partials: u32,
    pub invalid_partials: u32,
    pub pruned_partials: u32,
    pub total_pairs: u32,
    pub skipped_pairs: u32,
    /// Largest single accumulated contribution.
    pub max_pair: f32,
    /// Aggregate below the silence floor.
    pub silent: bool,
}

/// Result of evaluating one grid point.
#[derive(Clone, Debug, Default)]
pub struct PointRoughness {
    pub total: f32,
    /// Largest contributions, descending; at most `top_pairs` entries.
    pub top_pairs: Vec<PairContribution>,
    pub diag: PointDiagnostics,
}

/// Raw pair kernel. Symmetric in its operands by construction: only the
/// lower frequency and the absolute difference enter the formula.
#[inline]
pub fn pair_roughness(c: &RoughnessConstants, fa: f32, fb: f32) -> f32 {
    let f1 = fa.min(fb);
    let d = (fb - fa).abs();
    let s = c.d_star / (c.s1 * f1 + c.s2);
    let mut xa = -(c.a * s * d);
    let mut xb = -(c.b * s * d);
    if let Some(floor) = c.exp_clamp_min {
        xa = xa.max(floor);
        xb = xb.max(floor);
    }
    xa.exp() - xb.exp()
}

/// Realize a template at `base_hz * multiplier`, appending tone-tagged
/// partials to `out`.
pub fn realize_template(
    template: &TimbreTemplate,
    base_hz: f32,
    multiplier: f32,
    tone: u8,
    out: &mut Vec<TonePartial>,
) {
    for p in &template.partials {
        out.push(TonePartial {
            freq_hz: base_hz * p.ratio * multiplier,
            amp: p.amp,
            index: p.index,
            tone,
        });
    }
}

/// Main entry point for Step 2: aggregate roughness of one combined set.
pub fn evaluate_point(
    partials: &[TonePartial],
    consts: &RoughnessConstants,
    opts: &RoughnessOptions,
    cache: &PairIndexCache,
) -> PointRoughness {
    let mut diag = PointDiagnostics {
        original_partials: partials.len() as u32,
        ..Default::default()
    };

    // 1) Filter partials: non-finite -> invalid, below threshold -> pruned.
    let mut active: Vec<TonePartial> = Vec::with_capacity(partials.len());
    for p in partials {
        if !p.freq_hz.is_finite() || !p.amp.is_finite() {
            diag.invalid_partials += 1;
        } else if p.amp < opts.amp_threshold {
            diag.pruned_partials += 1;
        } else {
            active.push(*p);
        }
    }
    if opts.merge_duplicates && active.len() > 1 {
        active = merge_duplicate_partials(active, &mut diag);
    }

    // 2) Pair sweep in the cache's fixed lexicographic order.
    let table = cache.get(active.len());
    diag.total_pairs = table.len() as u32;

    let mut total = 0.0f64;
    let mut top: Vec<PairContribution> = Vec::new();
    for k in 0..table.len() {
        let pa = active[table.i[k] as usize];
        let pb = active[table.j[k] as usize];

        let same_tone = pa.tone == pb.tone;
        if same_tone && !opts.enable_self_interaction {
            diag.skipped_pairs += 1;
            continue;
        }
        let amp_product = pa.amp * pb.amp;
        if amp_product.abs() < opts.pair_skip_epsilon {
            diag.skipped_pairs += 1;
            continue;
        }

        let mut value = amp_product * pair_roughness(consts, pa.freq_hz, pb.freq_hz);
        if same_tone {
            value *= opts.self_interaction_weight;
        }
        if !opts.performance_mode {
            debug_assert!(value.is_finite(), "pair contribution must stay finite");
        }
        if value.abs() <= opts.epsilon_contribution {
            // Negligible: stays in total_pairs, never in skipped_pairs.
            continue;
        }

        total += value as f64;
        if value > diag.max_pair {
            diag.max_pair = value;
        }
        if opts.top_pairs > 0 {
            push_top(
                &mut top,
                opts.top_pairs,
                PairContribution {
                    freq_a: pa.freq_hz,
                    freq_b: pb.freq_hz,
                    index_a: pa.index,
                    index_b: pb.index,
                    tone_a: pa.tone,
                    tone_b: pb.tone,
                    value,
                },
            );
        }
    }

    diag.silent = total.abs() < SILENT_EPS;
    PointRoughness {
        total: total as f32,
        top_pairs: top,
        diag,
    }
}

/// Insert into a descending-by-value list capped at `cap` entries.
fn push_top(top: &mut Vec<PairContribution>, cap: usize, c: PairContribution) {
    if top.len() == cap
        && let Some(last) = top.last()
        && c.value <= last.value
    {
        return;
    }
    let at = top.partition_point(|t| t.value >= c.value);
    top.insert(at, c);
    top.truncate(cap);
}

fn merge_duplicate_partials(
    mut parts: Vec<TonePartial>,
    diag: &mut PointDiagnostics,
) -> Vec<TonePartial> {
    parts.sort_by(|a, b| {
        a.tone
            .cmp(&b.tone)
            .then(a.freq_hz.partial_cmp(&b.freq_hz).unwrap())
    });
    let mut out: Vec<TonePartial> = Vec::with_capacity(parts.len());
    for p in parts {
        if let Some(last) = out.last_mut()
            && last.tone == p.tone
            && last.freq_hz == p.freq_hz
        {
            last.amp += p.amp;
            diag.pruned_partials += 1;
        } else {
            out.push(p);
        }
    }
    out
}
