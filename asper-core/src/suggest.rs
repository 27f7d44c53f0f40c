//! Step 5: Suggestions and scale candidates
//!
//! Turn the analysis products into actionable output:
//! - timbre suggestions: read the top pair contributions of a point, split
//!   them into cross-tone and intra-tone clashes, and phrase at most one
//!   concrete remediation per category around its worst pair;
//! - scale candidates: collect minima coordinates into a sorted, deduplicated
//!   ratio list inside the [1, 2) octave window, always anchored on the
//!   root ratio.

use crate::common::log2_distance;
use crate::minima::MinimaPoint;
use crate::roughness::{PairContribution, TONE_ROOT, TONE_X, TONE_Y};

/// Ratios closer than this (log2 octaves) collapse in the scale list.
const SCALE_DEDUP_LOG2: f32 = 1e-4;

/// A titled block of detail lines for display. Purely derived, recomputed
/// on demand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Suggestion {
    pub title: String,
    pub details: Vec<String>,
}

/// Human-readable tone set for a partial's bitmask.
fn tone_names(mask: u8) -> String {
    let mut parts: Vec<&str> = Vec::new();
    if mask & TONE_ROOT != 0 {
        parts.push("root");
    }
    if mask & TONE_X != 0 {
        parts.push("x-interval");
    }
    if mask & TONE_Y != 0 {
        parts.push("y-interval");
    }
    if parts.is_empty() {
        "unknown".to_string()
    } else {
        parts.join("+")
    }
}

fn is_cross_tone(pair: &PairContribution) -> bool {
    pair.tone_a != pair.tone_b
}

/// At most one suggestion per clash category, built around the most
/// impactful pair of that category. Empty input yields no suggestions.
pub fn build_timbre_suggestions(
    top_pairs: &[PairContribution],
    base_freq_hz: f32,
) -> Vec<Suggestion> {
    if top_pairs.is_empty() {
        return Vec::new();
    }
    let base = if base_freq_hz > 0.0 { base_freq_hz } else { 1.0 };

    let mut out = Vec::new();
    let cross = top_pairs
        .iter()
        .filter(|p| is_cross_tone(p))
        .max_by(|a, b| a.value.partial_cmp(&b.value).unwrap());
    if let Some(p) = cross {
        out.push(Suggestion {
            title: "Reduce cross-tone beating".to_string(),
            details: vec![
                format!(
                    "Partial {} (ratio {:.3}, {}) against partial {} (ratio {:.3}, {}) contributes {:.4} roughness.",
                    p.index_a,
                    p.freq_a / base,
                    tone_names(p.tone_a),
                    p.index_b,
                    p.freq_b / base,
                    tone_names(p.tone_b),
                    p.value
                ),
                "Trim one of the two partials, or rebalance their amplitudes so neither side dominates the clash.".to_string(),
            ],
        });
    }

    let intra = top_pairs
        .iter()
        .filter(|p| !is_cross_tone(p))
        .max_by(|a, b| a.value.partial_cmp(&b.value).unwrap());
    if let Some(p) = intra {
        out.push(Suggestion {
            title: "Tame intra-tone roughness".to_string(),
            details: vec![
                format!(
                    "Partials {} (ratio {:.3}) and {} (ratio {:.3}) inside {} beat against each other, contributing {:.4}.",
                    p.index_a,
                    p.freq_a / base,
                    p.index_b,
                    p.freq_b / base,
                    tone_names(p.tone_a),
                    p.value
                ),
                "Trim the upper partial, or increase its amplitude decay so the pair fades faster.".to_string(),
            ],
        });
    }
    out
}

/// Candidate scale ratios from the minima coordinates: both axes collected,
/// restricted to the [1, 2) octave window, sorted, deduplicated, anchored on
/// `root_ratio`, and truncated to `max(2, max_count)` entries. When fewer
/// than two ratios survive, the octave above the root completes the scale.
pub fn build_scale_from_minima(
    minima: &[MinimaPoint],
    root_ratio: f32,
    max_count: usize,
) -> Vec<f32> {
    let mut ratios: Vec<f32> = minima
        .iter()
        .flat_map(|m| [m.x, m.y])
        .filter(|r| r.is_finite() && *r >= 1.0 && *r < 2.0)
        .collect();
    ratios.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let mut out: Vec<f32> = Vec::with_capacity(ratios.len() + 1);
    for r in ratios {
        if out.last().is_none_or(|&p| log2_distance(p, r) >= SCALE_DEDUP_LOG2) {
            out.push(r);
        }
    }

    let has_root = out
        .iter()
        .any(|&r| log2_distance(r, root_ratio) < SCALE_DEDUP_LOG2);
    if !has_root {
        out.insert(0, root_ratio);
    }
    out.truncate(max_count.max(2));
    if out.len() < 2 {
        out.push(2.0 * root_ratio);
    }
    out
}

/// Common-practice name for a small just ratio, if it has one.
pub fn interval_name(num: u32, den: u32) -> Option<&'static str> {
    const NAMES: &[(u32, u32, &str)] = &[
        (1, 1, "unison"),
        (16, 15, "diatonic semitone"),
        (9, 8, "major second"),
        (6, 5, "minor third"),
        (5, 4, "major third"),
        (4, 3, "perfect fourth"),
        (7, 5, "septimal tritone"),
        (3, 2, "perfect fifth"),
        (8, 5, "minor sixth"),
        (5, 3, "major sixth"),
        (7, 4, "harmonic seventh"),
        (16, 9, "minor seventh"),
        (15, 8, "major seventh"),
        (2, 1, "octave"),
    ];
    NAMES
        .iter()
        .find(|(n, d, _)| *n == num && *d == den)
        .map(|(_, _, name)| *name)
}
