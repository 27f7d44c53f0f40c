//! Step 1: Timbre template
//!
//! Turn a raw timbre description (a waveform preset or a custom partial
//! list) into the canonical template consumed by the roughness stages:
//!
//! - merge partials closer than a tolerance (ratio, cents, or Hz),
//! - settle the base partial per the configured strategy,
//! - normalize and/or compress amplitudes in the configured order,
//! - clamp negatives, cap the count, re-index ascending by ratio.
//!
//! Exactly one canonical template is derivable per config. A config that
//! yields zero partials produces an empty template; downstream stages treat
//! that as silence, never as an error.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::common::cents_diff;

/// Where source partials come from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimbreSource {
    /// Closed-form waveform model, generated up to `max_partials`.
    Preset(WaveformPreset),
    /// Caller-supplied partial list, any order.
    Custom(Vec<RawPartial>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WaveformPreset {
    /// Every harmonic k at amplitude 1/k.
    Sawtooth,
    /// Odd harmonics at amplitude 1/k.
    Square,
    /// Odd harmonics at amplitude 1/k^2.
    Triangle,
}

/// One source partial before processing.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawPartial {
    /// Frequency as a ratio to the base (1.0 = fundamental).
    pub ratio: f32,
    pub amp: f32,
}

/// Unit in which the merge tolerance is measured.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeUnit {
    /// Plain ratio difference.
    Ratio,
    /// 1200 * log2(r2/r1).
    Cents,
    /// Ratio difference scaled by `base_freq_hz`.
    Hz,
}

/// Amplitude rule when two close partials merge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeRule {
    /// Amplitudes add (two coincident partials beat as one louder one).
    Sum,
    /// The louder amplitude wins.
    Max,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AmplitudeNormalization {
    None,
    /// Divide by the maximum amplitude.
    Max,
    /// Divide by sqrt(sum of squares).
    Energy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AmplitudeCompression {
    None,
    Sqrt,
    /// ln(1 + amount*x) / ln(1 + amount).
    Log,
}

/// Order of the two amplitude transforms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AmplitudePipeline {
    CompressThenNormalize,
    NormalizeThenCompress,
}

/// How to guarantee a usable base partial.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BaseStrategy {
    /// Transpose the whole template so the loudest partial lands at ratio 1.
    Max,
    /// Insert amplitude 1.0 at ratio 1 when nothing sits near the unison.
    One,
    /// Treat the first (lowest) partial as the base; change nothing.
    First,
}

/// Configuration for Step 1.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimbreConfig {
    pub source: TimbreSource,
    /// Absolute frequency of ratio 1.0 (Hz). Used by the Hz merge unit and
    /// by callers realizing the template at grid points.
    pub base_freq_hz: f32, // e.g., 261.63
    /// Merge partials whose separation falls below `merge_tolerance`.
    pub merge_close_partials: bool,
    /// Tolerance in `merge_unit` units. Also the unison proximity test for
    /// the `one` base strategy.
    pub merge_tolerance: f32, // e.g., 6.0 cents
    pub merge_unit: MergeUnit,
    /// Amplitude rule for merged partials; the merged ratio is always the
    /// amplitude-weighted mean of the two.
    pub merge_rule: MergeRule,
    /// Keep at most this many partials (strongest win). 0 yields an empty
    /// template.
    pub max_partials: usize, // e.g., 16
    pub normalization: AmplitudeNormalization,
    pub compression: AmplitudeCompression,
    /// Shaping amount for `log` compression; ignored otherwise.
    pub compression_amount: f32, // e.g., 4.0
    pub pipeline: AmplitudePipeline,
    pub base_strategy: BaseStrategy,
    /// Floor negative amplitudes to zero after the pipeline.
    pub clamp_negative_amps: bool,
}

impl Default for TimbreConfig {
    fn default() -> Self {
        Self {
            source: TimbreSource::Preset(WaveformPreset::Sawtooth),
            base_freq_hz: 261.63,
            merge_close_partials: true,
            merge_tolerance: 6.0,
            merge_unit: MergeUnit::Cents,
            merge_rule: MergeRule::Sum,
            max_partials: 16,
            normalization: AmplitudeNormalization::Max,
            compression: AmplitudeCompression::None,
            compression_amount: 4.0,
            pipeline: AmplitudePipeline::NormalizeThenCompress,
            base_strategy: BaseStrategy::First,
            clamp_negative_amps: true,
        }
    }
}

/// One partial of the canonical template.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TemplatePartial {
    pub ratio: f32,
    pub amp: f32,
    /// Position in the final ascending-ratio order.
    pub index: usize,
}

/// Canonical template plus processing counters.
#[derive(Clone, Debug, Default)]
pub struct TimbreTemplate {
    /// Sorted ascending by ratio, indices 0..len.
    pub partials: Vec<TemplatePartial>,
    /// Source partials merged away by the tolerance pass.
    pub merged: usize,
    /// Partials dropped by the `max_partials` cap.
    pub dropped: usize,
}

impl TimbreTemplate {
    pub fn len(&self) -> usize {
        self.partials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partials.is_empty()
    }
}

/// Main entry point for Step 1.
pub fn run_timbre_step(cfg: &TimbreConfig) -> TimbreTemplate {
    // 1) Source partials.
    let mut parts: Vec<RawPartial> = match &cfg.source {
        TimbreSource::Preset(p) => preset_partials(*p, cfg.max_partials),
        TimbreSource::Custom(list) => list.clone(),
    };

    // Non-finite or non-positive ratios cannot be placed on a log axis;
    // discard them here rather than poisoning every later stage.
    let before = parts.len();
    parts.retain(|p| p.ratio.is_finite() && p.ratio > 0.0 && p.amp.is_finite());
    if parts.len() < before {
        warn!(
            removed = before - parts.len(),
            "discarding non-finite or non-positive source partials"
        );
    }
    parts.sort_by(|a, b| a.ratio.partial_cmp(&b.ratio).unwrap());

    // 2) Merge close partials.
    let mut merged = 0usize;
    if cfg.merge_close_partials && parts.len() > 1 {
        parts = merge_close(parts, cfg, &mut merged);
    }

    // 3) Base partial strategy.
    apply_base_strategy(&mut parts, cfg);

    // 4) Amplitude pipeline in the configured order.
    match cfg.pipeline {
        AmplitudePipeline::CompressThenNormalize => {
            compress_amps(&mut parts, cfg.compression, cfg.compression_amount);
            normalize_amps(&mut parts, cfg.normalization);
        }
        AmplitudePipeline::NormalizeThenCompress => {
            normalize_amps(&mut parts, cfg.normalization);
            compress_amps(&mut parts, cfg.compression, cfg.compression_amount);
        }
    }

    // 5) Clamp negatives.
    if cfg.clamp_negative_amps {
        for p in &mut parts {
            if p.amp < 0.0 {
                p.amp = 0.0;
            }
        }
    }

    // 6) Cap at max_partials, keeping the strongest.
    let mut dropped = 0usize;
    if parts.len() > cfg.max_partials {
        dropped = parts.len() - cfg.max_partials;
        parts.sort_by(|a, b| b.amp.partial_cmp(&a.amp).unwrap());
        parts.truncate(cfg.max_partials);
        parts.sort_by(|a, b| a.ratio.partial_cmp(&b.ratio).unwrap());
    }

    // 7) Re-index in ascending-ratio order.
    let partials = parts
        .iter()
        .enumerate()
        .map(|(k, p)| TemplatePartial {
            ratio: p.ratio,
            amp: p.amp,
            index: k,
        })
        .collect();

    TimbreTemplate {
        partials,
        merged,
        dropped,
    }
}

fn preset_partials(preset: WaveformPreset, count: usize) -> Vec<RawPartial> {
    let mut out = Vec::with_capacity(count);
    match preset {
        WaveformPreset::Sawtooth => {
            for k in 1..=count {
                out.push(RawPartial {
                    ratio: k as f32,
                    amp: 1.0 / k as f32,
                });
            }
        }
        WaveformPreset::Square => {
            let mut k = 1usize;
            while out.len() < count {
                out.push(RawPartial {
                    ratio: k as f32,
                    amp: 1.0 / k as f32,
                });
                k += 2;
            }
        }
        WaveformPreset::Triangle => {
            let mut k = 1usize;
            while out.len() < count {
                out.push(RawPartial {
                    ratio: k as f32,
                    amp: 1.0 / (k * k) as f32,
                });
                k += 2;
            }
        }
    }
    out
}

/// Separation of two ratios in the configured merge unit.
fn separation(r1: f32, r2: f32, cfg: &TimbreConfig) -> f32 {
    match cfg.merge_unit {
        MergeUnit::Ratio => (r2 - r1).abs(),
        MergeUnit::Cents => cents_diff(r1, r2).abs(),
        MergeUnit::Hz => ((r2 - r1) * cfg.base_freq_hz).abs(),
    }
}

fn merge_close(parts: Vec<RawPartial>, cfg: &TimbreConfig, merged: &mut usize) -> Vec<RawPartial> {
    let mut out: Vec<RawPartial> = Vec::with_capacity(parts.len());
    for p in parts {
        if let Some(last) = out.last_mut()
            && separation(last.ratio, p.ratio, cfg) < cfg.merge_tolerance
        {
            // Amplitude-weighted mean keeps the heavier partial's placement.
            let wsum = last.amp + p.amp;
            last.ratio = if wsum > 1e-12 {
                (last.ratio * last.amp + p.ratio * p.amp) / wsum
            } else {
                0.5 * (last.ratio + p.ratio)
            };
            last.amp = match cfg.merge_rule {
                MergeRule::Sum => last.amp + p.amp,
                MergeRule::Max => last.amp.max(p.amp),
            };
            *merged += 1;
        } else {
            out.push(p);
        }
    }
    out
}

fn apply_base_strategy(parts: &mut Vec<RawPartial>, cfg: &TimbreConfig) {
    match cfg.base_strategy {
        BaseStrategy::First => {}
        BaseStrategy::Max => {
            let anchor = parts
                .iter()
                .max_by(|a, b| a.amp.partial_cmp(&b.amp).unwrap())
                .map(|p| p.ratio);
            if let Some(r) = anchor
                && r != 1.0
            {
                // Divisor is positive, so ascending order survives.
                for p in parts.iter_mut() {
                    p.ratio /= r;
                }
            }
        }
        BaseStrategy::One => {
            let has_unit = parts
                .iter()
                .any(|p| separation(1.0, p.ratio, cfg) < cfg.merge_tolerance);
            if !has_unit {
                let at = parts.partition_point(|p| p.ratio < 1.0);
                parts.insert(
                    at,
                    RawPartial {
                        ratio: 1.0,
                        amp: 1.0,
                    },
                );
            }
        }
    }
}

fn normalize_amps(parts: &mut [RawPartial], mode: AmplitudeNormalization) {
    let denom = match mode {
        AmplitudeNormalization::None => return,
        AmplitudeNormalization::Max => parts.iter().map(|p| p.amp).fold(0.0f32, f32::max),
        AmplitudeNormalization::Energy => parts
            .iter()
            .map(|p| (p.amp as f64) * (p.amp as f64))
            .sum::<f64>()
            .sqrt() as f32,
    };
    if denom > 1e-12 {
        for p in parts {
            p.amp /= denom;
        }
    }
}

fn compress_amps(parts: &mut [RawPartial], mode: AmplitudeCompression, amount: f32) {
    match mode {
        AmplitudeCompression::None => {}
        AmplitudeCompression::Sqrt => {
            // Shape the magnitude; the sign survives for the clamp step.
            for p in parts {
                p.amp = p.amp.signum() * p.amp.abs().sqrt();
            }
        }
        AmplitudeCompression::Log => {
            if amount <= 0.0 {
                warn!(amount, "log compression amount must be positive; skipping");
                return;
            }
            let denom = (1.0 + amount).ln();
            for p in parts {
                p.amp = p.amp.signum() * (1.0 + amount * p.amp.abs()).ln() / denom;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn custom(parts: &[(f32, f32)]) -> TimbreSource {
        TimbreSource::Custom(
            parts
                .iter()
                .map(|&(ratio, amp)| RawPartial { ratio, amp })
                .collect(),
        )
    }

    #[test]
    fn sawtooth_preset_shape() {
        let cfg = TimbreConfig {
            max_partials: 6,
            normalization: AmplitudeNormalization::None,
            ..Default::default()
        };
        let t = run_timbre_step(&cfg);
        assert_eq!(t.len(), 6);
        for (k, p) in t.partials.iter().enumerate() {
            assert_eq!(p.index, k);
            assert_eq!(p.ratio, (k + 1) as f32);
            assert!((p.amp - 1.0 / (k + 1) as f32).abs() < 1e-6);
        }
    }

    #[test]
    fn square_preset_skips_even_harmonics() {
        let cfg = TimbreConfig {
            source: TimbreSource::Preset(WaveformPreset::Square),
            max_partials: 4,
            normalization: AmplitudeNormalization::None,
            ..Default::default()
        };
        let t = run_timbre_step(&cfg);
        let ratios: Vec<f32> = t.partials.iter().map(|p| p.ratio).collect();
        assert_eq!(ratios, vec![1.0, 3.0, 5.0, 7.0]);
    }

    #[test]
    fn merge_sum_rule_and_weighted_mean() {
        let cfg = TimbreConfig {
            source: custom(&[(1.0, 1.0), (1.001, 3.0), (1.5, 0.5)]),
            merge_tolerance: 5.0,
            merge_unit: MergeUnit::Cents,
            normalization: AmplitudeNormalization::None,
            ..Default::default()
        };
        let t = run_timbre_step(&cfg);
        assert_eq!(t.len(), 2);
        assert_eq!(t.merged, 1);
        let m = t.partials[0];
        assert!((m.amp - 4.0).abs() < 1e-6);
        // Weighted mean sits closer to the louder partial.
        let expected = (1.0 * 1.0 + 1.001 * 3.0) / 4.0;
        assert!((m.ratio - expected).abs() < 1e-6);
    }

    #[test]
    fn merge_max_rule_keeps_louder_amp() {
        let cfg = TimbreConfig {
            source: custom(&[(2.0, 0.25), (2.001, 0.6)]),
            merge_rule: MergeRule::Max,
            merge_tolerance: 5.0,
            normalization: AmplitudeNormalization::None,
            ..Default::default()
        };
        let t = run_timbre_step(&cfg);
        assert_eq!(t.len(), 1);
        assert!((t.partials[0].amp - 0.6).abs() < 1e-6);
    }

    #[test]
    fn base_max_transposes_loudest_to_unison() {
        let cfg = TimbreConfig {
            source: custom(&[(1.0, 0.2), (2.0, 0.9), (3.0, 0.1)]),
            base_strategy: BaseStrategy::Max,
            merge_close_partials: false,
            normalization: AmplitudeNormalization::None,
            ..Default::default()
        };
        let t = run_timbre_step(&cfg);
        let ratios: Vec<f32> = t.partials.iter().map(|p| p.ratio).collect();
        assert_eq!(ratios, vec![0.5, 1.0, 1.5]);
    }

    #[test]
    fn base_one_inserts_unit_when_missing() {
        let cfg = TimbreConfig {
            source: custom(&[(1.5, 0.5), (2.0, 0.5)]),
            base_strategy: BaseStrategy::One,
            normalization: AmplitudeNormalization::None,
            ..Default::default()
        };
        let t = run_timbre_step(&cfg);
        assert_eq!(t.partials[0].ratio, 1.0);
        assert_eq!(t.partials[0].amp, 1.0);
        assert_eq!(t.len(), 3);

        // Already has a near-unison partial: nothing inserted.
        let cfg2 = TimbreConfig {
            source: custom(&[(1.0005, 0.5), (2.0, 0.5)]),
            base_strategy: BaseStrategy::One,
            ..Default::default()
        };
        assert_eq!(run_timbre_step(&cfg2).len(), 2);
    }

    #[test]
    fn pipeline_order_changes_energy_normalized_output() {
        let source = custom(&[(1.0, 1.0), (2.0, 4.0)]);
        let base = TimbreConfig {
            source,
            merge_close_partials: false,
            normalization: AmplitudeNormalization::Energy,
            compression: AmplitudeCompression::Sqrt,
            ..Default::default()
        };
        let nc = run_timbre_step(&TimbreConfig {
            pipeline: AmplitudePipeline::NormalizeThenCompress,
            ..base.clone()
        });
        let cn = run_timbre_step(&TimbreConfig {
            pipeline: AmplitudePipeline::CompressThenNormalize,
            ..base
        });
        let a = nc.partials[0].amp;
        let b = cn.partials[0].amp;
        assert!((a - b).abs() > 1e-3, "orders should differ: {a} vs {b}");
    }

    #[test]
    fn cap_keeps_strongest_and_reindexes() {
        let cfg = TimbreConfig {
            source: custom(&[(1.0, 0.1), (2.0, 0.9), (3.0, 0.5), (4.0, 0.05)]),
            max_partials: 2,
            merge_close_partials: false,
            normalization: AmplitudeNormalization::None,
            ..Default::default()
        };
        let t = run_timbre_step(&cfg);
        assert_eq!(t.dropped, 2);
        let ratios: Vec<f32> = t.partials.iter().map(|p| p.ratio).collect();
        assert_eq!(ratios, vec![2.0, 3.0]);
        assert_eq!(t.partials[0].index, 0);
        assert_eq!(t.partials[1].index, 1);
    }

    #[test]
    fn zero_partials_is_silence_not_error() {
        let cfg = TimbreConfig {
            max_partials: 0,
            ..Default::default()
        };
        assert!(run_timbre_step(&cfg).is_empty());

        let cfg2 = TimbreConfig {
            source: custom(&[]),
            ..Default::default()
        };
        assert!(run_timbre_step(&cfg2).is_empty());
    }

    #[test]
    fn clamp_floors_negative_amps() {
        let src = custom(&[(1.0, 1.0), (2.0, -0.3)]);
        let clamped = run_timbre_step(&TimbreConfig {
            source: src.clone(),
            merge_close_partials: false,
            normalization: AmplitudeNormalization::None,
            clamp_negative_amps: true,
            ..Default::default()
        });
        assert_eq!(clamped.partials[1].amp, 0.0);

        let kept = run_timbre_step(&TimbreConfig {
            source: src,
            merge_close_partials: false,
            normalization: AmplitudeNormalization::None,
            clamp_negative_amps: false,
            ..Default::default()
        });
        assert!(kept.partials[1].amp < 0.0);
    }

    #[test]
    fn non_finite_source_partials_discarded() {
        let cfg = TimbreConfig {
            source: custom(&[(1.0, 1.0), (f32::NAN, 0.5), (2.0, f32::INFINITY), (-1.0, 0.2)]),
            normalization: AmplitudeNormalization::None,
            ..Default::default()
        };
        let t = run_timbre_step(&cfg);
        assert_eq!(t.len(), 1);
        assert_eq!(t.partials[0].ratio, 1.0);
    }
}
