use asper_core::grid::{CancelToken, Resolution, SamplingConfig, run_grid_step};
use asper_core::minima::{MinimaConfig, run_minima_step};
use asper_core::pairs::PairIndexCache;
use asper_core::roughness::{
    RoughnessConstants, RoughnessOptions, TONE_ROOT, TONE_X, evaluate_point, realize_template,
};
use asper_core::suggest::{build_scale_from_minima, build_timbre_suggestions};
use asper_core::timbre::{RawPartial, TimbreConfig, TimbreSource, run_timbre_step};

fn fifth_timbre() -> asper_core::timbre::TimbreTemplate {
    run_timbre_step(&TimbreConfig {
        source: TimbreSource::Custom(vec![
            RawPartial { ratio: 1.0, amp: 1.0 },
            RawPartial { ratio: 1.5, amp: 1.0 },
        ]),
        merge_close_partials: false,
        ..Default::default()
    })
}

fn roughness_at(multiplier: f32, cache: &PairIndexCache) -> f32 {
    let template = fifth_timbre();
    let mut partials = Vec::new();
    realize_template(&template, 261.63, 1.0, TONE_ROOT, &mut partials);
    realize_template(&template, 261.63, multiplier, TONE_X, &mut partials);
    let opts = RoughnessOptions {
        amp_threshold: 0.0,
        ..Default::default()
    };
    evaluate_point(&partials, &RoughnessConstants::default(), &opts, cache).total
}

#[test]
fn perfect_fifth_dips_below_its_neighbors() {
    let cache = PairIndexCache::new();
    let at_fifth = roughness_at(1.5, &cache);
    let below = roughness_at(1.4, &cache);
    let above = roughness_at(1.6, &cache);
    assert!(
        at_fifth < below && at_fifth < above,
        "fifth {at_fifth} should undercut neighbors {below} and {above}"
    );
    // Pronounced, not marginal.
    assert!(at_fifth * 4.0 < below);
    assert!(at_fifth * 4.0 < above);
}

#[test]
fn surface_minimum_lands_on_the_fifth_and_reads_three_halves() {
    let template = fifth_timbre();
    let cache = PairIndexCache::new();
    let cfg = SamplingConfig {
        x_range: (1.2, 1.8),
        y_range: (1.2, 1.8),
        resolution: Resolution::Fixed {
            x_steps: 25,
            y_steps: 25,
        },
        ..Default::default()
    };
    let grid = run_grid_step(
        &template,
        &template,
        &RoughnessConstants::default(),
        &RoughnessOptions::default(),
        &cfg,
        &cache,
        &CancelToken::new(),
    )
    .unwrap();

    // The x = y diagonal is a trough of its own (the two interval tones
    // fuse there), so keep only the deepest few minima.
    let res = run_minima_step(
        &grid,
        &MinimaConfig {
            max_minima: 4,
            ..Default::default()
        },
    );
    assert!(!res.minima.is_empty());
    for w in res.minima.windows(2) {
        assert!(w[0].depth >= w[1].depth);
    }

    let deepest = &res.minima[0];
    assert!(
        (deepest.x - 1.5).abs() < 0.05 && (deepest.y - 1.5).abs() < 0.05,
        "deepest minimum at ({}, {})",
        deepest.x,
        deepest.y
    );
    let approx = deepest.x_approx.as_ref().unwrap();
    assert_eq!((approx.num, approx.den), (3, 2));
    assert!(approx.error_cents < 20.0);

    let scale = build_scale_from_minima(&res.minima, 1.0, 12);
    assert_eq!(scale[0], 1.0);
    assert!(scale.len() >= 2);
    assert!(
        scale.iter().any(|r| (r / 1.5 - 1.0).abs() < 0.01),
        "scale {scale:?} should carry a fifth"
    );
}

#[test]
fn dissonant_point_yields_a_cross_tone_suggestion() {
    let template = fifth_timbre();
    let cache = PairIndexCache::new();
    let mut partials = Vec::new();
    realize_template(&template, 261.63, 1.0, TONE_ROOT, &mut partials);
    realize_template(&template, 261.63, 1.4, TONE_X, &mut partials);
    let point = evaluate_point(
        &partials,
        &RoughnessConstants::default(),
        &RoughnessOptions::default(),
        &cache,
    );
    assert!(!point.top_pairs.is_empty());

    let suggestions = build_timbre_suggestions(&point.top_pairs, 261.63);
    // Same-tone pairs are skipped by default, so only the cross-tone
    // category can appear.
    assert_eq!(suggestions.len(), 1);
    assert!(suggestions[0].title.contains("cross-tone"));
    assert!(!suggestions[0].details.is_empty());

    assert!(build_timbre_suggestions(&[], 261.63).is_empty());
}
