//! Console tables and CSV rows for the step reports.

use asper_core::common::{median, ratio_to_cents};
use asper_core::grid::GridData;
use asper_core::minima::{MinimaResult, RatioApprox};
use asper_core::roughness::{PointRoughness, TONE_ROOT, TONE_X, TONE_Y};
use asper_core::suggest::{Suggestion, interval_name};
use asper_core::timbre::{TimbreConfig, TimbreTemplate};

const TEMPLATE_ROWS_SHOWN: usize = 12;

fn mask_label(mask: u8) -> &'static str {
    match mask {
        TONE_ROOT => "root",
        TONE_X => "x-int",
        TONE_Y => "y-int",
        _ => "mixed",
    }
}

pub fn print_template(template: &TimbreTemplate, cfg: &TimbreConfig) {
    println!("Base frequency: {:.2} Hz", cfg.base_freq_hz);
    println!(
        "Partials: {} (merged {}, dropped {})",
        template.len(),
        template.merged,
        template.dropped
    );
    if template.is_empty() {
        println!("Template is silent.");
        return;
    }
    println!("idx  ratio      amp");
    for p in template.partials.iter().take(TEMPLATE_ROWS_SHOWN) {
        println!("{:<3}  {:>8.4}  {:>6.4}", p.index, p.ratio, p.amp);
    }
    if template.len() > TEMPLATE_ROWS_SHOWN {
        println!("... {} more", template.len() - TEMPLATE_ROWS_SHOWN);
    }
}

pub fn print_point(point: &PointRoughness) {
    println!(
        "Roughness: {:.6}{}",
        point.total,
        if point.diag.silent { "  (silent)" } else { "" }
    );
    println!(
        "Pairs: {} total, {} skipped | partials: {} invalid, {} pruned",
        point.diag.total_pairs,
        point.diag.skipped_pairs,
        point.diag.invalid_partials,
        point.diag.pruned_partials
    );
    if point.top_pairs.is_empty() {
        return;
    }
    println!("fA (Hz)    fB (Hz)    tones          value");
    for p in &point.top_pairs {
        println!(
            "{:>8.2}   {:>8.2}   {:<12} {:>9.6}",
            p.freq_a,
            p.freq_b,
            format!("{}/{}", mask_label(p.tone_a), mask_label(p.tone_b)),
            p.value
        );
    }
}

pub fn print_grid(grid: &GridData) {
    let s = &grid.summary;
    println!(
        "Resolution: {} x {} ({} points)",
        grid.nx(),
        grid.ny(),
        s.points
    );
    if let (Some(x0), Some(x1), Some(y0), Some(y1)) = (
        grid.xs.first(),
        grid.xs.last(),
        grid.ys.first(),
        grid.ys.last(),
    ) {
        println!("Domain: x {x0:.4} .. {x1:.4} | y {y0:.4} .. {y1:.4}");
    }
    let med = median(&mut grid.raw.clone());
    println!(
        "Raw roughness: min {:.6}, median {:.6}, max {:.6}  ({:?} normalization)",
        grid.min_raw, med, grid.max_raw, grid.normalization
    );
    println!(
        "Pairs: {} evaluated, {} skipped | partials: {} invalid, {} pruned",
        s.total_pairs, s.skipped_pairs, s.invalid_partials, s.pruned_partials
    );
    println!("Silent points: {}/{}", s.silent_points, s.points);
    if s.refine_passes_run > 0 {
        println!(
            "Refinement: {} passes, {} samples inserted",
            s.refine_passes_run, s.samples_inserted
        );
    }
    if s.cancelled {
        println!("Cancelled; the last completed pass is shown.");
    }
}

fn approx_label(approx: &RatioApprox) -> String {
    match interval_name(approx.num, approx.den) {
        Some(name) => format!("{}/{} ({})", approx.num, approx.den, name),
        None => format!("{}/{}", approx.num, approx.den),
    }
}

pub fn print_minima(res: &MinimaResult) {
    if res.minima.is_empty() {
        println!("No local minima found.");
        return;
    }
    println!("Local minima (by depth):");
    for (k, m) in res.minima.iter().enumerate() {
        println!(
            "#{:<2} x={:.5} y={:.5}  D={:.6}  depth={:.6}  plateau={}  basin={} cells",
            k + 1,
            m.x,
            m.y,
            m.value,
            m.depth,
            m.plateau_size,
            m.basin_cells
        );
        if let Some(a) = &m.x_approx {
            println!("    x ≈ {}  err {:.2} cents", approx_label(a), a.error_cents);
        }
        if let Some(a) = &m.y_approx {
            println!("    y ≈ {}  err {:.2} cents", approx_label(a), a.error_cents);
        }
    }
    if res.refine_passes > 0 {
        println!(
            "Rational refinement: {} passes, {} candidates examined",
            res.refine_passes, res.refine_steps
        );
    }
}

pub fn print_suggestions(suggestions: &[Suggestion]) {
    if suggestions.is_empty() {
        println!("No suggestions; nothing clashes hard enough.");
        return;
    }
    for s in suggestions {
        println!("{}", s.title);
        for d in &s.details {
            println!("  - {d}");
        }
    }
}

pub fn print_scale(scale: &[f32]) {
    println!("Scale candidates ({}):", scale.len());
    for &r in scale {
        println!("  {:.5}  ({:>7.1} cents)", r, ratio_to_cents(r));
    }
}

pub fn grid_csv_rows(grid: &GridData) -> Vec<String> {
    let mut rows = Vec::with_capacity(grid.raw.len() + 1);
    rows.push("x,y,raw,normalized".to_string());
    for iy in 0..grid.ny() {
        for ix in 0..grid.nx() {
            let at = grid.idx(ix, iy);
            rows.push(format!(
                "{},{},{},{}",
                grid.xs[ix], grid.ys[iy], grid.raw[at], grid.normalized[at]
            ));
        }
    }
    rows
}

pub fn minima_csv_rows(res: &MinimaResult) -> Vec<String> {
    let mut rows = Vec::with_capacity(res.minima.len() + 1);
    rows.push("x,y,value,depth,plateau,basin_cells,basin_area,x_approx,y_approx".to_string());
    for m in &res.minima {
        let fmt = |a: &Option<RatioApprox>| {
            a.as_ref()
                .map(|a| format!("{}/{}", a.num, a.den))
                .unwrap_or_default()
        };
        rows.push(format!(
            "{},{},{},{},{},{},{},{},{}",
            m.x,
            m.y,
            m.value,
            m.depth,
            m.plateau_size,
            m.basin_cells,
            m.basin_area,
            fmt(&m.x_approx),
            fmt(&m.y_approx)
        ));
    }
    rows
}

pub fn write_csv(path: &str, rows: &[String]) -> std::io::Result<()> {
    use std::io::Write;
    let f = std::fs::File::create(path)?;
    let mut w = std::io::BufWriter::new(f);
    for line in rows {
        writeln!(w, "{line}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use asper_core::minima::MinimaPoint;

    #[test]
    fn minima_rows_carry_rational_readings() {
        let res = MinimaResult {
            minima: vec![MinimaPoint {
                x: 1.5,
                y: 1.25,
                ix: 3,
                iy: 2,
                value: 0.12,
                depth: 0.4,
                plateau_size: 1,
                basin_cells: 5,
                basin_area: 0.02,
                basin_radius: 0.08,
                basin_threshold_value: 0.32,
                x_approx: Some(RatioApprox {
                    num: 3,
                    den: 2,
                    value: 1.5,
                    error_cents: 0.0,
                }),
                y_approx: None,
            }],
            refine_passes: 1,
            refine_steps: 6,
        };
        let rows = minima_csv_rows(&res);
        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("x,y,"));
        assert!(rows[1].contains("3/2"));
        assert!(rows[1].ends_with(','), "empty y approx: {}", rows[1]);
    }

    #[test]
    fn tone_masks_decode_to_labels() {
        assert_eq!(mask_label(TONE_ROOT), "root");
        assert_eq!(mask_label(TONE_X), "x-int");
        assert_eq!(mask_label(TONE_ROOT | TONE_Y), "mixed");
    }
}
