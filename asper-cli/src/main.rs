mod config;
mod report;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use asper_core::grid::{CancelToken, Resolution, run_grid_step};
use asper_core::minima::run_minima_step;
use asper_core::pairs::PairIndexCache;
use asper_core::roughness::{TONE_ROOT, TONE_X, TONE_Y, evaluate_point, realize_template};
use asper_core::suggest::{build_scale_from_minima, build_timbre_suggestions};
use asper_core::timbre::{TimbreSource, WaveformPreset, run_timbre_step};

use config::AppConfig;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML configuration file; missing sections fall back to defaults
    #[arg(long)]
    config: Option<String>,

    /// Waveform preset override: sawtooth, square, or triangle
    #[arg(long)]
    preset: Option<String>,

    /// Fixed per-axis resolution override
    #[arg(long)]
    steps: Option<usize>,

    /// Base frequency override (Hz)
    #[arg(long)]
    base_freq: Option<f32>,

    /// Enable progressive grid refinement
    #[arg(long, default_value_t = false)]
    refine: bool,

    /// Write the sampled surface as CSV
    #[arg(long)]
    export_grid: Option<String>,

    /// Write the minima list as CSV
    #[arg(long)]
    export_minima: Option<String>,
}

fn parse_preset(name: &str) -> Option<WaveformPreset> {
    match name.to_ascii_lowercase().as_str() {
        "saw" | "sawtooth" => Some(WaveformPreset::Sawtooth),
        "square" => Some(WaveformPreset::Square),
        "triangle" => Some(WaveformPreset::Triangle),
        _ => None,
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut cfg = AppConfig::load_or_default(args.config.as_deref());
    if let Some(name) = &args.preset {
        match parse_preset(name) {
            Some(p) => cfg.timbre.source = TimbreSource::Preset(p),
            None => eprintln!("Unknown preset {name}; keeping the configured source."),
        }
    }
    if let Some(steps) = args.steps {
        cfg.sampling.resolution = Resolution::Fixed {
            x_steps: steps,
            y_steps: steps,
        };
    }
    if let Some(hz) = args.base_freq {
        cfg.timbre.base_freq_hz = hz;
        cfg.sampling.base_freq_hz = hz;
    }
    if args.refine {
        cfg.sampling.refine.enabled = true;
    }

    // ---- Step 1: timbre template ----
    let template = run_timbre_step(&cfg.timbre);
    println!("== Step 1 ==");
    report::print_template(&template, &cfg.timbre);

    let cache = PairIndexCache::new();
    let base = cfg.sampling.base_freq_hz;

    // ---- Step 2: single-point probe at the rough semitone ----
    let semitone = 2.0_f32.powf(1.0 / 12.0);
    let mut partials = Vec::new();
    realize_template(&template, base, 1.0, TONE_ROOT, &mut partials);
    realize_template(&template, base, semitone, TONE_X, &mut partials);
    let probe = evaluate_point(&partials, &cfg.constants, &cfg.options, &cache);
    println!("\n== Step 2 ==");
    println!("Probe interval: {semitone:.5} (100.0 cents)");
    report::print_point(&probe);

    // ---- Step 3: grid sweep ----
    let cancel = CancelToken::new();
    let cancel_for_ctrlc = cancel.clone();
    ctrlc::set_handler(move || cancel_for_ctrlc.cancel())?;
    let grid = run_grid_step(
        &template,
        &template,
        &cfg.constants,
        &cfg.options,
        &cfg.sampling,
        &cache,
        &cancel,
    )?;
    println!("\n== Step 3 ==");
    report::print_grid(&grid);

    // ---- Step 4: minima ----
    let minima = run_minima_step(&grid, &cfg.minima);
    println!("\n== Step 4 ==");
    report::print_minima(&minima);

    // ---- Step 5: suggestions & scale ----
    println!("\n== Step 5 ==");
    if let Some(worst) = grid
        .normalized
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
    {
        let (ix, iy) = (worst.0 % grid.nx(), worst.0 / grid.nx());
        partials.clear();
        realize_template(&template, base, 1.0, TONE_ROOT, &mut partials);
        realize_template(&template, base, grid.xs[ix], TONE_X, &mut partials);
        realize_template(&template, base, grid.ys[iy], TONE_Y, &mut partials);
        let point = evaluate_point(&partials, &cfg.constants, &cfg.options, &cache);
        println!(
            "Roughest sample: x={:.5} y={:.5} (normalized {:.4})",
            grid.xs[ix], grid.ys[iy], worst.1
        );
        report::print_suggestions(&build_timbre_suggestions(&point.top_pairs, base));
    }
    let scale = build_scale_from_minima(&minima.minima, cfg.scale.root_ratio, cfg.scale.max_count);
    report::print_scale(&scale);

    if let Some(path) = &args.export_grid {
        report::write_csv(path, &report::grid_csv_rows(&grid))?;
        println!("\nWrote grid CSV to {path}");
    }
    if let Some(path) = &args.export_minima {
        report::write_csv(path, &report::minima_csv_rows(&minima))?;
        println!("Wrote minima CSV to {path}");
    }
    Ok(())
}
