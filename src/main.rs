use std::path::PathBuf;

use clap::Parser;
use impact_kf::filters::FilterKind;
use impact_kf::model::CovarianceForm;
use impact_kf::{output, run, RunConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Kalman filters through unmodeled wall impacts on a mass-spring-damper"
)]
struct Cli {
    /// TOML config file; built-in defaults when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output base directory
    #[arg(long, default_value = "output-impact-kf")]
    output: PathBuf,

    /// Measurement noise seed
    #[arg(long)]
    seed: Option<u64>,

    /// Comma-separated subset of standard,adaptive,injection
    #[arg(long, value_delimiter = ',')]
    filters: Option<Vec<FilterKind>>,

    /// End of the simulated horizon [s]
    #[arg(long)]
    t_end: Option<f64>,

    /// Wall position [m]
    #[arg(long)]
    wall_pos: Option<f64>,

    /// Covariance update form: simple or joseph
    #[arg(long)]
    covariance_form: Option<CovarianceForm>,

    /// Skip SVG plots
    #[arg(long)]
    no_plots: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => RunConfig::from_toml_file(path)?,
        None => RunConfig::default(),
    };
    if let Some(v) = cli.seed {
        cfg.seed = v;
    }
    if let Some(v) = cli.filters {
        cfg.filters = v;
    }
    if let Some(v) = cli.t_end {
        cfg.system.t_end = v;
    }
    if let Some(v) = cli.wall_pos {
        cfg.system.wall_pos = v;
    }
    if let Some(v) = cli.covariance_form {
        cfg.model.covariance_form = v;
    }
    cfg.validate()?;

    let outcome = run(&cfg)?;
    let summary = output::write_run(&cfg, &outcome, &cli.output, !cli.no_plots)?;

    println!(
        "Simulation complete. Samples: {} | Wall contacts: {}",
        summary.samples, summary.contact_count
    );
    println!("Run directory: {}", summary.outputs.output_dir.display());
    println!("CSV: {}", summary.outputs.csv_path.display());
    println!("Summary: {}", summary.outputs.summary_path.display());
    for m in &summary.metrics {
        let mut line = format!(
            "{:<7} RMSE pos/vel: {:.4} m | {:.4} m/s | max pos err {:.4} m",
            m.filter.label(),
            m.rmse_position,
            m.rmse_velocity,
            m.max_position_error
        );
        if let Some(count) = m.injection_count {
            line.push_str(&format!(" | injections {count}"));
        }
        if let Some(lambda) = m.mean_forgetting_factor {
            line.push_str(&format!(" | mean lambda {lambda:.3}"));
        }
        println!("{line}");
    }

    Ok(())
}
