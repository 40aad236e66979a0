use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use plotters::coord::Shift;
use plotters::prelude::*;
use serde::Serialize;
use tracing::info;

use crate::config::RunConfig;
use crate::driver::{FilterMetrics, RunOutcome};
use crate::filters::FilterKind;
use crate::sim::WallContact;

/// One CSV row per (step, filter).
#[derive(Debug, Clone, Serialize)]
pub struct TrajectoryRow {
    pub step: usize,
    pub time_s: f64,
    pub filter: &'static str,
    pub true_position: f64,
    pub true_velocity: f64,
    pub measurement: f64,
    pub est_position: f64,
    pub est_velocity: f64,
    pub p_zz: f64,
    pub p_zv: f64,
    pub p_vv: f64,
    pub forgetting_factor: Option<f64>,
    pub injected: Option<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputFiles {
    pub output_dir: PathBuf,
    pub csv_path: PathBuf,
    pub summary_path: PathBuf,
    pub plot_states_path: Option<PathBuf>,
    pub plot_error_path: Option<PathBuf>,
    pub plot_variance_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub config: RunConfig,
    pub samples: usize,
    pub contact_count: usize,
    pub contacts: Vec<WallContact>,
    pub metrics: Vec<FilterMetrics>,
    pub outputs: OutputFiles,
}

/// Writes CSV, summary and (optionally) plots into a fresh run directory
/// under `base_dir`.
pub fn write_run(
    cfg: &RunConfig,
    outcome: &RunOutcome,
    base_dir: &Path,
    plots: bool,
) -> anyhow::Result<Summary> {
    let output_dir = create_timestamped_run_dir(base_dir)?;
    let files = OutputFiles {
        csv_path: output_dir.join("trajectories.csv"),
        summary_path: output_dir.join("summary.json"),
        plot_states_path: plots.then(|| output_dir.join("states.svg")),
        plot_error_path: plots.then(|| output_dir.join("estimation_error.svg")),
        plot_variance_path: plots.then(|| output_dir.join("variance.svg")),
        output_dir,
    };

    let summary = Summary {
        config: cfg.clone(),
        samples: outcome.data.len(),
        contact_count: outcome.data.contacts.len(),
        contacts: outcome.data.contacts.clone(),
        metrics: outcome.metrics.clone(),
        outputs: files.clone(),
    };

    write_csv(&files.csv_path, &trajectory_rows(outcome))?;
    write_json(&files.summary_path, &summary)?;
    make_plots(outcome, &files)?;

    info!(dir = %files.output_dir.display(), "run written");
    Ok(summary)
}

pub fn trajectory_rows(outcome: &RunOutcome) -> Vec<TrajectoryRow> {
    let data = &outcome.data;
    let mut rows = Vec::with_capacity(data.len() * outcome.histories.len());
    for step in 0..data.len() {
        for history in &outcome.histories {
            let mean = history.means[step];
            let cov = history.covariances[step];
            rows.push(TrajectoryRow {
                step,
                time_s: data.times[step],
                filter: history.kind.name(),
                true_position: data.true_states[step][0],
                true_velocity: data.true_states[step][1],
                measurement: data.measurements[step],
                est_position: mean[0],
                est_velocity: mean[1],
                p_zz: cov[(0, 0)],
                p_zv: cov[(0, 1)],
                p_vv: cov[(1, 1)],
                forgetting_factor: history.forgetting_factors.as_ref().map(|l| l[step]),
                injected: history.injections.as_ref().map(|f| f[step]),
            });
        }
    }
    rows
}

fn ensure_parent(path: &Path) -> anyhow::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display())),
        _ => Ok(()),
    }
}

/// Serializes `rows` as CSV with a header taken from the row type.
pub fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> anyhow::Result<()> {
    ensure_parent(path)?;
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to open CSV path {}", path.display()))?;
    rows.iter().try_for_each(|row| writer.serialize(row))?;
    writer.flush()?;
    Ok(())
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    ensure_parent(path)?;
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
}

/// Creates `base_dir/<UTC timestamp>`, appending `-01`, `-02`, ... when a run
/// from the same second already claimed the name.
pub fn create_timestamped_run_dir(base_dir: &Path) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(base_dir).with_context(|| {
        format!("failed to create output base directory {}", base_dir.display())
    })?;

    let stamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
    let mut attempt = 0usize;
    loop {
        let candidate = match attempt {
            0 => base_dir.join(&stamp),
            n => base_dir.join(format!("{stamp}-{n:02}")),
        };
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => {
                return Err(e).with_context(|| format!("failed to create {}", candidate.display()))
            }
        }
    }
}

pub fn make_plots(outcome: &RunOutcome, files: &OutputFiles) -> anyhow::Result<()> {
    if let Some(path) = &files.plot_states_path {
        plot_states(outcome, path)?;
    }
    if let Some(path) = &files.plot_error_path {
        plot_estimation_error(outcome, path)?;
    }
    if let Some(path) = &files.plot_variance_path {
        plot_variance(outcome, path)?;
    }
    Ok(())
}

struct Trace {
    label: &'static str,
    color: RGBColor,
    points: Vec<(f64, f64)>,
}

fn filter_color(kind: FilterKind) -> RGBColor {
    match kind {
        FilterKind::Standard => RED,
        FilterKind::AdaptiveForgetting => GREEN,
        FilterKind::TargetedInjection => BLUE,
    }
}

fn estimate_traces(outcome: &RunOutcome, value: impl Fn(usize, usize) -> f64) -> Vec<Trace> {
    outcome
        .histories
        .iter()
        .enumerate()
        .map(|(h, history)| Trace {
            label: history.kind.label(),
            color: filter_color(history.kind),
            points: (0..history.len())
                .map(|k| (outcome.data.times[k], value(h, k)))
                .collect(),
        })
        .collect()
}

fn draw_panel(
    area: &DrawingArea<SVGBackend<'_>, Shift>,
    caption: &str,
    y_desc: &str,
    traces: &[Trace],
) -> anyhow::Result<()> {
    let (t0, t1) = traces
        .iter()
        .flat_map(|t| t.points.iter().map(|p| p.0))
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), x| {
            (lo.min(x), hi.max(x))
        });
    let (lo, hi) = traces
        .iter()
        .flat_map(|t| t.points.iter().map(|p| p.1))
        .filter(|y| y.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), y| {
            (lo.min(y), hi.max(y))
        });
    let (t0, t1) = if t0 < t1 { (t0, t1) } else { (0.0, 1.0) };
    let (lo, hi) = if lo < hi {
        let pad = 0.05 * (hi - lo);
        (lo - pad, hi + pad)
    } else if lo.is_finite() {
        (lo - 1.0, lo + 1.0)
    } else {
        (0.0, 1.0)
    };

    let mut chart = ChartBuilder::on(area)
        .caption(caption, ("sans-serif", 28).into_font())
        .margin(16)
        .x_label_area_size(45)
        .y_label_area_size(70)
        .build_cartesian_2d(t0..t1, lo..hi)?;

    chart
        .configure_mesh()
        .x_desc("Time [s]")
        .y_desc(y_desc)
        .draw()?;

    for trace in traces {
        let color = trace.color;
        chart
            .draw_series(LineSeries::new(trace.points.iter().copied(), &color))?
            .label(trace.label)
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 25, y)], color.stroke_width(3)));
    }

    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::UpperRight)
        .border_style(BLACK)
        .background_style(WHITE.mix(0.7))
        .draw()?;
    Ok(())
}

/// Truth plus every filter's estimate of state component `index`.
fn state_traces(outcome: &RunOutcome, index: usize) -> Vec<Trace> {
    let data = &outcome.data;
    let mut traces = vec![Trace {
        label: "truth",
        color: BLACK,
        points: data
            .times
            .iter()
            .zip(&data.true_states)
            .map(|(&t, x)| (t, x[index]))
            .collect(),
    }];
    traces.extend(estimate_traces(outcome, |h, k| {
        outcome.histories[h].means[k][index]
    }));
    traces
}

fn plot_states(outcome: &RunOutcome, path: &Path) -> anyhow::Result<()> {
    let root = SVGBackend::new(path, (1280, 1200)).into_drawing_area();
    root.fill(&WHITE)?;
    let panels = root.split_evenly((3, 1));

    draw_panel(
        &panels[0],
        "Position: truth and estimates",
        "Position [m]",
        &state_traces(outcome, 0),
    )?;
    draw_panel(
        &panels[1],
        "Velocity: truth and estimates",
        "Velocity [m/s]",
        &state_traces(outcome, 1),
    )?;

    let times = &outcome.data.times;
    let lambdas: Vec<Trace> = outcome
        .histories
        .iter()
        .filter_map(|history| {
            history.forgetting_factors.as_ref().map(|l| Trace {
                label: history.kind.label(),
                color: filter_color(history.kind),
                points: times.iter().copied().zip(l.iter().copied()).collect(),
            })
        })
        .collect();
    if !lambdas.is_empty() {
        draw_panel(&panels[2], "Forgetting factor", "lambda", &lambdas)?;
    }

    root.present()?;
    Ok(())
}

fn plot_estimation_error(outcome: &RunOutcome, path: &Path) -> anyhow::Result<()> {
    let root = SVGBackend::new(path, (1280, 900)).into_drawing_area();
    root.fill(&WHITE)?;
    let (upper, lower) = root.split_vertically(450);

    let error = |index: usize| {
        estimate_traces(outcome, move |h, k| {
            (outcome.histories[h].means[k][index] - outcome.data.true_states[k][index]).abs()
        })
    };
    draw_panel(&upper, "Absolute position error", "|error| [m]", &error(0))?;
    draw_panel(&lower, "Absolute velocity error", "|error| [m/s]", &error(1))?;

    root.present()?;
    Ok(())
}

fn plot_variance(outcome: &RunOutcome, path: &Path) -> anyhow::Result<()> {
    let root = SVGBackend::new(path, (1280, 900)).into_drawing_area();
    root.fill(&WHITE)?;
    let (upper, lower) = root.split_vertically(450);

    let p_zz = estimate_traces(outcome, |h, k| outcome.histories[h].covariances[k][(0, 0)]);
    draw_panel(&upper, "Position variance", "P_zz [m^2]", &p_zz)?;
    let p_vv = estimate_traces(outcome, |h, k| outcome.histories[h].covariances[k][(1, 1)]);
    draw_panel(&lower, "Velocity variance", "P_vv [m^2/s^2]", &p_vv)?;

    root.present()?;
    Ok(())
}
