use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::info;

mod baseline;
mod bucket;
mod config;
mod error;
mod forecast;
mod models;
mod pipeline;
mod reconcile;
mod report;
mod table;

use config::PipelineConfig;
use forecast::MstlForecaster;
use models::{EntityKey, Granularity};
use pipeline::{Pipeline, RunOutcome, Selection};
use report::ExportFormat;
use table::EventTable;

#[derive(Parser)]
#[command(name = "maintenance-forecast")]
#[command(about = "Planned vs unplanned maintenance forecasting from work-order extracts", long_about = None)]
struct Cli {
    /// Pipeline config (TOML); defaults to ./forecast.toml when present
    #[arg(long, global = true, env = "MAINTENANCE_FORECAST_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SelectionArgs {
    #[arg(long)]
    location: String,
    #[arg(long)]
    functional_area: String,
    #[arg(long)]
    equipment: String,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, value_enum)]
    granularity: Option<Granularity>,
    #[arg(long)]
    horizon: Option<usize>,
    #[arg(long)]
    threshold: Option<usize>,
}

impl RunArgs {
    fn apply(&self, config: &mut PipelineConfig) -> anyhow::Result<()> {
        if let Some(granularity) = self.granularity {
            config.granularity = granularity;
        }
        if let Some(horizon) = self.horizon {
            config.horizon = horizon;
        }
        if let Some(threshold) = self.threshold {
            config.threshold = threshold;
        }
        config.validate()?;
        Ok(())
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List per-equipment planned/unplanned baselines
    Baselines {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long)]
        threshold: Option<usize>,
        /// Include baselines that fail the eligibility filter
        #[arg(long)]
        all: bool,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show selectable locations, functional areas and equipment
    Options {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long)]
        threshold: Option<usize>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long, requires = "location")]
        functional_area: Option<String>,
    },
    /// Forecast one selection and print the savings summary
    Forecast {
        #[arg(long)]
        csv: PathBuf,
        #[command(flatten)]
        selection: SelectionArgs,
        #[command(flatten)]
        run: RunArgs,
        /// Write the unified real/predicted series here
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = ExportFormat::Csv)]
        format: ExportFormat,
    },
    /// Generate a markdown report for one selection
    Report {
        #[arg(long)]
        csv: PathBuf,
        #[command(flatten)]
        selection: SelectionArgs,
        #[command(flatten)]
        run: RunArgs,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Forecast every eligible selection
    Batch {
        #[arg(long)]
        csv: PathBuf,
        #[command(flatten)]
        run: RunArgs,
        #[arg(long)]
        limit: Option<usize>,
        /// Write one CSV row per selection here
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn build_pipeline(csv: &Path, config: &PipelineConfig) -> anyhow::Result<Pipeline> {
    let table = EventTable::from_path(csv, &config.columns)
        .with_context(|| format!("failed to load work orders from {}", csv.display()))?;
    if table.is_empty() {
        anyhow::bail!("{} contains no usable work orders", csv.display());
    }
    let forecaster = Arc::new(MstlForecaster::new(config.model.clone()));
    Ok(Pipeline::new(Arc::new(table), forecaster, config.fit_timeout()))
}

fn selection_from(args: SelectionArgs, config: &PipelineConfig) -> Selection {
    let key = EntityKey::new(args.location, args.functional_area, args.equipment);
    Selection::new(key, config)
}

fn print_summary(outcome: &RunOutcome) {
    let selection = outcome.selection();
    let Some(report) = outcome.report() else {
        if let Some(reason) = outcome.problem() {
            println!("{}: {}", selection.key, reason);
        }
        return;
    };

    let metrics = &report.reconciliation.metrics;
    println!("Forecast for {}:", selection.key);
    println!(
        "- {} historical {} buckets, {} future buckets",
        report.series.len(),
        selection.granularity,
        report.reconciliation.predicted().count()
    );
    println!("- Minutes saved: {:.0} minutes", metrics.minutes_saved);
    println!(
        "- Percentage saved: {}",
        report::format_percent(metrics.percent_saved)
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Baselines {
            csv,
            threshold,
            all,
            limit,
        } => {
            let threshold = threshold.unwrap_or(config.threshold);
            let pipeline = build_pipeline(&csv, &config)?;
            let mut baselines: Vec<_> = pipeline
                .baselines()
                .values()
                .filter(|baseline| all || baseline.is_eligible(threshold))
                .collect();

            if baselines.is_empty() {
                println!("No baselines meet the threshold of {threshold} events.");
                return Ok(());
            }

            baselines.sort_by(|a, b| b.time_saved_pct.total_cmp(&a.time_saved_pct));
            println!("Baselines by time saved:");
            for baseline in baselines.iter().take(limit) {
                println!(
                    "- {}: planned {:.1} min ({} events), unplanned {:.1} min ({} events), {:.1}% saved",
                    baseline.key,
                    baseline.avg_minutes_planned,
                    baseline.count_planned,
                    baseline.avg_minutes_unplanned,
                    baseline.count_unplanned,
                    baseline.time_saved_pct
                );
            }
        }
        Commands::Options {
            csv,
            threshold,
            location,
            functional_area,
        } => {
            let threshold = threshold.unwrap_or(config.threshold);
            let pipeline = build_pipeline(&csv, &config)?;
            let tree = baseline::selection_tree(pipeline.baselines(), threshold);

            match (location, functional_area) {
                (None, _) => {
                    println!("Locations:");
                    for location in pipeline.table().locations() {
                        let marker = if tree.contains_key(location) { "" } else { " (no eligible equipment)" };
                        println!("- {location}{marker}");
                    }
                }
                (Some(location), None) => {
                    println!("Functional areas at {location}:");
                    for area in tree.get(&location).into_iter().flat_map(|areas| areas.keys()) {
                        println!("- {area}");
                    }
                }
                (Some(location), Some(area)) => {
                    println!("Equipment in {location} / {area}:");
                    let equipment = tree.get(&location).and_then(|areas| areas.get(&area));
                    for id in equipment.into_iter().flatten() {
                        println!("- {id}");
                    }
                }
            }
        }
        Commands::Forecast {
            csv,
            selection,
            run,
            out,
            format,
        } => {
            run.apply(&mut config)?;
            let pipeline = build_pipeline(&csv, &config)?;
            let outcome = pipeline.run(selection_from(selection, &config)).await;
            print_summary(&outcome);

            if let (Some(path), Some(report)) = (out, outcome.report()) {
                report::export_records(&report.reconciliation.records, &path, format)?;
                println!("Series written to {}.", path.display());
            }
            if let RunOutcome::Failure { reason, .. } = outcome {
                anyhow::bail!(reason);
            }
        }
        Commands::Report {
            csv,
            selection,
            run,
            out,
        } => {
            run.apply(&mut config)?;
            let pipeline = build_pipeline(&csv, &config)?;
            let outcome = pipeline.run(selection_from(selection, &config)).await;
            let report = report::build_report(&outcome);
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
        Commands::Batch {
            csv,
            run,
            limit,
            out,
        } => {
            run.apply(&mut config)?;
            let pipeline = build_pipeline(&csv, &config)?;
            let mut selections = pipeline.eligible_selections(&config);
            if let Some(limit) = limit {
                selections.truncate(limit);
            }
            if selections.is_empty() {
                println!("No selections meet the threshold of {} events.", config.threshold);
                return Ok(());
            }

            info!(selections = selections.len(), "Starting batch forecast");
            let outcomes = pipeline
                .run_batch(selections, config.max_concurrent_runs)
                .await;

            for outcome in &outcomes {
                let detail = match (outcome.report(), outcome.problem()) {
                    (Some(report), _) => format!(
                        "{:.0} minutes saved ({})",
                        report.reconciliation.metrics.minutes_saved,
                        report::format_percent(report.reconciliation.metrics.percent_saved)
                    ),
                    (None, Some(reason)) => reason.to_string(),
                    (None, None) => String::new(),
                };
                println!("- [{}] {}: {}", outcome.status(), outcome.selection().key, detail);
            }

            if let Some(path) = out {
                report::export_outcomes(&outcomes, &path)?;
                println!("Batch summary written to {}.", path.display());
            }
        }
    }

    Ok(())
}
