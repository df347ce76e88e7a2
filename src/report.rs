use std::fmt::Write;
use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use crate::models::UnifiedRecord;
use crate::pipeline::{RunOutcome, RunReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    Csv,
    Json,
}

pub fn format_percent(percent: Option<f64>) -> String {
    match percent {
        Some(value) => format!("{value:.2}%"),
        None => "undefined (no predicted unplanned minutes)".to_string(),
    }
}

pub fn build_report(outcome: &RunOutcome) -> String {
    let selection = outcome.selection();
    let mut output = String::new();

    let _ = writeln!(output, "# Maintenance Forecast Report");
    let _ = writeln!(
        output,
        "Generated for {} ({} buckets, horizon {}, threshold {})",
        selection.key, selection.granularity, selection.horizon, selection.threshold
    );
    let _ = writeln!(output);

    let Some(report) = outcome.report() else {
        let _ = writeln!(output, "## Status");
        if let Some(reason) = outcome.problem() {
            let _ = writeln!(output, "Run failed ({}): {}", reason.kind(), reason);
        }
        return output;
    };

    write_baseline(&mut output, report);
    write_history(&mut output, report);
    write_savings(&mut output, report);
    write_upcoming(&mut output, report);

    if let Some(warning) = outcome.problem() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Warnings");
        let _ = writeln!(output, "- {warning}");
    }

    output
}

fn write_baseline(output: &mut String, report: &RunReport) {
    let baseline = &report.baseline;
    let _ = writeln!(output, "## Baseline");
    let _ = writeln!(output, "| Activity | Events | Avg minutes |");
    let _ = writeln!(output, "|---|---:|---:|");
    let _ = writeln!(
        output,
        "| Planned | {} | {:.1} |",
        baseline.count_planned, baseline.avg_minutes_planned
    );
    let _ = writeln!(
        output,
        "| Unplanned | {} | {:.1} |",
        baseline.count_unplanned, baseline.avg_minutes_unplanned
    );
    let _ = writeln!(output);
    let _ = writeln!(
        output,
        "Planned work is {:.1}% faster than unplanned work.",
        baseline.time_saved_pct
    );
    let _ = writeln!(output);
}

fn write_history(output: &mut String, report: &RunReport) {
    let series = &report.series;
    let _ = writeln!(output, "## History");
    if let (Some(first), Some(last)) = (series.first_bucket(), series.last_bucket()) {
        let _ = writeln!(
            output,
            "- {} {} buckets from {} to {}, {} dated events",
            series.len(),
            series.granularity,
            first,
            last,
            series.total_events()
        );
    }
    let empty = series.buckets.iter().filter(|bucket| bucket.count == 0).count();
    let _ = writeln!(output, "- {empty} buckets without events");
    let _ = writeln!(
        output,
        "- Model `{}` in-sample MAE {:.2}, RMSE {:.2}, R² {:.2}",
        report.model, report.fit.mae, report.fit.rmse, report.fit.r_squared
    );
    let _ = writeln!(output);
}

fn write_savings(output: &mut String, report: &RunReport) {
    let metrics = &report.reconciliation.metrics;
    let _ = writeln!(output, "## Time Savings");
    let _ = writeln!(
        output,
        "- Predicted unplanned minutes: {:.0}",
        metrics.total_unplanned
    );
    let _ = writeln!(output, "- Predicted planned minutes: {:.0}", metrics.total_planned);
    let _ = writeln!(output, "- Minutes saved: {:.0}", metrics.minutes_saved);
    let _ = writeln!(
        output,
        "- Percentage saved: {}",
        format_percent(metrics.percent_saved)
    );
    let _ = writeln!(output);
}

fn write_upcoming(output: &mut String, report: &RunReport) {
    let _ = writeln!(output, "## Upcoming Buckets");
    let mut upcoming = report.reconciliation.predicted().take(8).peekable();
    if upcoming.peek().is_none() {
        let _ = writeln!(output, "No future buckets forecast.");
        return;
    }
    for record in upcoming {
        let _ = write!(
            output,
            "- {}: {:.0} planned vs {:.0} unplanned minutes",
            record.timestamp,
            record.minutes_planned.unwrap_or_default(),
            record.minutes_unplanned.unwrap_or_default()
        );
        match (record.expected_count, record.count_lower, record.count_upper) {
            (Some(expected), Some(lower), Some(upper)) => {
                let _ = writeln!(
                    output,
                    " ({expected:.1} work orders, interval {lower:.1} to {upper:.1})"
                );
            }
            _ => {
                let _ = writeln!(output);
            }
        }
    }
}

pub fn export_records(
    records: &[UnifiedRecord],
    path: &Path,
    format: ExportFormat,
) -> anyhow::Result<()> {
    match format {
        ExportFormat::Csv => write_csv(records, path),
        ExportFormat::Json => {
            let json = serde_json::to_string_pretty(records)?;
            std::fs::write(path, json)
                .with_context(|| format!("failed to write {}", path.display()))
        }
    }
}

#[derive(Serialize)]
struct OutcomeRow<'a> {
    location: &'a str,
    functional_area: &'a str,
    equipment_id: &'a str,
    status: &'static str,
    minutes_saved: Option<f64>,
    percent_saved: Option<f64>,
    problem: Option<String>,
}

pub fn export_outcomes(outcomes: &[RunOutcome], path: &Path) -> anyhow::Result<()> {
    let rows: Vec<OutcomeRow<'_>> = outcomes
        .iter()
        .map(|outcome| {
            let key = &outcome.selection().key;
            let metrics = outcome.report().map(|report| report.reconciliation.metrics);
            OutcomeRow {
                location: &key.location,
                functional_area: &key.functional_area,
                equipment_id: &key.equipment_id,
                status: outcome.status(),
                minutes_saved: metrics.map(|m| m.minutes_saved),
                percent_saved: metrics.and_then(|m| m.percent_saved),
                problem: outcome.problem().map(ToString::to_string),
            }
        })
        .collect();
    write_csv(&rows, path)
}

fn write_csv<T: Serialize>(rows: &[T], path: &Path) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}
