use std::path::Path;

use anyhow::{Context, Result};
use archload_engine::config::parser;
use archload_engine::{CycleReport, DatasetOutcome, Pipeline};
use archload_types::dataset::DatasetId;

/// Execute the `run` command: parse, plan, and run a cycle or one dataset.
pub async fn execute(pipeline_path: &Path, dataset: Option<&str>) -> Result<()> {
    let config = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;

    let pipeline = Pipeline::from_config(config).await?;
    tracing::info!(
        datasets = pipeline.definitions().len(),
        table = %pipeline.settings().table,
        "Pipeline validated"
    );

    let report = tokio::select! {
        report = run(&pipeline, dataset) => report?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, aborting dataset runs");
            anyhow::bail!("Interrupted");
        }
    };

    print_report(&report);

    if report.failed() > 0 {
        anyhow::bail!("{} of {} dataset(s) failed", report.failed(), report.outcomes.len());
    }
    Ok(())
}

async fn run(pipeline: &Pipeline, dataset: Option<&str>) -> Result<CycleReport> {
    match dataset {
        Some(id) => {
            let started = std::time::Instant::now();
            let outcome = pipeline.run_dataset(&DatasetId::new(id)).await?;
            Ok(CycleReport {
                outcomes: vec![outcome],
                duration_secs: started.elapsed().as_secs_f64(),
            })
        }
        None => Ok(pipeline.run_cycle().await?),
    }
}

fn print_report(report: &CycleReport) {
    for outcome in &report.outcomes {
        print_outcome(outcome);
    }
    println!();
    println!("  Datasets:        {} ok, {} failed", report.succeeded(), report.failed());
    println!("  Rows written:    {}", report.rows_written());
    println!("  Duration:        {:.2}s", report.duration_secs);

    // Machine-readable summary for schedulers wrapping the CLI
    let datasets: Vec<serde_json::Value> = report
        .outcomes
        .iter()
        .map(|o| match &o.result {
            Ok(summary) => serde_json::json!({
                "dataset": o.dataset.as_str(),
                "run_id": o.run_id,
                "state": "success",
                "rows_read": summary.rows_read,
                "rows_written": summary.rows_written,
                "attempts": summary.attempts,
            }),
            Err(e) => serde_json::json!({
                "dataset": o.dataset.as_str(),
                "run_id": o.run_id,
                "state": "failed",
                "stage": e.stage.as_str(),
                "error": e.source.to_string(),
            }),
        })
        .collect();
    let json = serde_json::json!({
        "succeeded": report.succeeded(),
        "failed": report.failed(),
        "rows_written": report.rows_written(),
        "duration_secs": report.duration_secs,
        "datasets": datasets,
    });
    println!("@@ARCHLOAD_JSON@@{json}");
}

fn print_outcome(outcome: &DatasetOutcome) {
    let label = format!("{}:", outcome.dataset);
    match &outcome.result {
        Ok(summary) => println!(
            "{label:24} OK      {} read, {} written in {:.2}s",
            summary.rows_read, summary.rows_written, summary.duration_secs
        ),
        Err(e) => println!("{label:24} FAILED  [{}] {}", e.stage, e.source),
    }
}
