use std::path::Path;

use anyhow::{Context, Result};
use archload_engine::config::parser;
use archload_engine::open_run_ledger;

/// Execute the `status` command: print recent runs from the run ledger.
pub async fn execute(pipeline_path: &Path, limit: usize) -> Result<()> {
    let config = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;
    let ledger = open_run_ledger(&config).await?;

    let runs = tokio::task::spawn_blocking(move || ledger.recent_runs(limit))
        .await
        .context("run ledger task failed")?
        .context("Failed to read run history")?;

    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }

    println!(
        "{:>6}  {:20} {:8} {:>10} {:>10}  {}",
        "RUN", "DATASET", "STATE", "READ", "WRITTEN", "STARTED"
    );
    for run in &runs {
        println!(
            "{:>6}  {:20} {:8} {:>10} {:>10}  {}",
            run.run_id,
            run.dataset.as_str(),
            run.state.as_str(),
            run.stats.rows_read,
            run.stats.rows_written,
            run.started_at,
        );
        if let Some(message) = &run.stats.error_message {
            println!("        {message}");
        }
    }
    Ok(())
}
