use std::path::Path;

use anyhow::{Context, Result};
use archload_engine::check_pipeline;
use archload_engine::config::parser;

/// Execute the `check` command: validate config, archive contents, and backends.
pub async fn execute(pipeline_path: &Path) -> Result<()> {
    let config = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;

    let result = check_pipeline(&config).await?;
    println!("{:18} OK ({} datasets)", "Configuration:", result.definitions.len());

    let order: Vec<&str> = result.order.iter().map(|id| id.as_str()).collect();
    println!("{:18} {}", "Execution order:", order.join(", "));

    if result.missing_files.is_empty() {
        println!("{:18} OK ({} entries)", "Archive:", result.archive_entries);
    } else {
        println!("{:18} FAILED", "Archive:");
        for (dataset, file) in &result.missing_files {
            println!("  {dataset}: '{file}' not found in archive");
        }
    }

    if result.backends_ok {
        println!("{:18} OK", "Backends:");
    } else {
        println!("{:18} FAILED", "Backends:");
    }

    if result.missing_files.is_empty() && result.backends_ok {
        println!("\nAll checks passed.");
        Ok(())
    } else {
        anyhow::bail!("One or more checks failed")
    }
}
