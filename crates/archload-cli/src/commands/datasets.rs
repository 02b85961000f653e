use std::path::Path;

use anyhow::{Context, Result};
use archload_engine::config::parser;
use archload_engine::plan::execution_order;
use archload_engine::registry;

/// Execute the `datasets` command: list validated definitions in execution order.
pub fn execute(pipeline_path: &Path, json: bool) -> Result<()> {
    let config = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;
    let definitions = registry::load_pipeline(&config)?;
    let order = execution_order(&definitions)?;

    if json {
        let ordered: Vec<_> = order.iter().map(|&i| &definitions[i]).collect();
        println!("{}", serde_json::to_string_pretty(&ordered)?);
        return Ok(());
    }

    for &i in &order {
        let def = &definitions[i];
        let depends = def
            .depends_on
            .as_ref()
            .map(|d| format!(" (after {d})"))
            .unwrap_or_default();
        println!("{}{depends}", def.id);
        println!("  {:8} {}", "file:", def.file_name);
        println!("  {:8} {}", "format:", def.format);
        println!("  {:8} {}", "columns:", def.columns.join(", "));
    }
    Ok(())
}
