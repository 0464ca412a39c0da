//! Data ingestion: builds the immutable [`DataProfile`] the engine works
//! from.
//!
//! The data dictionary arrives as a Markdown table (`| name | type |
//! description |`) or a JSON object. Observed types and statistics come
//! from a fixed profiling script run through the execution sandbox - the
//! engine itself never parses the raw dataset. When profiling fails the
//! profile degrades to declared types only instead of blocking the run.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use autoanalyst_sdk::{
    log_warning, DataProfile, DatasetHandle, ExecLimits, ExecOutcome, FieldProfile, FieldStats,
    StepRunner,
};
use serde_json::Value;

/// Fixed profiling script. Runs under the same sandbox policy as generated
/// code; its `result` variable carries the observed profile as JSON.
fn profiling_script(data_path: &Path) -> String {
    format!(
        r#"import pandas as pd
df = pd.read_csv(r"{data_path}")
profile = {{"row_count": int(df.shape[0]), "fields": {{}}}}
for col in df.columns:
    s = df[col]
    entry = {{
        "observed_type": str(s.dtype),
        "count": int(s.count()),
        "null_count": int(s.isna().sum()),
    }}
    if s.dtype.kind in "if" and s.count() > 0:
        entry["min"] = float(s.min())
        entry["max"] = float(s.max())
        entry["mean"] = float(s.mean())
    else:
        entry["distinct_count"] = int(s.nunique())
    entry["samples"] = [str(v) for v in s.dropna().head(3).tolist()]
    profile["fields"][str(col)] = entry
result = profile
"#,
        data_path = data_path.display()
    )
}

/// Parse a Markdown-table data dictionary into per-field declared types.
pub fn parse_markdown_dictionary(content: &str) -> BTreeMap<String, FieldProfile> {
    let mut fields = BTreeMap::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with('|') {
            continue;
        }
        let cells: Vec<&str> = trimmed
            .trim_matches('|')
            .split('|')
            .map(|c| c.trim())
            .collect();
        if cells.len() < 2 {
            continue;
        }
        let name = cells[0];
        // skip the header and separator rows
        if name.is_empty()
            || name.eq_ignore_ascii_case("column name")
            || name.eq_ignore_ascii_case("name")
            || name.chars().all(|c| c == '-' || c == ':')
        {
            continue;
        }
        fields.insert(
            name.to_string(),
            FieldProfile {
                declared_type: Some(cells[1].to_string()).filter(|t| !t.is_empty()),
                description: cells.get(2).map(|d| d.to_string()).filter(|d| !d.is_empty()),
                ..Default::default()
            },
        );
    }
    fields
}

/// Parse a JSON data dictionary: `{"field": {"type": "...", "description":
/// "..."}}`, case-insensitive on the inner keys.
pub fn parse_json_dictionary(content: &str) -> Result<BTreeMap<String, FieldProfile>> {
    let value: Value = serde_json::from_str(content).context("data dictionary is not JSON")?;
    let object = value
        .as_object()
        .context("JSON data dictionary must be an object")?;

    let mut fields = BTreeMap::new();
    for (name, entry) in object {
        let get = |key: &str| -> Option<String> {
            entry
                .as_object()?
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .and_then(|(_, v)| v.as_str())
                .map(|s| s.to_string())
        };
        fields.insert(
            name.clone(),
            FieldProfile {
                declared_type: get("type"),
                description: get("description"),
                ..Default::default()
            },
        );
    }
    Ok(fields)
}

/// Read and parse a data dictionary file, JSON or Markdown by extension
/// with a content sniff as fallback.
pub fn load_dictionary(path: &Path) -> Result<(BTreeMap<String, FieldProfile>, String)> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read data dictionary: {}", path.display()))?;
    let is_json = path.extension().map(|e| e == "json").unwrap_or(false)
        || content.trim_start().starts_with('{');
    let fields = if is_json {
        parse_json_dictionary(&content)?
    } else {
        parse_markdown_dictionary(&content)
    };
    Ok((fields, content))
}

/// Build the full profile: declared types from the dictionary, observed
/// types and statistics from one sandboxed profiling run.
pub async fn build_profile(
    dict_path: &Path,
    runner: &dyn StepRunner,
    dataset: &DatasetHandle,
    limits: &ExecLimits,
) -> Result<DataProfile> {
    let (mut fields, dictionary_text) = load_dictionary(dict_path)?;

    let mut row_count = None;
    match runner
        .run(&profiling_script(&dataset.data_path), dataset, limits)
        .await
    {
        Ok(record) if record.outcome == ExecOutcome::Success => {
            if let Some(observed) = record.result_value {
                row_count = observed.get("row_count").and_then(|v| v.as_u64());
                merge_observed(&mut fields, &observed);
            }
        }
        Ok(record) => {
            log_warning!(
                "Dataset profiling ended with {}; continuing with declared types only",
                record.outcome
            );
        }
        Err(e) => {
            log_warning!(
                "Dataset profiling failed ({}); continuing with declared types only",
                e
            );
        }
    }

    Ok(DataProfile {
        fields,
        row_count,
        dictionary_text,
    })
}

fn merge_observed(fields: &mut BTreeMap<String, FieldProfile>, observed: &Value) {
    let Some(observed_fields) = observed.get("fields").and_then(|f| f.as_object()) else {
        return;
    };
    for (name, entry) in observed_fields {
        let field = fields.entry(name.clone()).or_default();
        field.observed_type = entry
            .get("observed_type")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        field.stats = FieldStats {
            count: entry.get("count").and_then(|v| v.as_u64()),
            null_count: entry.get("null_count").and_then(|v| v.as_u64()),
            min: entry.get("min").and_then(|v| v.as_f64()),
            max: entry.get("max").and_then(|v| v.as_f64()),
            mean: entry.get("mean").and_then(|v| v.as_f64()),
            distinct_count: entry.get("distinct_count").and_then(|v| v.as_u64()),
        };
        field.sample_values = entry
            .get("samples")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();
    }
}
