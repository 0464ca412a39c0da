//! Reporting: human-facing output over a finished project.
//!
//! Strictly read-only over [`ProjectState`]. Produces the final Markdown
//! report and a Jupyter notebook (nbformat 4 as plain JSON) with one
//! Markdown and one code cell per executed step, so a human can re-run any
//! step by hand - including the failed ones, which carry their error
//! classification and failing code version.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use autoanalyst_sdk::log_file_saved;
use serde_json::{json, Value};

use crate::state::{ProjectState, StepStatus};

/// Render the final report: the backend-written executive body followed by
/// a deterministic per-step record.
pub fn render_report(state: &ProjectState, summary_body: &str) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Analysis report - {}\n\n", state.project_id));
    out.push_str(summary_body.trim());
    out.push_str("\n\n## Step record\n\n");

    for step in state.plan.steps() {
        out.push_str(&format!(
            "### {}. {} ({})\n\n",
            step.seq + 1,
            step.description,
            step.status
        ));

        if let Some(artifact) = state.latest_artifact(step.id) {
            if step.status == StepStatus::Failed {
                out.push_str(&format!(
                    "Failed with outcome `{}` at code version {}.\n\n",
                    artifact.outcome, artifact.code_version
                ));
                if !artifact.stderr.is_empty() {
                    out.push_str(&format!("```\n{}\n```\n\n", artifact.stderr.trim()));
                }
            }
            for figure in &artifact.figures {
                out.push_str(&format!("![{}](figures/{})\n", figure, figure));
            }
            if !artifact.figures.is_empty() {
                out.push('\n');
            }
        }

        if let Some(insight) = state.insight(step.id) {
            if !insight.key_findings.is_empty() {
                for finding in &insight.key_findings {
                    out.push_str(&format!("- {}\n", finding));
                }
                out.push('\n');
            } else if step.status == StepStatus::Completed {
                out.push_str(&format!("{}\n\n", insight.interpretation.trim()));
            }
        }
    }

    out
}

/// Notebook export. Steps that never produced code are left out.
pub fn render_notebook(state: &ProjectState) -> Value {
    let mut cells = vec![markdown_cell(&format!(
        "# {}\n\nGenerated analysis notebook. Each step below carries its \
         description, interpretation and the exact code that ran.",
        state.project_id
    ))];

    for step in state.plan.steps() {
        let Some(artifact) = state.latest_artifact(step.id) else {
            continue;
        };
        let mut text = format!(
            "## Step {}: {}\n\nStatus: {}",
            step.seq + 1,
            step.description,
            step.status
        );
        if let Some(insight) = state.insight(step.id) {
            text.push_str(&format!("\n\n{}", insight.interpretation.trim()));
        }
        cells.push(markdown_cell(&text));
        cells.push(code_cell(&artifact.code));
    }

    json!({
        "nbformat": 4,
        "nbformat_minor": 5,
        "metadata": {
            "kernelspec": {
                "display_name": "Python 3",
                "language": "python",
                "name": "python3"
            },
            "language_info": { "name": "python" }
        },
        "cells": cells
    })
}

fn markdown_cell(source: &str) -> Value {
    json!({
        "cell_type": "markdown",
        "metadata": {},
        "source": split_lines(source)
    })
}

fn code_cell(source: &str) -> Value {
    json!({
        "cell_type": "code",
        "execution_count": null,
        "metadata": {},
        "outputs": [],
        "source": split_lines(source)
    })
}

/// nbformat stores cell sources as a list of lines with trailing newlines.
fn split_lines(source: &str) -> Vec<String> {
    let mut lines: Vec<String> = source.lines().map(|l| format!("{}\n", l)).collect();
    if let Some(last) = lines.last_mut() {
        if last.ends_with('\n') {
            last.pop();
        }
    }
    lines
}

/// Write both artifacts into the output directory.
pub async fn write_reports(
    state: &ProjectState,
    summary_body: &str,
    output_dir: &Path,
) -> Result<(PathBuf, PathBuf)> {
    let report_path = output_dir.join("final_report.md");
    tokio::fs::write(&report_path, render_report(state, summary_body))
        .await
        .with_context(|| format!("Failed to write {}", report_path.display()))?;
    log_file_saved!(report_path.display());

    let notebook_path = output_dir.join("analysis.ipynb");
    let notebook = serde_json::to_string_pretty(&render_notebook(state))?;
    tokio::fs::write(&notebook_path, notebook)
        .await
        .with_context(|| format!("Failed to write {}", notebook_path.display()))?;
    log_file_saved!(notebook_path.display());

    Ok((report_path, notebook_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Confidence, ExecutionArtifact, Insight, PlanStep, StepCategory};
    use autoanalyst_sdk::{DataProfile, ExecOutcome, ExecRecord};

    fn finished_state() -> ProjectState {
        let mut state = ProjectState::new("demo", DataProfile::default(), 1200, 3);
        let ok = state
            .plan
            .push(PlanStep::new(0, "explore age", StepCategory::Exploration));
        let bad = state
            .plan
            .push(PlanStep::new(0, "model income", StepCategory::Modeling));

        state.claim_step(ok);
        state
            .commit_step(
                ok,
                ExecutionArtifact::from_record(
                    ok,
                    "result = df['age'].mean()".into(),
                    1,
                    ExecRecord {
                        figures: vec!["figure_1.png".into()],
                        outcome: ExecOutcome::Success,
                        ..Default::default()
                    },
                ),
                Insight {
                    step_id: ok,
                    interpretation: "Age is right-skewed.".into(),
                    key_findings: vec!["median age is 41".into()],
                    suggested_next_steps: vec![],
                    confidence: Confidence::High,
                },
            )
            .unwrap();

        state.claim_step(bad);
        state
            .commit_step(
                bad,
                ExecutionArtifact::from_record(
                    bad,
                    "fit_model(df)".into(),
                    3,
                    ExecRecord {
                        stderr: "NameError: fit_model".into(),
                        outcome: ExecOutcome::RuntimeError,
                        ..Default::default()
                    },
                ),
                Insight::not_completed(bad, ExecOutcome::RuntimeError, 3),
            )
            .unwrap();

        state
    }

    #[test]
    fn test_report_contains_findings_and_failures() {
        let state = finished_state();
        let report = render_report(&state, "Everything went fine overall.");
        assert!(report.contains("# Analysis report - demo"));
        assert!(report.contains("median age is 41"));
        assert!(report.contains("figures/figure_1.png"));
        // failed step carries classification and code version
        assert!(report.contains("`runtime-error` at code version 3"));
        assert!(report.contains("NameError: fit_model"));
    }

    #[test]
    fn test_notebook_shape() {
        let state = finished_state();
        let notebook = render_notebook(&state);
        assert_eq!(notebook["nbformat"], 4);
        let cells = notebook["cells"].as_array().unwrap();
        // title + (markdown + code) per executed step
        assert_eq!(cells.len(), 5);
        assert_eq!(cells[1]["cell_type"], "markdown");
        assert_eq!(cells[2]["cell_type"], "code");
        let code_source = cells[2]["source"].as_array().unwrap();
        assert!(code_source[0].as_str().unwrap().contains("df['age']"));
    }

    #[tokio::test]
    async fn test_write_reports_creates_files() {
        let dir = tempfile::tempdir().unwrap();
        let state = finished_state();
        let (report, notebook) = write_reports(&state, "Summary.", dir.path()).await.unwrap();
        assert!(report.exists());
        assert!(notebook.exists());
        let notebook_json: Value =
            serde_json::from_str(&std::fs::read_to_string(notebook).unwrap()).unwrap();
        assert_eq!(notebook_json["nbformat"], 4);
    }
}
