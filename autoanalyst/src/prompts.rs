//! Prompt construction and untrusted-response extraction.
//!
//! Backend responses are plain text until proven otherwise: JSON is dug out
//! of markdown fences, parsed into `serde_json::Value`, and picked apart
//! field by field with safe defaults. Nothing here assumes well-formed
//! output.

use serde_json::Value;

/// The JSON shape plan responses must follow. Repeated in both the initial
/// and revision prompts; models drift without it.
pub const PLAN_FORMAT: &str = r#"{
    "analysis_steps": [
        {
            "description": "string",
            "category": "cleaning | exploration | hypothesis_test | modeling | other",
            "priority": 0,
            "depends_on": [1, 2]
        }
    ]
}"#;

/// Prompt for the initial analysis plan.
pub fn initial_plan(context: &str, max_steps: u64) -> String {
    format!(
        r#"You are planning a data analysis project.

{context}

Generate an analysis plan with up to {max_steps} steps. Each step should be
one discrete analysis: start with data cleaning, then univariate
exploration, then relationships, tests or models as the data supports.
"depends_on" lists the 1-based numbers of steps that must complete first.
Higher "priority" runs earlier.

Provide your response in the following JSON format:
{format}

ONLY RETURN JSON with no other ornamentation."#,
        context = context,
        max_steps = max_steps,
        format = PLAN_FORMAT
    )
}

/// Stricter retry prompt used after a malformed plan response.
pub fn initial_plan_strict(context: &str, max_steps: u64) -> String {
    format!(
        "{}\n\nThe previous response could not be parsed. Return ONLY a JSON \
         object matching the format above - no prose, no markdown fences.",
        initial_plan(context, max_steps)
    )
}

/// Enhancement pass over a freshly parsed plan.
pub fn enhance_plan(context: &str, plan_json: &str) -> String {
    format!(
        r#"Here is a draft analysis plan:

{plan}

{context}

Improve the plan: sharpen vague steps, add analyses that the data profile
supports (relationships between variables, applicable statistical tests,
useful visualizations, preprocessing that later steps need). Return the
complete improved plan, in the same order, in the following JSON format:
{format}

ONLY RETURN JSON with no other ornamentation."#,
        plan = plan_json,
        context = context,
        format = PLAN_FORMAT
    )
}

/// Plan revision after a completed or failed step.
pub fn revise_plan(context: &str) -> String {
    format!(
        r#"{context}

Review the analysis plan given the findings so far. Rules:
1. Never remove or reorder existing steps; only append new ones
2. Append follow-up analyses that the findings suggest
3. Set "obsolete": true on an existing step (by its 1-based number) only if
   the findings make it pointless
4. You may adjust "priority" of steps that have not started

Provide your response in the following JSON format:
{{
    "new_steps": [
        {{
            "description": "string",
            "category": "cleaning | exploration | hypothesis_test | modeling | other",
            "priority": 0,
            "depends_on": [1]
        }}
    ],
    "updates": [
        {{ "step": 1, "priority": 5, "obsolete": false }}
    ]
}}

ONLY RETURN JSON with no other ornamentation."#,
        context = context
    )
}

/// Code generation for one step.
pub fn generate_code(context: &str, data_path: &str, figure_dir: &str) -> String {
    format!(
        r#"Generate Python code for the analysis step described below.

{context}

Guidelines:
1. Load the dataset with: df = pd.read_csv({data_path:?})
2. Use pandas, numpy and matplotlib; seaborn for richer visualizations
3. Save figures into {figure_dir:?} instead of showing them
4. Store the main result or insight in a variable named 'result'
5. Handle missing values and edge cases
6. Do not read or write any other files, spawn processes, or use the network

Provide only the Python code, without any explanations or markdown
formatting."#,
        context = context,
        data_path = data_path,
        figure_dir = figure_dir
    )
}

/// Code repair after a runtime failure.
pub fn repair_code(context: &str, code: &str, error: &str) -> String {
    format!(
        r#"The following Python code failed:

{code}

Error output:
{error}

{context}

Fix the error and return the complete corrected code. Keep the same
analysis intent, keep the 'result' variable, and follow the same
restrictions (no extra file access, no processes, no network).

Provide only the Python code, without any explanations or markdown
formatting."#,
        code = code,
        error = error,
        context = context
    )
}

/// Result interpretation for a successful step.
pub fn interpret_results(context: &str, stdout: &str, result: &str, figure_count: usize) -> String {
    format!(
        r#"An analysis step has completed.

{context}

Captured output:
{stdout}

Result value: {result}

Visualizations generated: {figure_count}

Interpret these results. Respond in exactly this structure:

INTERPRETATION:
<a few sentences of interpretation suitable for a data science report>

KEY FINDINGS:
- <one concise, data-driven finding per line>

NEXT STEPS:
- <one suggested follow-up analysis per line>

CONFIDENCE: <low | medium | high>"#,
        context = context,
        stdout = stdout,
        result = result,
        figure_count = figure_count
    )
}

/// Final summary report over the whole project.
pub fn summary_report(context: &str) -> String {
    format!(
        r#"{context}

Write the final report for this data analysis project in Markdown. Include:
1. An executive summary
2. An overview of the analyses performed
3. A synthesis of the key findings
4. Recommendations for future work

The report should be comprehensive yet concise, suitable for stakeholders."#,
        context = context
    )
}

// ============================================================================
// Response extraction
// ============================================================================

/// Extract the JSON payload from a response, unwrapping markdown fences
/// and leading prose when present.
pub fn extract_json(text: &str) -> &str {
    let text = strip_fence(text, "```json").unwrap_or(text);
    let text = strip_fence(text, "```").unwrap_or(text);
    // fall back to the outermost braces when prose surrounds the object
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => text[start..=end].trim(),
        _ => text.trim(),
    }
}

/// Extract code from a response, unwrapping ```python / ``` fences.
pub fn extract_code(text: &str) -> String {
    let code = strip_fence(text, "```python")
        .or_else(|| strip_fence(text, "```"))
        .unwrap_or(text);
    code.trim().to_string()
}

fn strip_fence<'a>(text: &'a str, opener: &str) -> Option<&'a str> {
    let start = text.find(opener)? + opener.len();
    let end = text[start..].rfind("```").map(|p| p + start)?;
    if end <= start {
        return None;
    }
    Some(text[start..end].trim())
}

/// Parse an extracted JSON payload, reporting a short error with a preview
/// of what failed instead of the full (possibly huge) response.
pub fn parse_json(text: &str) -> Result<Value, String> {
    serde_json::from_str(extract_json(text)).map_err(|e| {
        let preview: String = text.chars().take(120).collect();
        format!("{} (response starts: {:?})", e, preview)
    })
}

/// Collect the "- " bullet lines under a `HEADER:` section of a structured
/// text response.
pub fn section_bullets(text: &str, header: &str) -> Vec<String> {
    let mut bullets = Vec::new();
    let mut in_section = false;
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.eq_ignore_ascii_case(header) {
            in_section = true;
            continue;
        }
        if in_section {
            if let Some(item) = trimmed.strip_prefix("- ") {
                if !item.is_empty() {
                    bullets.push(item.to_string());
                }
            } else if !trimmed.is_empty() {
                // next section began
                break;
            }
        }
    }
    bullets
}

/// The free-text body under a `HEADER:` section, up to the next section.
pub fn section_text(text: &str, header: &str) -> Option<String> {
    let mut body = Vec::new();
    let mut in_section = false;
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.eq_ignore_ascii_case(header) {
            in_section = true;
            continue;
        }
        if in_section {
            if trimmed.ends_with(':') && trimmed.chars().all(|c| !c.is_lowercase()) {
                break;
            }
            body.push(line);
        }
    }
    let body = body.join("\n").trim().to_string();
    if body.is_empty() {
        None
    } else {
        Some(body)
    }
}
