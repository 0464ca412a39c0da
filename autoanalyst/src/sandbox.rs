//! Sandboxed execution of generated analysis code.
//!
//! Generated Python runs as a subprocess under a wall-clock timeout and a
//! restricted capability set. Enforcement is two-layered: a static policy
//! pass rejects code before it ever starts (disallowed operations, imports
//! outside the allow-list, paths outside the output directory), and the
//! process itself is killed when the timeout expires. Partial side effects
//! of a failed run are discarded so later steps never read inconsistent
//! artifacts.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use autoanalyst_sdk::{DatasetHandle, ExecLimits, ExecOutcome, ExecRecord, StepRunner};
use tokio::process::Command;
use uuid::Uuid;

/// Operations generated code may never perform, whatever the imports say.
/// Substring matching, the same discipline the original applies: crude but
/// it fails closed.
const FORBIDDEN: &[&str] = &[
    "subprocess",
    "os.system",
    "os.popen",
    "os.exec",
    "os.spawn",
    "os.remove",
    "os.rmdir",
    "shutil",
    "socket",
    "urllib",
    "http.client",
    "requests.",
    "eval(",
    "exec(",
    "__import__",
    "importlib",
    "open(",
    "compile(",
    "globals(",
    "input(",
];

/// Why a script was rejected before execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyViolation {
    pub reason: String,
}

impl std::fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Static policy pass over generated code. `allowed_paths` are the
/// absolute paths the code is expected to mention (the dataset, the output
/// directory); any other absolute path literal is an escape attempt.
pub fn check_policy(
    code: &str,
    allowed_imports: &[String],
    allowed_paths: &[&Path],
) -> Result<(), PolicyViolation> {
    for token in FORBIDDEN {
        if code.contains(token) {
            return Err(PolicyViolation {
                reason: format!("disallowed operation: {}", token),
            });
        }
    }

    for line in code.lines() {
        let trimmed = line.trim();
        let root = if let Some(rest) = trimmed.strip_prefix("import ") {
            Some(rest)
        } else {
            trimmed.strip_prefix("from ")
        };
        if let Some(rest) = root {
            let module = rest
                .split(|c: char| c.is_whitespace() || c == '.' || c == ',' || c == ';')
                .next()
                .unwrap_or("");
            if !module.is_empty() && !allowed_imports.iter().any(|a| a == module) {
                return Err(PolicyViolation {
                    reason: format!("import outside allow-list: {}", module),
                });
            }
        }
    }

    for literal in string_literals(code) {
        let escapes_relative = literal.contains("..");
        let is_absolute = literal.starts_with('/') || literal.contains(":\\");
        if (is_absolute || escapes_relative)
            && !allowed_paths
                .iter()
                .any(|allowed| literal.starts_with(&*allowed.to_string_lossy()))
        {
            return Err(PolicyViolation {
                reason: format!("path outside output directory: {}", literal),
            });
        }
    }

    Ok(())
}

/// Quoted string literals in the code, both quote styles. Good enough for
/// path policing; escaped quotes inside literals are not worth handling.
fn string_literals(code: &str) -> Vec<String> {
    let mut out = Vec::new();
    for quote in ['"', '\''] {
        let mut rest = code;
        while let Some(start) = rest.find(quote) {
            let after = &rest[start + 1..];
            match after.find(quote) {
                Some(end) => {
                    out.push(after[..end].to_string());
                    rest = &after[end + 1..];
                }
                None => break,
            }
        }
    }
    out
}

/// The harness wrapped around generated code: a preamble that pins the
/// plotting backend, and an epilogue that serializes the `result` variable
/// and flushes any open figures into the figure directory.
fn wrap_code(code: &str, figure_dir: &Path, result_path: &Path) -> String {
    format!(
        r#"import json as _aa_json
try:
    import matplotlib
    matplotlib.use("Agg")
except Exception:
    pass

{code}

try:
    _aa_payload = _aa_json.dumps({{"result": globals().get("result")}})
except TypeError:
    _aa_payload = _aa_json.dumps({{"result": repr(globals().get("result"))}})
_aa_out = open(r"{result_path}", "w")
_aa_out.write(_aa_payload)
_aa_out.close()
try:
    import matplotlib.pyplot as _aa_plt
    for _aa_i in _aa_plt.get_fignums():
        _aa_plt.figure(_aa_i).savefig(r"{figure_dir}/figure_{{}}.png".format(_aa_i))
    _aa_plt.close("all")
except Exception:
    pass
"#,
        code = code,
        result_path = result_path.display(),
        figure_dir = figure_dir.display(),
    )
}

/// Runs generated code as a python subprocess with enforced limits.
pub struct ExecutionSandbox {
    python_bin: PathBuf,
}

impl ExecutionSandbox {
    /// Resolve the interpreter on PATH. `python3` preferred, `python`
    /// accepted.
    pub fn new() -> Result<Self> {
        let python_bin = which::which("python3")
            .or_else(|_| which::which("python"))
            .context("no python interpreter found on PATH")?;
        Ok(Self { python_bin })
    }

    /// Use a specific interpreter (tests, unusual installs).
    pub fn with_interpreter(python_bin: PathBuf) -> Self {
        Self { python_bin }
    }

    async fn run_inner(
        &self,
        code: &str,
        dataset: &DatasetHandle,
        limits: &ExecLimits,
    ) -> Result<ExecRecord> {
        let figure_dir = dataset.output_dir.join("figures");
        tokio::fs::create_dir_all(&figure_dir).await?;

        // Static policy pass before anything touches the filesystem
        let allowed_paths = [dataset.data_path.as_path(), dataset.output_dir.as_path()];
        if let Err(violation) = check_policy(code, &limits.allowed_imports, &allowed_paths) {
            return Ok(ExecRecord {
                stderr: violation.to_string(),
                outcome: ExecOutcome::PolicyViolation,
                ..Default::default()
            });
        }

        // Per-run scratch directory under the output dir
        let scratch = dataset.output_dir.join("runs").join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&scratch).await?;
        let script_path = scratch.join("run.py");
        let result_path = scratch.join("result.json");
        tokio::fs::write(&script_path, wrap_code(code, &figure_dir, &result_path)).await?;

        let figures_before = list_dir(&figure_dir).await?;
        let started = Instant::now();

        let mut command = Command::new(&self.python_bin);
        command
            .arg(&script_path)
            .current_dir(&dataset.output_dir)
            .env_remove("PYTHONSTARTUP")
            .kill_on_drop(true);

        let output = tokio::time::timeout(
            Duration::from_secs(limits.timeout_secs),
            command.output(),
        )
        .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let record = match output {
            Err(_) => {
                // timed out; kill_on_drop reaped the process
                self.discard_partial(&figure_dir, &figures_before).await;
                ExecRecord {
                    stderr: format!("execution exceeded {}s limit", limits.timeout_secs),
                    duration_ms,
                    outcome: ExecOutcome::Timeout,
                    ..Default::default()
                }
            }
            Ok(Err(e)) => {
                self.discard_partial(&figure_dir, &figures_before).await;
                ExecRecord {
                    stderr: format!("failed to launch interpreter: {}", e),
                    duration_ms,
                    outcome: ExecOutcome::RuntimeError,
                    ..Default::default()
                }
            }
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                if output.status.success() {
                    let result_value = read_result(&result_path).await;
                    let figures_after = list_dir(&figure_dir).await?;
                    let figures: Vec<String> = figures_after
                        .difference(&figures_before)
                        .cloned()
                        .collect();
                    ExecRecord {
                        stdout,
                        stderr,
                        result_value,
                        figures,
                        duration_ms,
                        outcome: ExecOutcome::Success,
                    }
                } else {
                    self.discard_partial(&figure_dir, &figures_before).await;
                    ExecRecord {
                        stdout,
                        stderr,
                        duration_ms,
                        outcome: ExecOutcome::RuntimeError,
                        ..Default::default()
                    }
                }
            }
        };

        let _ = tokio::fs::remove_dir_all(&scratch).await;
        Ok(record)
    }

    /// Remove figures a failed run managed to write, so later steps never
    /// see half-finished artifacts.
    async fn discard_partial(&self, figure_dir: &Path, before: &HashSet<String>) {
        if let Ok(after) = list_dir(figure_dir).await {
            for name in after.difference(before) {
                let _ = tokio::fs::remove_file(figure_dir.join(name)).await;
            }
        }
    }
}

async fn list_dir(dir: &Path) -> Result<HashSet<String>> {
    let mut names = HashSet::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        names.insert(entry.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}

async fn read_result(path: &Path) -> Option<serde_json::Value> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    let parsed: serde_json::Value = serde_json::from_str(&content).ok()?;
    parsed.get("result").cloned()
}

#[autoanalyst_sdk::async_trait]
impl StepRunner for ExecutionSandbox {
    async fn run(
        &self,
        code: &str,
        dataset: &DatasetHandle,
        limits: &ExecLimits,
    ) -> Result<ExecRecord> {
        self.run_inner(code, dataset, limits).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_allowed_imports;

    fn allowed() -> Vec<String> {
        default_allowed_imports()
    }

    #[test]
    fn test_policy_accepts_ordinary_analysis() {
        let code = "import pandas as pd\nimport numpy as np\nresult = 1\n";
        assert!(check_policy(code, &allowed(), &[]).is_ok());
    }

    #[test]
    fn test_policy_rejects_process_spawning() {
        let code = "import subprocess\nsubprocess.run(['ls'])\n";
        let err = check_policy(code, &allowed(), &[]).unwrap_err();
        assert!(err.reason.contains("subprocess"));
    }

    #[test]
    fn test_policy_rejects_network() {
        let code = "from socket import create_connection\n";
        assert!(check_policy(code, &allowed(), &[]).is_err());
    }

    #[test]
    fn test_policy_rejects_unlisted_import() {
        let code = "import ctypes\n";
        let err = check_policy(code, &allowed(), &[]).unwrap_err();
        assert!(err.reason.contains("ctypes"));
    }

    #[test]
    fn test_policy_rejects_escaping_path() {
        let output = Path::new("/work/output");
        let code = "df.to_csv('/etc/passwd')\n";
        let err = check_policy(code, &allowed(), &[output]).unwrap_err();
        assert!(err.reason.contains("/etc/passwd"));
    }

    #[test]
    fn test_policy_rejects_dotdot_path() {
        let output = Path::new("/work/output");
        let code = "df.to_csv('../outside.csv')\n";
        assert!(check_policy(code, &allowed(), &[output]).is_err());
    }

    #[test]
    fn test_policy_allows_output_and_dataset_paths() {
        let data = Path::new("/work/data.csv");
        let output = Path::new("/work/output");
        let code = "df = pd.read_csv('/work/data.csv')\nplt.savefig('/work/output/figures/a.png')\n";
        assert!(check_policy(code, &allowed(), &[data, output]).is_ok());
    }

    #[test]
    fn test_wrap_code_serializes_result() {
        let wrapped = wrap_code(
            "result = 42",
            Path::new("/out/figures"),
            Path::new("/out/runs/x/result.json"),
        );
        assert!(wrapped.contains("result = 42"));
        assert!(wrapped.contains("result.json"));
        assert!(wrapped.contains("matplotlib.use(\"Agg\")"));
    }

    fn python() -> Option<PathBuf> {
        which::which("python3").or_else(|_| which::which("python")).ok()
    }

    fn limits() -> ExecLimits {
        ExecLimits {
            timeout_secs: 20,
            allowed_imports: allowed(),
        }
    }

    #[tokio::test]
    async fn test_run_captures_result_and_stdout() {
        let Some(python_bin) = python() else { return };
        let tmp = tempfile::tempdir().unwrap();
        let dataset = DatasetHandle {
            data_path: tmp.path().join("data.csv"),
            output_dir: tmp.path().join("output"),
        };
        let sandbox = ExecutionSandbox::with_interpreter(python_bin);

        let record = sandbox
            .run("print('hello')\nresult = 40 + 2\n", &dataset, &limits())
            .await
            .unwrap();
        assert_eq!(record.outcome, ExecOutcome::Success);
        assert!(record.stdout.contains("hello"));
        assert_eq!(record.result_value, Some(serde_json::json!(42)));
    }

    #[tokio::test]
    async fn test_run_classifies_runtime_error() {
        let Some(python_bin) = python() else { return };
        let tmp = tempfile::tempdir().unwrap();
        let dataset = DatasetHandle {
            data_path: tmp.path().join("data.csv"),
            output_dir: tmp.path().join("output"),
        };
        let sandbox = ExecutionSandbox::with_interpreter(python_bin);

        let record = sandbox
            .run("raise ValueError('boom')\n", &dataset, &limits())
            .await
            .unwrap();
        assert_eq!(record.outcome, ExecOutcome::RuntimeError);
        assert!(record.stderr.contains("boom"));
    }

    #[tokio::test]
    async fn test_run_enforces_timeout() {
        let Some(python_bin) = python() else { return };
        let tmp = tempfile::tempdir().unwrap();
        let dataset = DatasetHandle {
            data_path: tmp.path().join("data.csv"),
            output_dir: tmp.path().join("output"),
        };
        let sandbox = ExecutionSandbox::with_interpreter(python_bin);

        let mut limits = limits();
        limits.timeout_secs = 1;
        let record = sandbox
            .run(
                "import itertools\nfor _ in itertools.count():\n    pass\n",
                &dataset,
                &limits,
            )
            .await
            .unwrap();
        assert_eq!(record.outcome, ExecOutcome::Timeout);
    }

    #[tokio::test]
    async fn test_policy_violation_never_executes() {
        // no interpreter needed: the run must stop before launching one
        let tmp = tempfile::tempdir().unwrap();
        let dataset = DatasetHandle {
            data_path: tmp.path().join("data.csv"),
            output_dir: tmp.path().join("output"),
        };
        let sandbox = ExecutionSandbox::with_interpreter(PathBuf::from("/nonexistent/python"));

        let record = sandbox
            .run("open('/tmp/evil.txt', 'w').write('x')\n", &dataset, &limits())
            .await
            .unwrap();
        assert_eq!(record.outcome, ExecOutcome::PolicyViolation);
        assert!(!Path::new("/tmp/evil.txt").exists());
        // nothing was created outside the output directory; the output dir
        // itself holds at most the figures folder
        assert!(!dataset.output_dir.join("runs").exists() || {
            let mut entries = std::fs::read_dir(dataset.output_dir.join("runs")).unwrap();
            entries.next().is_none()
        });
    }
}
