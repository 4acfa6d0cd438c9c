// src/runner/harness.rs
//! Harness plumbing shared by the script runners
//!
//! A run materializes three files in a private scratch workspace (the user
//! module under `function/`, `input.json` and a runtime-specific harness),
//! execs the harness inside the sandbox and turns what came back into an
//! outcome. The user module lives in its own directory and is loaded by
//! path, so no module name can collide with the harness or with a module
//! the interpreter already has loaded.
//!
//! # Result framing
//!
//! The harness prints the handler's return value as one JSON line between a
//! begin and an end marker. Both markers embed a nonce generated per run and
//! handed to the harness on stdin before the user module is loaded, so user
//! code can print anything (including text that looks like a marker) without
//! being mistaken for the result. Everything outside the block is log text.
//! The block is captured whole regardless of the output limit; a result too
//! large to capture fails the execution.

use crate::isolation::{ExecOutput, ExecRequest};
use crate::runner::{Invocation, SandboxSession};
use crate::runtime::outcome::{ExecutionOutcome, NO_EXIT_CODE};
use crate::runtime::process_manager::{OutputLine, OutputStream, ResultFrame};
use crate::utils::errors::{EngineError, Result};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, warn};

pub const INPUT_FILE: &str = "input.json";
pub const MODULE_DIR: &str = "function";
pub const MODULE_ENV: &str = "VOLTRUN_MODULE";
pub const HANDLER_ENV: &str = "VOLTRUN_HANDLER";

/// Per-run result markers
#[derive(Debug, Clone)]
pub struct Sentinel {
    nonce: String,
}

impl Sentinel {
    pub fn generate() -> Self {
        Self::from_nonce(ulid::Ulid::new().to_string())
    }

    pub fn from_nonce(nonce: impl Into<String>) -> Self {
        Self { nonce: nonce.into() }
    }

    pub fn begin(&self) -> String {
        format!("__VOLTRUN_RESULT_BEGIN_{}__", self.nonce)
    }

    pub fn end(&self) -> String {
        format!("__VOLTRUN_RESULT_END_{}__", self.nonce)
    }

    /// What the harness writes on stdout for a result
    pub fn frame(&self, json: &str) -> String {
        format!("{}\n{}\n{}", self.begin(), json, self.end())
    }

    pub fn result_frame(&self) -> ResultFrame {
        ResultFrame {
            begin: self.begin(),
            end: self.end(),
        }
    }

    /// First line the harness reads from stdin
    pub fn stdin_payload(&self) -> Vec<u8> {
        format!("{}\n", self.nonce).into_bytes()
    }
}

/// Captured output split into the framed result and the log text
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub result: Option<String>,
    pub logs: String,
}

/// Pull the last complete result block out of the captured lines.
///
/// Only stdout lines that equal a marker exactly count. The block and a
/// blank stdout line directly before it (the harness emits one so the
/// marker starts on its own line) are removed from the logs.
pub fn extract(sentinel: &Sentinel, lines: &[OutputLine]) -> Extracted {
    let begin = sentinel.begin();
    let end = sentinel.end();

    let mut open: Option<usize> = None;
    let mut block: Option<(usize, usize)> = None;
    for (i, line) in lines.iter().enumerate() {
        if line.stream != OutputStream::Stdout {
            continue;
        }
        if line.text == begin {
            open = Some(i);
        } else if line.text == end {
            if let Some(start) = open.take() {
                block = Some((start, i));
            }
        }
    }

    let Some((start, stop)) = block else {
        return Extracted {
            result: None,
            logs: join_lines(lines.iter()),
        };
    };

    let result = lines[start + 1..stop]
        .iter()
        .filter(|l| l.stream == OutputStream::Stdout)
        .map(|l| l.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    let padding = lines[..start]
        .iter()
        .rposition(|l| l.stream == OutputStream::Stdout)
        .filter(|&i| lines[i].text.is_empty());

    let logs = join_lines(lines.iter().enumerate().filter_map(|(i, line)| {
        let in_block = (start..=stop).contains(&i) && line.stream == OutputStream::Stdout;
        (!in_block && Some(i) != padding).then_some(line)
    }));

    Extracted {
        result: Some(result),
        logs,
    }
}

fn join_lines<'a>(lines: impl Iterator<Item = &'a OutputLine>) -> String {
    lines.map(|l| l.text.as_str()).collect::<Vec<_>>().join("\n")
}

/// Output value for a framed result: objects as-is, other JSON values and
/// unparseable text wrapped under `result`
pub fn parse_output(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw.trim()) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(other) => json!({ "result": other }),
        Err(_) => json!({ "result": raw }),
    }
}

/// Turn a finished exec into a terminal outcome
pub fn interpret(
    output: &ExecOutput,
    sentinel: &Sentinel,
    deadline: Duration,
) -> ExecutionOutcome {
    let extracted = extract(sentinel, &output.lines);

    if output.timed_out {
        return ExecutionOutcome::timeout(deadline.as_secs_f64(), extracted.logs);
    }

    if output.exit_code != 0 {
        let stderr = output.stderr.trim();
        let error = if stderr.is_empty() {
            format!("process exited with code {}", output.exit_code)
        } else {
            stderr.to_string()
        };
        return ExecutionOutcome::failed(error, extracted.logs, output.exit_code);
    }

    if output.frame_truncated {
        return ExecutionOutcome::failed(
            "output exceeded capture limit: result was too large to collect",
            extracted.logs,
            output.exit_code,
        );
    }

    match extracted.result {
        Some(raw) => ExecutionOutcome::success(parse_output(&raw), extracted.logs, 0),
        None => ExecutionOutcome::completed_without_output(extracted.logs),
    }
}

/// Exclusively-owned scratch directory, removed when closed or dropped
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn create(root: &Path, prefix: &str) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(root)
            .map_err(|e| {
                EngineError::Workspace(format!("Failed to create workspace in {:?}: {}", root, e))
            })?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `name` (a path relative to the workspace), creating parent
    /// directories as needed
    pub async fn write(&self, name: &str, contents: impl AsRef<[u8]>) -> Result<PathBuf> {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                EngineError::Workspace(format!("Failed to create {:?}: {}", parent, e))
            })?;
        }
        tokio::fs::write(&path, contents).await.map_err(|e| {
            EngineError::Workspace(format!("Failed to write {}: {}", name, e))
        })?;
        Ok(path)
    }

    /// Remove the directory, logging instead of failing
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!("Failed to remove workspace {:?}: {}", path, e);
        }
    }
}

/// How a script runtime is wired into the harness
#[derive(Debug, Clone)]
pub struct HarnessSpec {
    pub runtime: &'static str,

    /// Interpreter binary
    pub program: String,

    /// Interpreter arguments placed before the harness file
    pub args: Vec<String>,

    /// Extension of the user module file
    pub extension: &'static str,

    pub harness_file: &'static str,
    pub harness_source: &'static str,

    pub env: Vec<(String, String)>,
}

/// Run `invocation` through a harness in a fresh workspace under `scratch_root`.
///
/// The workspace is removed on every path out of this function.
pub async fn run_harness(
    spec: &HarnessSpec,
    scratch_root: &Path,
    session: &SandboxSession<'_>,
    invocation: Invocation<'_>,
) -> ExecutionOutcome {
    let workspace = match Workspace::create(scratch_root, &format!("voltrun-{}-", spec.runtime)) {
        Ok(workspace) => workspace,
        Err(e) => return ExecutionOutcome::failed(e.to_string(), String::new(), NO_EXIT_CODE),
    };
    debug!("{} workspace at {:?}", spec.runtime, workspace.path());

    let outcome = match run_in_workspace(spec, &workspace, session, invocation).await {
        Ok(outcome) => outcome,
        Err(e) => ExecutionOutcome::failed(e.to_string(), String::new(), NO_EXIT_CODE),
    };

    workspace.close();
    outcome
}

async fn run_in_workspace(
    spec: &HarnessSpec,
    workspace: &Workspace,
    session: &SandboxSession<'_>,
    invocation: Invocation<'_>,
) -> Result<ExecutionOutcome> {
    let entry = invocation.entry_point;
    let input = serde_json::to_vec(invocation.input)
        .map_err(|e| EngineError::Workspace(format!("Failed to encode input: {}", e)))?;

    workspace
        .write(
            &format!("{}/{}.{}", MODULE_DIR, entry.module, spec.extension),
            invocation.code,
        )
        .await?;
    workspace.write(INPUT_FILE, input).await?;
    workspace.write(spec.harness_file, spec.harness_source).await?;

    let sentinel = Sentinel::generate();

    let mut env = spec.env.clone();
    env.push((MODULE_ENV.to_string(), entry.module.clone()));
    env.push((HANDLER_ENV.to_string(), entry.function.clone()));

    let mut args = spec.args.clone();
    args.push(spec.harness_file.to_string());

    let request = ExecRequest {
        program: spec.program.clone(),
        args,
        working_dir: workspace.path().to_path_buf(),
        env,
        stdin: Some(sentinel.stdin_payload()),
        deadline: invocation.deadline,
        result_frame: Some(sentinel.result_frame()),
    };

    let output = session.exec(request).await?;
    if output.truncated {
        debug!("{} output hit the capture limit", spec.runtime);
    }
    Ok(interpret(&output, &sentinel, invocation.deadline))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::testing::{exec_output, MockBackend};
    use crate::isolation::{IsolationManager, ProcessBackend};
    use crate::runtime::function::EntryPoint;
    use crate::runtime::outcome::ExecutionStatus;
    use crate::runtime::process_manager::ProcessManager;
    use crate::runtime::resource_limiter::ResourceSpec;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn out(text: &str) -> OutputLine {
        OutputLine {
            stream: OutputStream::Stdout,
            text: text.to_string(),
        }
    }

    fn err(text: &str) -> OutputLine {
        OutputLine {
            stream: OutputStream::Stderr,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_extract_block_and_logs() {
        let s = Sentinel::from_nonce("n1");
        let lines = vec![
            out("before"),
            err("warning"),
            out(""),
            out(&s.begin()),
            out(r#"{"echo":42}"#),
            out(&s.end()),
            out("after"),
        ];

        let extracted = extract(&s, &lines);
        assert_eq!(extracted.result.as_deref(), Some(r#"{"echo":42}"#));
        assert_eq!(extracted.logs, "before\nwarning\nafter");
    }

    #[test]
    fn test_forged_markers_ignored() {
        let real = Sentinel::from_nonce("real");
        let forged = Sentinel::from_nonce("guess");
        let lines = vec![
            out(&forged.begin()),
            out(r#"{"pwned":true}"#),
            out(&forged.end()),
            out(&real.begin()),
            out(r#"{"ok":true}"#),
            out(&real.end()),
        ];

        let extracted = extract(&real, &lines);
        assert_eq!(extracted.result.as_deref(), Some(r#"{"ok":true}"#));
        assert!(extracted.logs.contains("pwned"));
    }

    #[test]
    fn test_marker_on_stderr_or_inline_ignored() {
        let s = Sentinel::from_nonce("n");
        let lines = vec![
            err(&s.begin()),
            out(&format!("prefix {}", s.begin())),
            out("{}"),
            out(&s.end()),
        ];
        assert!(extract(&s, &lines).result.is_none());
    }

    #[test]
    fn test_unterminated_block_is_not_a_result() {
        let s = Sentinel::from_nonce("n");
        let lines = vec![out(&s.begin()), out("{\"a\":1}")];
        let extracted = extract(&s, &lines);
        assert!(extracted.result.is_none());
        assert_eq!(extracted.logs.lines().count(), 2);
    }

    #[test]
    fn test_parse_output() {
        assert_eq!(parse_output(r#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(parse_output("42"), json!({"result": 42}));
        assert_eq!(parse_output("null"), json!({"result": null}));
        assert_eq!(parse_output("not json"), json!({"result": "not json"}));
    }

    #[test]
    fn test_interpret_success() {
        let s = Sentinel::from_nonce("n");
        let stdout = format!("hello\n{}", s.frame(r#"{"echo":42}"#));
        let outcome = interpret(&exec_output(&stdout, "", 0), &s, Duration::from_secs(5));

        assert_eq!(outcome.status, ExecutionStatus::Success);
        assert_eq!(outcome.output, Some(json!({"echo": 42})));
        assert_eq!(outcome.logs, "hello");
        assert_eq!(outcome.exit_code, 0);
    }

    #[test]
    fn test_interpret_zero_exit_without_block() {
        let s = Sentinel::from_nonce("n");
        let outcome = interpret(&exec_output("just logs", "", 0), &s, Duration::from_secs(5));
        assert_eq!(outcome.status, ExecutionStatus::Success);
        assert_eq!(outcome.output, Some(json!({"message": "Execution completed"})));
    }

    #[test]
    fn test_interpret_failure_uses_stderr() {
        let s = Sentinel::from_nonce("n");
        let outcome = interpret(
            &exec_output("partial", "Error: boom\n    at handler", 1),
            &s,
            Duration::from_secs(5),
        );
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("Error: boom\n    at handler"));
        assert!(outcome.output.is_none());
        assert_eq!(outcome.exit_code, 1);
    }

    #[test]
    fn test_interpret_failure_without_stderr() {
        let s = Sentinel::from_nonce("n");
        let outcome = interpret(&exec_output("", "", 137), &s, Duration::from_secs(5));
        assert_eq!(outcome.error.as_deref(), Some("process exited with code 137"));
    }

    #[test]
    fn test_interpret_timeout_keeps_logs() {
        let s = Sentinel::from_nonce("n");
        let output = ExecOutput {
            timed_out: true,
            exit_code: -1,
            ..exec_output("tick", "", -1)
        };
        let outcome = interpret(&output, &s, Duration::from_secs(1));
        assert_eq!(outcome.status, ExecutionStatus::Timeout);
        assert_eq!(outcome.logs, "tick");
        assert_eq!(outcome.exit_code, -1);
    }

    #[test]
    fn test_interpret_truncated_frame_is_failure() {
        let s = Sentinel::from_nonce("n");
        let output = ExecOutput {
            truncated: true,
            frame_truncated: true,
            ..exec_output(&format!("{}\n{}", s.begin(), s.end()), "", 0)
        };
        let outcome = interpret(&output, &s, Duration::from_secs(5));
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert!(outcome.error.unwrap().contains("capture limit"));
        assert!(outcome.output.is_none());
    }

    const CHATTY_HARNESS: &str = r#"read nonce
i=0
while [ $i -lt 100 ]; do echo "log line $i"; i=$((i+1)); done
echo
echo "__VOLTRUN_RESULT_BEGIN_${nonce}__"
echo '{"answer":42}'
echo "__VOLTRUN_RESULT_END_${nonce}__"
"#;

    const HUGE_RESULT_HARNESS: &str = r#"read nonce
echo "__VOLTRUN_RESULT_BEGIN_${nonce}__"
printf '{"blob":"'; head -c 4096 /dev/zero | tr '\0' y; printf '"}\n'
echo "__VOLTRUN_RESULT_END_${nonce}__"
"#;

    /// Run a shell script as the harness under a small capture limit
    async fn run_shell_harness(
        source: &'static str,
        max_output_bytes: usize,
    ) -> ExecutionOutcome {
        let scratch = tempfile::tempdir().unwrap();
        let processes = ProcessManager::new(Duration::from_millis(100), max_output_bytes);
        let manager = IsolationManager::new(Arc::new(ProcessBackend::new(Arc::new(processes))));
        let handle = manager
            .acquire(ResourceSpec {
                memory_mb: 128,
                cpu_share: 1.0,
                timeout_secs: 5,
            })
            .await
            .unwrap();

        let spec = HarnessSpec {
            runtime: "sh",
            program: "sh".to_string(),
            args: vec![],
            extension: "sh",
            harness_file: "harness.sh",
            harness_source: source,
            env: vec![],
        };
        let entry = EntryPoint::parse("index.handler").unwrap();
        let outcome = run_harness(
            &spec,
            scratch.path(),
            &SandboxSession::new(&manager, &handle),
            Invocation {
                code: "",
                entry_point: &entry,
                input: &json!({}),
                deadline: Duration::from_secs(5),
            },
        )
        .await;

        manager.release(&handle).await.unwrap();
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
        outcome
    }

    #[tokio::test]
    async fn test_result_survives_output_cap() {
        let outcome = run_shell_harness(CHATTY_HARNESS, 256).await;

        assert_eq!(outcome.status, ExecutionStatus::Success, "{:?}", outcome);
        assert_eq!(outcome.output, Some(json!({ "answer": 42 })));
        assert!(outcome.logs.starts_with("log line 0"));
        assert!(!outcome.logs.contains("log line 99"));
    }

    #[tokio::test]
    async fn test_result_over_cap_fails() {
        let outcome = run_shell_harness(HUGE_RESULT_HARNESS, 256).await;

        assert_eq!(outcome.status, ExecutionStatus::Failed, "{:?}", outcome);
        assert!(outcome.error.unwrap().contains("capture limit"));
        assert!(outcome.output.is_none());
    }

    #[tokio::test]
    async fn test_user_module_written_under_module_dir() {
        let scratch = tempfile::tempdir().unwrap();
        let backend = MockBackend::new().with_exec(|request| {
            let module = request.working_dir.join(MODULE_DIR).join("json.py");
            assert!(module.exists());
            assert!(request.working_dir.join("harness.py").exists());
            Ok(exec_output("", "", 0))
        });
        let manager = IsolationManager::new(Arc::new(backend));
        let handle = manager
            .acquire(ResourceSpec {
                memory_mb: 128,
                cpu_share: 1.0,
                timeout_secs: 5,
            })
            .await
            .unwrap();

        let spec = HarnessSpec {
            runtime: "python",
            program: "python3".to_string(),
            args: vec![],
            extension: "py",
            harness_file: "harness.py",
            harness_source: "",
            env: vec![],
        };
        let entry = EntryPoint::parse("json.handler").unwrap();
        let outcome = run_harness(
            &spec,
            scratch.path(),
            &SandboxSession::new(&manager, &handle),
            Invocation {
                code: "def handler(e): return e",
                entry_point: &entry,
                input: &json!({}),
                deadline: Duration::from_secs(5),
            },
        )
        .await;
        assert_eq!(outcome.status, ExecutionStatus::Success, "{:?}", outcome);
    }

    #[tokio::test]
    async fn test_workspace_removed_on_close() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path(), "voltrun-test-").unwrap();
        let file = workspace.write("index.js", "module.exports = {}").await.unwrap();
        assert!(file.exists());

        let path = workspace.path().to_path_buf();
        workspace.close();
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    proptest! {
        #[test]
        fn prop_user_output_never_becomes_result(
            user_lines in proptest::collection::vec("[ -~]{0,40}", 0..20),
            payload in "[a-z0-9]{1,12}",
        ) {
            let s = Sentinel::generate();
            let mut lines: Vec<OutputLine> = user_lines.iter().map(|l| out(l)).collect();
            let json = format!("{{\"v\":\"{}\"}}", payload);
            lines.push(out(&s.begin()));
            lines.push(out(&json));
            lines.push(out(&s.end()));
            lines.extend(user_lines.iter().map(|l| err(l)));

            let extracted = extract(&s, &lines);
            prop_assert_eq!(extracted.result, Some(json));
            prop_assert!(!extracted.logs.contains(&s.begin()));
        }
    }
}
