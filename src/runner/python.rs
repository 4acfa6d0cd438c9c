// src/runner/python.rs
//! Python runner
//!
//! The user module is imported from the workspace; coroutine handlers are
//! driven with `asyncio.run`.

use crate::runner::harness::{self, HarnessSpec};
use crate::runner::{Invocation, Runner, SandboxSession};
use crate::runtime::outcome::ExecutionOutcome;
use async_trait::async_trait;
use std::path::PathBuf;

pub const RUNTIME: &str = "python";
pub const HARNESS_FILE: &str = "__voltrun_harness.py";

const HARNESS_SOURCE: &str = r#"import asyncio
import importlib.util
import inspect
import json
import os
import sys
import traceback

_stdout = sys.stdout
_nonce = sys.stdin.readline().strip()
_BEGIN = "__VOLTRUN_RESULT_BEGIN_%s__" % _nonce
_END = "__VOLTRUN_RESULT_END_%s__" % _nonce
_MODULE = os.environ.pop("VOLTRUN_MODULE")
_HANDLER = os.environ.pop("VOLTRUN_HANDLER")
_HERE = os.path.dirname(os.path.abspath(__file__))


def _main():
    with open(os.path.join(_HERE, "input.json"), "r") as f:
        event = json.load(f)

    # Loaded by path under a private name: a user module called json or os
    # must not resolve to the stdlib one
    name = "_voltrun_user_" + _MODULE
    path = os.path.join(_HERE, "function", _MODULE + ".py")
    spec = importlib.util.spec_from_file_location(name, path)
    module = importlib.util.module_from_spec(spec)
    sys.modules[name] = module
    spec.loader.exec_module(module)
    handler = getattr(module, _HANDLER, None)
    if not callable(handler):
        raise AttributeError("Handler %r is not defined in %s.py" % (_HANDLER, _MODULE))

    result = handler(event)
    if inspect.iscoroutine(result):
        result = asyncio.run(result)

    payload = json.dumps(result)
    sys.stdout.flush()
    sys.stderr.flush()
    _stdout.write("\n%s\n%s\n%s\n" % (_BEGIN, payload, _END))
    _stdout.flush()


if __name__ == "__main__":
    try:
        _main()
    except Exception:
        traceback.print_exc(file=sys.stderr)
        sys.stderr.flush()
        sys.exit(1)
"#;

pub struct PythonRunner {
    binary: String,
    scratch_root: PathBuf,
}

impl PythonRunner {
    pub fn new(binary: impl Into<String>, scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            scratch_root: scratch_root.into(),
        }
    }

    fn harness(&self) -> HarnessSpec {
        HarnessSpec {
            runtime: RUNTIME,
            program: self.binary.clone(),
            // Unbuffered, so stdout and stderr interleave in real order
            args: vec!["-u".to_string()],
            extension: "py",
            harness_file: HARNESS_FILE,
            harness_source: HARNESS_SOURCE,
            env: vec![
                ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
                ("PYTHONIOENCODING".to_string(), "utf-8".to_string()),
            ],
        }
    }
}

#[async_trait]
impl Runner for PythonRunner {
    fn runtime(&self) -> &'static str {
        RUNTIME
    }

    async fn run(
        &self,
        session: &SandboxSession<'_>,
        invocation: Invocation<'_>,
    ) -> ExecutionOutcome {
        harness::run_harness(&self.harness(), &self.scratch_root, session, invocation).await
    }
}
