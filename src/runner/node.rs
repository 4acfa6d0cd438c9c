// src/runner/node.rs
//! Node.js runner
//!
//! The user module is loaded with `require`, so handlers are exported the
//! CommonJS way (`exports.handler = async (event) => ...`). Promises are
//! awaited.

use crate::runner::harness::{self, HarnessSpec};
use crate::runner::{Invocation, Runner, SandboxSession};
use crate::runtime::outcome::ExecutionOutcome;
use async_trait::async_trait;
use std::path::PathBuf;

pub const RUNTIME: &str = "nodejs";
pub const HARNESS_FILE: &str = "__voltrun_harness.js";

const HARNESS_SOURCE: &str = r#"'use strict';
const fs = require('fs');
const path = require('path');

const writeOut = process.stdout.write.bind(process.stdout);
const nonce = fs.readFileSync(0, 'utf8').split('\n')[0].trim();
const begin = `__VOLTRUN_RESULT_BEGIN_${nonce}__`;
const end = `__VOLTRUN_RESULT_END_${nonce}__`;

const moduleName = process.env.VOLTRUN_MODULE;
const handlerName = process.env.VOLTRUN_HANDLER;
delete process.env.VOLTRUN_MODULE;
delete process.env.VOLTRUN_HANDLER;

(async () => {
  try {
    const input = JSON.parse(fs.readFileSync(path.join(__dirname, 'input.json'), 'utf8'));
    const mod = require(path.join(__dirname, 'function', `${moduleName}.js`));
    const handler = mod[handlerName];
    if (typeof handler !== 'function') {
      throw new Error(`Handler '${handlerName}' is not exported by ${moduleName}.js`);
    }
    const result = await handler(input);
    const json = JSON.stringify(result === undefined ? null : result);
    writeOut(`\n${begin}\n${json}\n${end}\n`, () => process.exit(0));
  } catch (error) {
    process.stderr.write(`${error && error.stack ? error.stack : String(error)}\n`);
    process.exit(1);
  }
})();
"#;

pub struct NodeRunner {
    binary: String,
    scratch_root: PathBuf,
}

impl NodeRunner {
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
            args: vec![],
            extension: "js",
            harness_file: HARNESS_FILE,
            harness_source: HARNESS_SOURCE,
            env: vec![],
        }
    }
}

#[async_trait]
impl Runner for NodeRunner {
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
