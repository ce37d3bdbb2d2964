// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test doubles for the process seam.

use std::fmt;
use std::sync::Mutex;

use crate::execute::{CommandError, CommandRunner, Exec, ExecOutput};

type Responder = Box<dyn FnMut(&Exec) -> ExecOutput + Send>;

struct Rule {
    needle: String,
    respond: Responder,
}

/// A command runner that answers from a list of rules instead of starting
/// processes.
///
/// A rule matches when its needle is a substring of the command line. The
/// most recently added matching rule wins; commands no rule matches succeed
/// with empty output.
#[derive(Default)]
pub(crate) struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    log: Mutex<Vec<String>>,
}

impl fmt::Debug for ScriptedRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedRunner")
            .field("rules", &self.rules.lock().unwrap().len())
            .field("invocations", &self.log.lock().unwrap().len())
            .finish()
    }
}

impl ScriptedRunner {
    pub fn on<F>(&self, needle: &str, respond: F)
    where
        F: FnMut(&Exec) -> ExecOutput + Send + 'static,
    {
        self.rules
            .lock()
            .unwrap()
            .push(Rule { needle: needle.to_owned(), respond: Box::new(respond) });
    }

    pub fn on_stdout(&self, needle: &str, stdout: &str) {
        let stdout = stdout.to_owned();
        self.on(needle, move |_| ExecOutput::ok(stdout.clone()));
    }

    pub fn on_failure(&self, needle: &str, code: i32, stderr: &str) {
        let stderr = stderr.to_owned();
        self.on(needle, move |_| ExecOutput::failed(code, stderr.clone()));
    }

    pub fn invocations(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|c| c.contains(needle)).count()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, exec: &Exec) -> Result<ExecOutput, CommandError> {
        let line = exec.command_line();
        self.log.lock().unwrap().push(line.clone());

        let mut rules = self.rules.lock().unwrap();
        let output = rules
            .iter_mut()
            .rev()
            .find(|rule| line.contains(&rule.needle))
            .map(|rule| (rule.respond)(exec))
            .unwrap_or_default();

        Ok(ExecOutput { code: output.code.or(Some(0)), ..output })
    }
}
