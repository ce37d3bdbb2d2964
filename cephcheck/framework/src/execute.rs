// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running external tools.
//!
//! Every subprocess the harness starts (ssh, ansible-playbook, kubectl,
//! virsh, git and friends) is described by an [`Exec`] and handed to a
//! [`CommandRunner`]. Production code uses [`HostRunner`]; tests swap in a
//! scripted runner that answers by pattern.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, info, info_span, warn};

/// How many trailing lines of output a failure report keeps.
const FAILURE_TAIL_LINES: usize = 40;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to start `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "`{command}` exited with {}\n--- stdout ---\n{stdout}\n--- stderr ---\n{stderr}",
        .code.map(|c| c.to_string()).unwrap_or_else(|| "a signal".to_owned())
    )]
    Failed { command: String, code: Option<i32>, stdout: String, stderr: String },
}

/// A description of one external process invocation.
#[derive(Clone, Debug)]
pub struct Exec {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    chdir: Option<Utf8PathBuf>,
    capture: bool,
    check: bool,
    log_output: bool,
    shell: bool,
}

impl Exec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            chdir: None,
            capture: false,
            check: true,
            log_output: true,
            shell: false,
        }
    }

    /// Runs `script` through `sh -c`, for invocations that need pipes or
    /// redirection.
    pub fn shell(script: impl Into<String>) -> Self {
        let mut exec = Self::new("sh").arg("-c").arg(script);
        exec.shell = true;
        exec
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Runs the child in `dir`. The harness's own working directory is
    /// never changed.
    pub fn chdir(mut self, dir: impl AsRef<Utf8Path>) -> Self {
        self.chdir = Some(dir.as_ref().to_owned());
        self
    }

    /// Returns the child's stdout and stderr in the [`ExecOutput`].
    pub fn capture(mut self) -> Self {
        self.capture = true;
        self
    }

    /// Sets whether a non-zero exit status is an error. Defaults to `true`.
    pub fn check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    /// Suppresses line-by-line logging of the child's output.
    pub fn quiet(mut self) -> Self {
        self.log_output = false;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn env_vars(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn working_dir(&self) -> Option<&Utf8Path> {
        self.chdir.as_deref()
    }

    pub fn is_captured(&self) -> bool {
        self.capture
    }

    pub fn is_checked(&self) -> bool {
        self.check
    }

    /// A printable rendition of the command for logs and error reports.
    pub fn command_line(&self) -> String {
        if self.shell {
            return self.args.last().cloned().unwrap_or_default();
        }

        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Applies this invocation's `check` setting to a finished process.
    pub fn finish(&self, output: ExecOutput) -> Result<ExecOutput, CommandError> {
        if self.check && !output.success() {
            return Err(CommandError::Failed {
                command: self.command_line(),
                code: output.code,
                stdout: tail(&output.stdout),
                stderr: tail(&output.stderr),
            });
        }

        Ok(output)
    }
}

impl fmt::Display for Exec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

fn tail(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(FAILURE_TAIL_LINES);
    lines[start..].join("\n")
}

/// The result of a finished process.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// The exit code, or `None` if the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self { code: Some(0), stdout: stdout.into(), stderr: String::new() }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self { code: Some(code), stdout: String::new(), stderr: stderr.into() }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Something that can run an [`Exec`] to completion.
///
/// Implementations only run the process; callers apply the `check` policy
/// with [`Exec::finish`].
pub trait CommandRunner: Send + Sync + fmt::Debug {
    fn run(&self, exec: &Exec) -> Result<ExecOutput, CommandError>;
}

/// Runs commands as child processes of the harness.
#[derive(Debug, Default)]
pub struct HostRunner;

impl CommandRunner for HostRunner {
    fn run(&self, exec: &Exec) -> Result<ExecOutput, CommandError> {
        let command_line = exec.command_line();
        let _span = info_span!("exec", program = %exec.program).entered();
        debug!(command = %command_line, cwd = ?exec.chdir, "Running command");

        let mut cmd = Command::new(&exec.program);
        cmd.args(&exec.args)
            .envs(&exec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &exec.chdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| CommandError::Spawn {
            command: command_line.clone(),
            source,
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let log = exec.log_output;
        let (stdout, stderr) = std::thread::scope(|s| {
            let out = s.spawn(move || drain(stdout, log, false));
            let err = s.spawn(move || drain(stderr, log, true));
            (out.join().unwrap_or_default(), err.join().unwrap_or_default())
        });

        let status = child.wait().map_err(|source| CommandError::Spawn {
            command: command_line.clone(),
            source,
        })?;

        debug!(command = %command_line, ?status, "Command finished");
        let output = ExecOutput { code: status.code(), stdout, stderr };
        Ok(output)
    }
}

/// Reads a child's output stream to the end, logging each line.
fn drain<R: Read>(stream: Option<R>, log: bool, is_stderr: bool) -> String {
    let Some(stream) = stream else {
        return String::new();
    };

    // Read to EOF even past invalid UTF-8; the child must never see the
    // pipe close under it.
    let mut reader = BufReader::new(stream);
    let mut collected = String::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "Reading child output failed");
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']);

        if log {
            if is_stderr {
                warn!(target: "cephcheck::exec", "{line}");
            } else {
                info!(target: "cephcheck::exec", "{line}");
            }
        }

        collected.push_str(line);
        collected.push('\n');
    }

    collected
}

/// Runs `exec` on `runner`, applying its `check` setting and dropping
/// uncaptured output from the result.
pub fn run_checked(
    runner: &dyn CommandRunner,
    exec: &Exec,
) -> Result<ExecOutput, CommandError> {
    let mut output = exec.finish(runner.run(exec)?)?;
    if !exec.capture {
        output.stdout.clear();
        output.stderr.clear();
    }

    Ok(output)
}
