//! Subprocess supervisor: runs host tools (the probe's hypervisor
//! invocations, the appliance builder) with controlled stdio capture.
//!
//! Built on `tokio::process::Command` rather than a raw fork/exec pair —
//! the async runtime already owns the process table via its reaper, so
//! "fork once, wire pipes, exec" becomes "build a `Command`, spawn it,
//! drain its pipes concurrently".

use std::ffi::OsString;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use vmforge_core::error::{external_command_error, Error, Result};

/// How a command's argv is constructed. Mutually exclusive per run.
#[derive(Debug, Clone)]
pub enum CommandSpec {
    /// Direct exec-style argv: no shell involved.
    Argv(Vec<OsString>),
    /// A single shell command string, run via `/bin/sh -c`.
    Shell(String),
}

/// Escapes `$`, backtick, backslash and double quote so `s` is safe to
/// interpolate inside a double-quoted shell substring.
pub fn shell_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if matches!(c, '$' | '`' | '\\' | '"') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// How stdout is delivered to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdoutMode {
    /// One callback per `\n`-terminated line, trailing newline stripped.
    LineBuffered,
    /// One callback per successful read, arbitrary length.
    Unbuffered,
    /// A single callback after EOF with the whole buffer.
    #[default]
    WholeBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrMode {
    /// Captured and returned as part of the result (default).
    Capture,
    /// Inherited from the parent; not captured.
    Inherit,
    /// Merged into the stdout stream. Mutually exclusive with `Capture`.
    MergeWithStdout,
}

/// A configured but not-yet-run command.
pub struct Supervisor {
    spec: CommandSpec,
    stdout_mode: StdoutMode,
    stderr_mode: StderrMode,
    close_all_fds: bool,
    env_scrub: bool,
    extra_env: Vec<(String, String)>,
    current_dir: Option<std::path::PathBuf>,
}

impl Supervisor {
    pub fn new(spec: CommandSpec) -> Self {
        Self {
            spec,
            stdout_mode: StdoutMode::WholeBuffer,
            stderr_mode: StderrMode::Capture,
            close_all_fds: true,
            env_scrub: true,
            extra_env: Vec::new(),
            current_dir: None,
        }
    }

    pub fn stdout_mode(mut self, mode: StdoutMode) -> Self {
        self.stdout_mode = mode;
        self
    }

    pub fn stderr_mode(mut self, mode: StderrMode) -> Self {
        self.stderr_mode = mode;
        self
    }

    pub fn close_all_fds(mut self, close: bool) -> Self {
        self.close_all_fds = close;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    fn build_command(&self) -> Command {
        let mut cmd = match &self.spec {
            CommandSpec::Argv(argv) => {
                let mut cmd = Command::new(&argv[0]);
                cmd.args(&argv[1..]);
                cmd
            }
            CommandSpec::Shell(script) => {
                let mut cmd = Command::new("/bin/sh");
                cmd.arg("-c").arg(script);
                cmd
            }
        };

        if self.env_scrub {
            cmd.env_clear();
            cmd.env("LC_ALL", "C");
        }
        for (key, value) in &self.extra_env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        if self.close_all_fds {
            cmd.kill_on_drop(true);
        }
        cmd
    }

    /// Runs the command to completion, returning the captured stdout
    /// (subject to `stdout_mode`) and stderr (subject to `stderr_mode`).
    /// A non-zero/non-signalled exit is surfaced as
    /// [`Error::ExternalCommand`].
    pub async fn run(&self) -> Result<RunOutput> {
        let mut cmd = self.build_command();
        cmd.stdout(Stdio::piped());
        match self.stderr_mode {
            StderrMode::Capture => {
                cmd.stderr(Stdio::piped());
            }
            StderrMode::Inherit => {
                cmd.stderr(Stdio::inherit());
            }
            StderrMode::MergeWithStdout => {
                // dup2(1, 2) in the child right before exec, so stderr
                // lands on the same pipe stdout is already wired to.
                // SAFETY: dup2 is async-signal-safe; this runs in the
                // child between fork and exec with nothing else touched.
                unsafe {
                    cmd.pre_exec(|| {
                        let rc = libc::dup2(1, 2);
                        if rc == -1 {
                            return Err(std::io::Error::last_os_error());
                        }
                        Ok(())
                    });
                }
                cmd.stderr(Stdio::null());
            }
        }

        let mut child = cmd.spawn().map_err(Error::Resource)?;
        let stdout = child.stdout.take().expect("stdout was piped");
        let stdout_task = read_stdout(stdout, self.stdout_mode);

        let stderr_task: tokio::task::JoinHandle<Result<Option<String>>> =
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(async move {
                    let mut buf = String::new();
                    let mut stderr = stderr;
                    stderr.read_to_string(&mut buf).await.map_err(Error::Resource)?;
                    Ok(Some(buf))
                })
            } else {
                tokio::spawn(async { Ok(None) })
            };

        let (stdout_result, stderr_result, status) = tokio::join!(
            stdout_task,
            async { stderr_task.await.unwrap_or(Ok(None)) },
            child.wait()
        );

        let status = status.map_err(Error::Resource)?;
        let stdout_lines = stdout_result?;
        let stderr = stderr_result?;

        if !status.success() {
            return Err(external_command_error(&self.command_name(), status));
        }

        Ok(RunOutput {
            stdout_lines,
            stderr,
            status,
        })
    }

    /// Popen-style run: pipes only stdout, redirects stderr to a
    /// temporary file whose trimmed contents are returned after wait.
    pub async fn pipe_run_stdout(&self) -> Result<PipeOutput> {
        let mut cmd = self.build_command();
        cmd.stdout(Stdio::piped());
        let stderr_file = tempfile::NamedTempFile::new().map_err(Error::Resource)?;
        let stderr_fd = stderr_file.reopen().map_err(Error::Resource)?;
        cmd.stderr(Stdio::from(stderr_fd));

        let mut child = cmd.spawn().map_err(Error::Resource)?;
        let mut stdout = child.stdout.take().expect("stdout was piped");
        let mut out = Vec::new();
        stdout.read_to_end(&mut out).await.map_err(Error::Resource)?;
        let status = child.wait().await.map_err(Error::Resource)?;

        let stderr_trimmed = std::fs::read_to_string(stderr_file.path())
            .unwrap_or_default()
            .trim()
            .to_string();

        if !status.success() {
            return Err(external_command_error(&self.command_name(), status));
        }

        Ok(PipeOutput {
            stdout: out,
            stderr_trimmed,
            status,
        })
    }

    fn command_name(&self) -> String {
        match &self.spec {
            CommandSpec::Argv(argv) => argv[0].to_string_lossy().into_owned(),
            CommandSpec::Shell(script) => script.clone(),
        }
    }
}

async fn read_stdout(
    stdout: tokio::process::ChildStdout,
    mode: StdoutMode,
) -> Result<Vec<Vec<u8>>> {
    match mode {
        StdoutMode::LineBuffered => {
            let mut reader = BufReader::new(stdout);
            let mut lines = Vec::new();
            let mut line = String::new();
            loop {
                line.clear();
                let n = reader.read_line(&mut line).await.map_err(Error::Resource)?;
                if n == 0 {
                    break;
                }
                lines.push(line.trim_end_matches('\n').as_bytes().to_vec());
            }
            Ok(lines)
        }
        StdoutMode::Unbuffered => {
            let mut reader = stdout;
            let mut chunks = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = reader.read(&mut buf).await.map_err(Error::Resource)?;
                if n == 0 {
                    break;
                }
                chunks.push(buf[..n].to_vec());
            }
            Ok(chunks)
        }
        StdoutMode::WholeBuffer => {
            let mut reader = stdout;
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await.map_err(Error::Resource)?;
            Ok(vec![buf])
        }
    }
}

#[derive(Debug)]
pub struct RunOutput {
    pub stdout_lines: Vec<Vec<u8>>,
    pub stderr: Option<String>,
    pub status: std::process::ExitStatus,
}

impl RunOutput {
    /// Convenience for `WholeBuffer` mode: the single captured chunk as
    /// a UTF-8 string.
    pub fn stdout_text(&self) -> String {
        self.stdout_lines
            .iter()
            .map(|chunk| String::from_utf8_lossy(chunk))
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Debug)]
pub struct PipeOutput {
    pub stdout: Vec<u8>,
    pub stderr_trimmed: String,
    pub status: std::process::ExitStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_escapes_special_chars() {
        assert_eq!(shell_quote(r#"a$b`c\d"e"#), r#""a\$b\`c\\d\"e""#);
    }

    #[tokio::test]
    async fn shell_command_with_nested_substitution_runs_unescaped() {
        // Concrete scenario 5: `echo "$(echo hi)"` produces exactly `hi\n`
        // on stdout with exit status 0. The quoting helper is for values
        // *interpolated into* a command, so the literal command itself is
        // passed through untouched here.
        let sup = Supervisor::new(CommandSpec::Shell(r#"echo "$(echo hi)""#.to_string()))
            .stdout_mode(StdoutMode::WholeBuffer);
        let out = sup.run().await.unwrap();
        assert_eq!(out.stdout_lines, vec![b"hi\n".to_vec()]);
        assert!(out.status.success());
    }

    #[tokio::test]
    async fn run_whole_buffer_captures_stdout() {
        let sup = Supervisor::new(CommandSpec::Argv(vec!["echo".into(), "hello".into()]))
            .stdout_mode(StdoutMode::WholeBuffer);
        let out = sup.run().await.unwrap();
        assert_eq!(out.stdout_text().trim_end(), "hello");
    }

    #[tokio::test]
    async fn run_line_buffered_splits_on_newline() {
        let sup = Supervisor::new(CommandSpec::Shell("printf 'a\\nb\\n'".to_string()))
            .stdout_mode(StdoutMode::LineBuffered);
        let out = sup.run().await.unwrap();
        assert_eq!(out.stdout_lines, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[tokio::test]
    async fn nonzero_exit_is_external_command_error() {
        let sup = Supervisor::new(CommandSpec::Shell("exit 3".to_string()));
        let err = sup.run().await.unwrap_err();
        assert!(matches!(err, Error::ExternalCommand { .. }));
        assert!(err.to_string().contains("status 3"));
    }

    #[tokio::test]
    async fn merge_with_stdout_interleaves_stderr_into_stdout() {
        let sup = Supervisor::new(CommandSpec::Shell("echo out; echo err 1>&2".to_string()))
            .stdout_mode(StdoutMode::WholeBuffer)
            .stderr_mode(StderrMode::MergeWithStdout);
        let out = sup.run().await.unwrap();
        let text = out.stdout_text();
        assert!(text.contains("out"));
        assert!(text.contains("err"));
        assert!(out.stderr.is_none());
    }

    #[tokio::test]
    async fn pipe_run_captures_stderr_to_tempfile() {
        let sup = Supervisor::new(CommandSpec::Shell(
            "echo out; echo err 1>&2".to_string(),
        ));
        let out = sup.pipe_run_stdout().await.unwrap();
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim_end(), "out");
        assert_eq!(out.stderr_trimmed, "err");
    }
}
