//! External process seam.

use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

/// A fully described external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
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

    pub fn envs(mut self, env: &[(String, String)]) -> Self {
        self.env.extend_from_slice(env);
        self
    }

    /// Program and arguments only; environment values may hold secrets.
    pub fn command_line(&self) -> String {
        let mut s = self.program.clone();
        for a in &self.args {
            s.push(' ');
            s.push_str(a);
        }
        s
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Both streams, for matching tool messages that may land on either.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(out: std::process::Output) -> Self {
        Self {
            success: out.status.success(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        }
    }
}

/// Line reader over a long-running command. Dropping it kills the process.
pub struct LineStream {
    reader: Box<dyn AsyncBufRead + Send + Unpin>,
    _child: Option<tokio::process::Child>,
}

impl LineStream {
    pub fn from_reader(reader: impl AsyncBufRead + Send + Unpin + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            _child: None,
        }
    }

    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        let mut buf = String::new();
        let n = self.reader.read_line(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = buf.trim_end_matches(['\n', '\r']).len();
        buf.truncate(trimmed);
        Ok(Some(buf))
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture output.
    async fn run(&self, invocation: &Invocation) -> io::Result<CommandOutput>;

    /// Start and stream stdout line by line.
    async fn stream(&self, invocation: &Invocation) -> io::Result<LineStream>;
}

#[derive(Debug, Default)]
pub struct ProcessRunner;

fn command(invocation: &Invocation) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .kill_on_drop(true);
    cmd
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: &Invocation) -> io::Result<CommandOutput> {
        tracing::debug!(command = %invocation.command_line(), "running");
        let out = command(invocation).output().await?;
        Ok(out.into())
    }

    async fn stream(&self, invocation: &Invocation) -> io::Result<LineStream> {
        tracing::debug!(command = %invocation.command_line(), "streaming");
        let mut child = command(invocation)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "no stdout pipe"))?;
        Ok(LineStream {
            reader: Box::new(BufReader::new(stdout)),
            _child: Some(child),
        })
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::Mutex;

    type Responder = Box<dyn Fn(&Invocation) -> CommandOutput + Send + Sync>;

    /// Records every invocation and answers from a script.
    pub(crate) struct FakeRunner {
        calls: Mutex<Vec<Invocation>>,
        respond: Responder,
        stream_lines: Vec<String>,
    }

    impl FakeRunner {
        pub(crate) fn new(respond: impl Fn(&Invocation) -> CommandOutput + Send + Sync + 'static) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                respond: Box::new(respond),
                stream_lines: Vec::new(),
            }
        }

        pub(crate) fn succeeding() -> Self {
            Self::new(|_| CommandOutput::ok(""))
        }

        pub(crate) fn with_stream(mut self, lines: &[&str]) -> Self {
            self.stream_lines = lines.iter().map(|s| s.to_string()).collect();
            self
        }

        pub(crate) fn calls(&self) -> Vec<Invocation> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn command_lines(&self) -> Vec<String> {
            self.calls().iter().map(Invocation::command_line).collect()
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, invocation: &Invocation) -> io::Result<CommandOutput> {
            self.calls.lock().unwrap().push(invocation.clone());
            Ok((self.respond)(invocation))
        }

        async fn stream(&self, invocation: &Invocation) -> io::Result<LineStream> {
            self.calls.lock().unwrap().push(invocation.clone());
            let mut body = self.stream_lines.join("\n");
            body.push('\n');
            Ok(LineStream::from_reader(std::io::Cursor::new(body.into_bytes())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_hides_environment() {
        let inv = Invocation::new("docker")
            .args(["compose", "ps"])
            .envs(&[("POSTGRES_PASSWORD".into(), "hunter2".into())]);
        assert_eq!(inv.command_line(), "docker compose ps");
        assert_eq!(inv.env.len(), 1);
    }

    #[tokio::test]
    async fn line_stream_strips_line_endings() {
        let mut s = LineStream::from_reader(std::io::Cursor::new(b"a\r\nb\n".to_vec()));
        assert_eq!(s.next_line().await.unwrap().as_deref(), Some("a"));
        assert_eq!(s.next_line().await.unwrap().as_deref(), Some("b"));
        assert_eq!(s.next_line().await.unwrap(), None);
    }
}
