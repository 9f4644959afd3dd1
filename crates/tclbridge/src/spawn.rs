//! How the remote tool is started.
//!
//! A [`ToolLauncher`] turns the path of the companion script into a
//! [`SpawnSpec`]; the session adds the pipe environment and spawns it.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};

/// What to do with one of the child's standard streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StdioMode {
    #[default]
    Inherit,
    Piped,
    Null,
}

impl StdioMode {
    fn to_stdio(self) -> Stdio {
        match self {
            Self::Inherit => Stdio::inherit(),
            Self::Piped => Stdio::piped(),
            Self::Null => Stdio::null(),
        }
    }
}

/// Everything needed to start the remote tool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    /// Added on top of the inherited environment.
    pub env: Vec<(OsString, OsString)>,
    pub stdin: StdioMode,
    pub stdout: StdioMode,
    pub stderr: StdioMode,
}

impl SpawnSpec {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin(mut self, mode: StdioMode) -> Self {
        self.stdin = mode;
        self
    }

    pub fn stdout(mut self, mode: StdioMode) -> Self {
        self.stdout = mode;
        self
    }

    pub fn stderr(mut self, mode: StdioMode) -> Self {
        self.stderr = mode;
        self
    }

    pub(crate) fn command<'a>(
        &self,
        extra_env: impl IntoIterator<Item = (&'a str, &'a Path)>,
        debug: bool,
    ) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .envs(extra_env)
            .env(crate::bootstrap::ENV_DEBUG, if debug { "1" } else { "0" })
            .stdin(self.stdin.to_stdio())
            .stdout(self.stdout.to_stdio())
            .stderr(self.stderr.to_stdio());
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }

    pub(crate) fn spawn<'a>(
        &self,
        extra_env: impl IntoIterator<Item = (&'a str, &'a Path)>,
        debug: bool,
    ) -> std::io::Result<Child> {
        self.command(extra_env, debug).spawn()
    }
}

/// Extension point for different ways of starting the remote tool.
pub trait ToolLauncher: Send + Sync {
    fn spawn_spec(&self, script: &Path) -> SpawnSpec;
}

impl<F> ToolLauncher for F
where
    F: Fn(&Path) -> SpawnSpec + Send + Sync,
{
    fn spawn_spec(&self, script: &Path) -> SpawnSpec {
        self(script)
    }
}

/// Placeholder replaced by the companion script path in launcher arguments.
pub const SCRIPT_PLACEHOLDER: &str = "{script}";

/// Launches `program args...`, passing the companion script either where
/// [`SCRIPT_PLACEHOLDER`] appears or as the last argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLineLauncher {
    program: OsString,
    args: Vec<String>,
    env: Vec<(OsString, OsString)>,
    cwd: Option<PathBuf>,
    stdin: StdioMode,
}

impl CommandLineLauncher {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            stdin: StdioMode::Inherit,
        }
    }

    /// Plain `tclsh <script>`.
    pub fn tclsh() -> Self {
        Self::new("tclsh")
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

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Stdin mode for the tool; piped stdin feeds the detached REPL.
    pub fn stdin(mut self, mode: StdioMode) -> Self {
        self.stdin = mode;
        self
    }
}

impl ToolLauncher for CommandLineLauncher {
    fn spawn_spec(&self, script: &Path) -> SpawnSpec {
        let script_str = script.to_string_lossy();
        let mut substituted = false;
        let mut args: Vec<OsString> = self
            .args
            .iter()
            .map(|a| {
                if a.contains(SCRIPT_PLACEHOLDER) {
                    substituted = true;
                    OsString::from(a.replace(SCRIPT_PLACEHOLDER, &script_str))
                } else {
                    OsString::from(a)
                }
            })
            .collect();
        if !substituted {
            args.push(script.as_os_str().to_owned());
        }

        SpawnSpec {
            program: self.program.clone(),
            args,
            cwd: self.cwd.clone(),
            env: self.env.clone(),
            stdin: self.stdin,
            stdout: StdioMode::Inherit,
            stderr: StdioMode::Inherit,
        }
    }
}
