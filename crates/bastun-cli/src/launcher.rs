//! Local client launchers: the native programs pointed at the tunnel.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use anyhow::{bail, Context, Result};

/// A fully built client invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl LaunchCommand {
    /// Run the client to completion, inheriting the terminal.
    pub async fn run(&self) -> Result<ExitStatus> {
        tokio::process::Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("failed to run {}", self.program.display()))
    }
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Builds the command line of a native client for a local tunnel port.
pub trait LocalClientLauncher: Send + Sync {
    fn name(&self) -> &str;
    fn command(&self, port: u16) -> Result<LaunchCommand>;
}

/// Search `PATH` for an executable.
fn find_in_path(program: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    let file_name = if cfg!(windows) {
        format!("{program}.exe")
    } else {
        program.to_string()
    };
    std::env::split_paths(&paths)
        .map(|dir| dir.join(&file_name))
        .find(|candidate| candidate.is_file())
}

/// Program under `%SystemRoot%\System32` (or `SysNative` for 32-bit builds).
fn find_in_system32(relative: &Path) -> Result<PathBuf> {
    let root = std::env::var_os("SystemRoot").context("SystemRoot is not set")?;
    let sys_dir = if cfg!(target_pointer_width = "32") {
        "SysNative"
    } else {
        "System32"
    };
    Ok(PathBuf::from(root).join(sys_dir).join(relative))
}

/// Locate the OpenSSH client.
pub fn find_ssh() -> Result<PathBuf> {
    if cfg!(windows) {
        let path = find_in_system32(Path::new("OpenSSH").join("ssh.exe").as_path())?;
        if !path.is_file() {
            bail!("Could not find ssh.exe. Is the OpenSSH client installed?");
        }
        return Ok(path);
    }
    if cfg!(any(target_os = "linux", target_os = "macos")) {
        return find_in_path("ssh")
            .context("ssh not found in path. Is the OpenSSH client installed?");
    }
    bail!("Platform is not supported for this command. Supported platforms: Windows, Darwin, Linux")
}

/// Locate the Windows Remote Desktop client.
pub fn find_mstsc() -> Result<PathBuf> {
    if !cfg!(windows) {
        bail!("Platform is not supported for this command. Supported platforms: Windows");
    }
    let path = find_in_system32(Path::new("mstsc.exe"))?;
    if !path.is_file() {
        bail!("Could not find mstsc.exe.");
    }
    Ok(path)
}

/// `ssh user@localhost -p PORT …` with host-key checks disabled, since the
/// host key presented through a fresh tunnel port is never stable.
#[derive(Debug, Clone)]
pub struct SshLauncher {
    program: Option<PathBuf>,
    username: String,
    private_key: Option<PathBuf>,
    certificate: Option<PathBuf>,
    extra_args: Vec<String>,
}

impl SshLauncher {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            program: None,
            username: username.into(),
            private_key: None,
            certificate: None,
            extra_args: Vec::new(),
        }
    }

    /// Use this binary instead of searching for `ssh`.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn with_private_key(mut self, key: impl Into<PathBuf>) -> Self {
        self.private_key = Some(key.into());
        self
    }

    pub fn with_certificate(mut self, cert: impl Into<PathBuf>) -> Self {
        self.certificate = Some(cert.into());
        self
    }

    /// Arguments appended after the generated ones.
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }
}

impl LocalClientLauncher for SshLauncher {
    fn name(&self) -> &str {
        "ssh"
    }

    fn command(&self, port: u16) -> Result<LaunchCommand> {
        let program = match &self.program {
            Some(p) => p.clone(),
            None => find_ssh()?,
        };

        let mut args = vec![format!("{}@localhost", self.username)];
        if let Some(key) = &self.private_key {
            args.push("-i".into());
            args.push(key.display().to_string());
        }
        if let Some(cert) = &self.certificate {
            args.push("-o".into());
            args.push(format!("CertificateFile={}", cert.display()));
        }
        args.extend(
            [
                "-p",
                &port.to_string(),
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "LogLevel=Error",
            ]
            .map(String::from),
        );
        args.extend(self.extra_args.iter().cloned());

        Ok(LaunchCommand { program, args })
    }
}

/// `mstsc /v:localhost:PORT`, or `mstsc [/edit] FILE` for a connection file.
#[derive(Debug, Clone, Default)]
pub struct RdpLauncher {
    program: Option<PathBuf>,
}

impl RdpLauncher {
    fn program(&self) -> Result<PathBuf> {
        match &self.program {
            Some(p) => Ok(p.clone()),
            None => find_mstsc(),
        }
    }

    /// Open a connection file, in the editor when `edit` is set.
    pub fn file_command(&self, path: &Path, edit: bool) -> Result<LaunchCommand> {
        let mut args = Vec::new();
        if edit {
            args.push("/edit".to_string());
        }
        args.push(path.display().to_string());
        Ok(LaunchCommand {
            program: self.program()?,
            args,
        })
    }
}

impl LocalClientLauncher for RdpLauncher {
    fn name(&self) -> &str {
        "mstsc"
    }

    fn command(&self, port: u16) -> Result<LaunchCommand> {
        Ok(LaunchCommand {
            program: self.program()?,
            args: vec![format!("/v:localhost:{port}")],
        })
    }
}
