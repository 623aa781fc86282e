//! SSH connection parameters and command construction.

use std::path::PathBuf;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    pub hostname: String,
    pub user: String,
    pub port: u16,
    pub identity_file: Vec<PathBuf>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            user: "root".to_string(),
            port: 22,
            identity_file: Vec::new(),
        }
    }
}

impl SshConfig {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Default::default()
        }
    }

    /// Arguments preceding the remote command.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            self.hostname.clone(),
        ];

        if !self.user.is_empty() {
            args.push("-l".to_string());
            args.push(self.user.clone());
        }

        if self.port != 22 {
            args.push("-p".to_string());
            args.push(self.port.to_string());
        }

        for key in &self.identity_file {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }

        args
    }

    /// `ssh` invocation running `remote_command` on the host.
    pub fn command(&self, remote_command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.args());
        cmd.arg(remote_command);
        cmd
    }
}
