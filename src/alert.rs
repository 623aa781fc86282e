//! Health classification and NSCA passive-check delivery.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::NscaConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Ok,
    Warning,
    Critical,
    Unknown,
}

impl Health {
    /// Nagios plugin return code.
    pub fn code(&self) -> u8 {
        match self {
            Health::Ok => 0,
            Health::Warning => 1,
            Health::Critical => 2,
            Health::Unknown => 3,
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Health::Ok => "OK",
            Health::Warning => "WARNING",
            Health::Critical => "CRITICAL",
            Health::Unknown => "UNKNOWN",
        })
    }
}

/// Sends results to a Nagios host through `send_nsca`.
#[derive(Debug, Clone)]
pub struct Nsca {
    bin: PathBuf,
    config: PathBuf,
    nagios_host: String,
}

impl Nsca {
    pub fn new(config: &NscaConfig, nagios_host: impl Into<String>) -> Self {
        Self {
            bin: config.bin.clone(),
            config: config.config.clone(),
            nagios_host: nagios_host.into(),
        }
    }

    /// The tab-separated record `send_nsca` reads on stdin.
    pub fn record(host: &str, service: &str, health: Health, output: &str) -> String {
        format!("{}\t{}\t{}\t{}\n", host, service, health.code(), output)
    }

    pub async fn send(&self, host: &str, service: &str, health: Health, output: &str) -> Result<()> {
        let mut child = Command::new(&self.bin)
            .arg("-H")
            .arg(&self.nagios_host)
            .arg("-c")
            .arg(&self.config)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Transport(format!("send_nsca: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(Self::record(host, service, health, output).as_bytes())
                .await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let text = String::from_utf8_lossy(&output.stdout);
            return Err(Error::Transport(format!(
                "send_nsca: {}",
                text.lines().next().unwrap_or("failed").trim()
            )));
        }
        Ok(())
    }
}
