//! Main configuration file and pair descriptor file.
//!
//! The main file is TOML; every field has a default so an absent file is a
//! valid configuration. Pair descriptors use a line format:
//!
//! ```text
//! # source                destination              options
//! src01:tank/home         dst01:backup/home        port=9001,sshkey=/root/.ssh/id_rsa,wlag=90000,clag=180000
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_CONFIG_PATH: &str = "/local/etc/zettabee/zettabee.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub run_dir: PathBuf,
    pub log_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub etc_dir: PathBuf,
    pub pairs_file: PathBuf,
    /// Namespace for the ZFS user properties and snapshot names.
    pub property_prefix: String,
    /// Wait between starting the receive side and starting the send side.
    pub settle_delay_secs: u64,
    pub ssh_user: String,
    pub mbuffer: MbufferConfig,
    pub nsca: NscaConfig,
    /// Runtime flags from the command line; never read from the file.
    #[serde(skip)]
    pub settings: Settings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from("/local/var/run/zettabee"),
            log_dir: PathBuf::from("/local/var/log/zettabee"),
            tmp_dir: PathBuf::from("/local/var/tmp/zettabee"),
            etc_dir: PathBuf::from("/local/etc/zettabee"),
            pairs_file: PathBuf::from("/local/etc/zettabee/zettabee.zfg"),
            property_prefix: "zettabee".to_string(),
            settle_delay_secs: 15,
            ssh_user: "root".to_string(),
            mbuffer: MbufferConfig::default(),
            nsca: NscaConfig::default(),
            settings: Settings::default(),
        }
    }
}

/// Per-invocation flags shared by every pair through [`Config`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    /// Mirror log lines to the console.
    pub verbose: bool,
    pub debug: bool,
    /// Status lines include the last snapshot and port.
    pub full_status: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MbufferConfig {
    pub block_size: String,
    pub memory: String,
    /// Send-side rate limit.
    pub rate_limit: Option<String>,
}

impl Default for MbufferConfig {
    fn default() -> Self {
        Self {
            block_size: "128k".to_string(),
            memory: "500M".to_string(),
            rate_limit: Some("50M".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NscaConfig {
    pub bin: PathBuf,
    pub config: PathBuf,
}

impl Default for NscaConfig {
    fn default() -> Self {
        Self {
            bin: PathBuf::from("/usr/local/bin/send_nsca"),
            config: PathBuf::from("/usr/local/etc/nsca/send_nsca.cfg"),
        }
    }
}

impl Config {
    /// Load the main configuration. A missing file falls back to defaults
    /// unless `required` is set.
    pub fn load(path: &Path, required: bool) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text).map_err(|e| match e {
                Error::Configuration(msg) => {
                    Error::Configuration(format!("{}: {}", path.display(), msg))
                }
                other => other,
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound && !required => Ok(Self::default()),
            Err(e) => Err(Error::Configuration(format!(
                "could not read main configuration file {}: {}",
                path.display(),
                e
            ))),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    /// Create the local run, log, scratch and configuration directories.
    pub fn setup(&self) -> Result<()> {
        for dir in [&self.run_dir, &self.log_dir, &self.tmp_dir, &self.etc_dir] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// One replication pair as described in the pair file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairSpec {
    pub source_host: String,
    pub source_path: String,
    pub destination_host: String,
    pub destination_path: String,
    pub port: u16,
    pub ssh_port: Option<u16>,
    pub ssh_key: Option<PathBuf>,
    pub clag: Duration,
    pub wlag: Duration,
}

impl PairSpec {
    pub fn new(source: &str, destination: &str, port: u16) -> Result<Self> {
        let (source_host, source_path) = split_endpoint(source)?;
        let (destination_host, destination_path) = split_endpoint(destination)?;
        Ok(Self {
            source_host,
            source_path,
            destination_host,
            destination_path,
            port,
            ssh_port: None,
            ssh_key: None,
            clag: Duration::ZERO,
            wlag: Duration::ZERO,
        })
    }
}

fn split_endpoint(endpoint: &str) -> Result<(String, String)> {
    match endpoint.split_once(':') {
        Some((host, path)) if !host.is_empty() && !path.is_empty() => {
            Ok((host.to_string(), path.to_string()))
        }
        _ => Err(Error::Configuration(format!(
            "expected host:dataset, got '{}'",
            endpoint
        ))),
    }
}

pub fn load_pairs(path: &Path) -> Result<Vec<PairSpec>> {
    let text = fs::read_to_string(path).map_err(|e| {
        Error::Configuration(format!("could not read pair file {}: {}", path.display(), e))
    })?;
    parse_pairs(&text)
}

pub fn parse_pairs(text: &str) -> Result<Vec<PairSpec>> {
    let mut pairs = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let spec = parse_pair_line(line)
            .map_err(|msg| Error::Configuration(format!("line {}: {}", index + 1, msg)))?;
        pairs.push(spec);
    }
    Ok(pairs)
}

fn parse_pair_line(line: &str) -> std::result::Result<PairSpec, String> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 3 {
        return Err(format!(
            "expected 'source destination options', got {} fields",
            fields.len()
        ));
    }

    let mut port = None;
    let mut spec = PairSpec::new(fields[0], fields[1], 0).map_err(|e| e.to_string())?;

    for option in fields[2].split(',').filter(|o| !o.is_empty()) {
        let (key, value) = option
            .split_once('=')
            .ok_or_else(|| format!("option '{}' is not key=value", option))?;
        match key {
            "port" => port = Some(parse_number::<u16>(key, value)?),
            "sshport" => spec.ssh_port = Some(parse_number::<u16>(key, value)?),
            "sshkey" => spec.ssh_key = Some(PathBuf::from(value)),
            "clag" => spec.clag = Duration::from_secs(parse_number::<u64>(key, value)?),
            "wlag" => spec.wlag = Duration::from_secs(parse_number::<u64>(key, value)?),
            // accepted for compatibility with older pair files
            "transport" => {}
            other => return Err(format!("unknown option '{}'", other)),
        }
    }

    spec.port = port.ok_or_else(|| "missing port option".to_string())?;
    Ok(spec)
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> std::result::Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("invalid value '{}' for {}", value, key))
}
