//! The replication pair: identity, state, lock and transfer protocol.
//!
//! A `Pair` holds no durable state of its own. Everything it knows about the
//! replication comes from ZFS user properties on the destination (and, during
//! a transfer, the source), plus the lock marker and relay socket under the
//! run directory. Two processes built from the same configuration therefore
//! see the same pair.

mod lock;
mod state;
mod transfer;

pub use lock::{Lock, LockGuard};
pub use state::{Inconsistency, LagLevel, Observation, State, Status};
pub use transfer::{throughput_summary, Mode, TransferReport};

use md5::{Digest, Md5};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;

use crate::config::{Config, PairSpec};
use crate::error::{Error, Result};
use crate::exec::{Session, Shell, SshConfig};
use crate::relay::{self, MonitorOutcome};
use crate::report::StatusReport;
use crate::zfs::Dataset;

/// Stable identity of a pair: MD5 of `shost:spath::dhost:dpath`.
pub fn fingerprint(
    source_host: &str,
    source_path: &str,
    destination_host: &str,
    destination_path: &str,
) -> String {
    let canonical = format!(
        "{}:{}::{}:{}",
        source_host, source_path, destination_host, destination_path
    );
    hex::encode(Md5::digest(canonical.as_bytes()))
}

/// Names of the ZFS user properties that persist a pair's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Properties {
    pub source: String,
    pub destination: String,
    pub last_snapshot: String,
    pub fingerprint: String,
}

impl Properties {
    pub fn new(prefix: &str, fingerprint: &str) -> Self {
        Self {
            source: format!("{}:{}:source", prefix, fingerprint),
            destination: format!("{}:{}:destination", prefix, fingerprint),
            last_snapshot: format!("{}:{}:lastsnap", prefix, fingerprint),
            fingerprint: format!("{}:fingerprint", prefix),
        }
    }
}

/// Local files owned by a pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairPaths {
    pub lock: PathBuf,
    pub socket: PathBuf,
    pub log: PathBuf,
    pub scratch: PathBuf,
}

impl PairPaths {
    pub fn new(config: &Config, fingerprint: &str) -> Self {
        Self {
            lock: config.run_dir.join(format!("{}.lck", fingerprint)),
            socket: config.run_dir.join(format!("{}.sock", fingerprint)),
            log: config.log_dir.join(format!("{}.log", fingerprint)),
            scratch: config.tmp_dir.join(fingerprint),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Setup,
    Status,
    Runstatus,
    Initialize,
    Update,
    Unlock,
    Fingerprint,
    Logfile,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Setup => "setup",
            Action::Status => "status",
            Action::Runstatus => "runstatus",
            Action::Initialize => "initialize",
            Action::Update => "update",
            Action::Unlock => "unlock",
            Action::Fingerprint => "fingerprint",
            Action::Logfile => "logfile",
        }
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "setup" => Ok(Action::Setup),
            "status" => Ok(Action::Status),
            "runstatus" => Ok(Action::Runstatus),
            "initialize" => Ok(Action::Initialize),
            "update" => Ok(Action::Update),
            "unlock" => Ok(Action::Unlock),
            "fingerprint" => Ok(Action::Fingerprint),
            "logfile" => Ok(Action::Logfile),
            other => Err(Error::Action(other.to_string())),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`Pair::execute`], for the caller to render.
#[derive(Debug)]
pub enum Outcome {
    Setup,
    Status(StatusReport),
    Runstatus(MonitorOutcome),
    Transfer(TransferReport),
    Unlocked,
    Fingerprint(String),
    Logfile(PathBuf),
}

pub struct Pair {
    source: Dataset,
    destination: Dataset,
    fingerprint: String,
    port: u16,
    ssh: SshConfig,
    clag: Duration,
    wlag: Duration,
    properties: Properties,
    paths: PairPaths,
    lock: Lock,
    config: Arc<Config>,
    shell: Arc<dyn Shell>,
    local: Session,
    observed: Mutex<Option<Observation>>,
}

impl Pair {
    pub fn new(spec: &PairSpec, config: Arc<Config>, shell: Arc<dyn Shell>) -> Self {
        let fingerprint = fingerprint(
            &spec.source_host,
            &spec.source_path,
            &spec.destination_host,
            &spec.destination_path,
        );
        let properties = Properties::new(&config.property_prefix, &fingerprint);
        let paths = PairPaths::new(&config, &fingerprint);
        let lock = Lock::new(
            paths.lock.clone(),
            paths.socket.clone(),
            spec.destination_path.clone(),
            spec.port,
        );
        let ssh = SshConfig {
            hostname: spec.source_host.clone(),
            user: config.ssh_user.clone(),
            port: spec.ssh_port.unwrap_or(22),
            identity_file: spec.ssh_key.iter().cloned().collect(),
        };

        Self {
            source: Dataset::new(spec.source_path.clone(), spec.source_host.clone()),
            destination: Dataset::new(
                spec.destination_path.clone(),
                spec.destination_host.clone(),
            ),
            fingerprint,
            port: spec.port,
            ssh,
            clag: spec.clag,
            wlag: spec.wlag,
            properties,
            paths,
            lock,
            local: Session::local(shell.clone()),
            config,
            shell,
            observed: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &Dataset {
        &self.source
    }

    pub fn destination(&self) -> &Dataset {
        &self.destination
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ssh(&self) -> &SshConfig {
        &self.ssh
    }

    pub fn clag(&self) -> Duration {
        self.clag
    }

    pub fn wlag(&self) -> Duration {
        self.wlag
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn paths(&self) -> &PairPaths {
        &self.paths
    }

    pub fn logfile(&self) -> &Path {
        &self.paths.log
    }

    /// Service description used for alerts.
    pub fn service_description(&self) -> String {
        format!("service/{}:{}", self.config.property_prefix, self.fingerprint)
    }

    pub async fn execute<W>(&self, action: Action, out: &mut W) -> Result<Outcome>
    where
        W: AsyncWrite + Unpin,
    {
        match action {
            Action::Setup => self.config.setup().map(|_| Outcome::Setup),
            Action::Status => self.status_report().await.map(Outcome::Status),
            Action::Runstatus => self.runstatus(out).await.map(Outcome::Runstatus),
            Action::Initialize => self.initialize().await.map(Outcome::Transfer),
            Action::Update => self.update().await.map(Outcome::Transfer),
            Action::Unlock => self.unlock().map(|_| Outcome::Unlocked),
            Action::Fingerprint => Ok(Outcome::Fingerprint(self.fingerprint.clone())),
            Action::Logfile => Ok(Outcome::Logfile(self.paths.log.clone())),
        }
    }

    /// Destination-side observation, read at most once until invalidated.
    pub async fn observe(&self) -> Result<Observation> {
        let mut observed = self.observed.lock().await;
        if let Some(observation) = observed.as_ref() {
            return Ok(observation.clone());
        }
        let observation = self.read_observation().await?;
        *observed = Some(observation.clone());
        Ok(observation)
    }

    /// Drop the memoized observation so the next read goes to ZFS.
    pub async fn invalidate(&self) {
        *self.observed.lock().await = None;
    }

    async fn read_observation(&self) -> Result<Observation> {
        let session = &self.local;
        if !self.destination.exists(session).await? {
            return Ok(Observation::default());
        }

        let fingerprint = self
            .destination
            .get(session, &self.properties.fingerprint)
            .await?;
        let last_snapshot = self
            .destination
            .get(session, &self.properties.last_snapshot)
            .await?;
        let last_snapshot_exists = match &last_snapshot {
            Some(name) => self.destination.at(name).exists(session).await?,
            None => false,
        };

        Ok(Observation {
            exists: true,
            fingerprint,
            last_snapshot,
            last_snapshot_exists,
        })
    }

    pub async fn state(&self) -> Result<State> {
        let state = self.observe().await?.state(&self.fingerprint);
        if let State::Inconsistent(reason) = state {
            tracing::error!(fingerprint = %self.fingerprint, "{}: {}", self.destination, reason);
        }
        Ok(state)
    }

    pub async fn is_synchronized(&self) -> Result<bool> {
        Ok(self.state().await?.is_synchronized())
    }

    pub async fn status(&self) -> Result<Status> {
        Ok(Status::derive(self.is_running(), self.state().await?))
    }

    /// Name of the last replicated snapshot recorded on the destination.
    pub async fn last_snapshot(&self) -> Result<Option<String>> {
        Ok(self.observe().await?.last_snapshot)
    }

    /// Age of the last synchronized snapshot; zero unless synchronized.
    pub async fn lag(&self) -> Result<Duration> {
        let observation = self.observe().await?;
        if !observation.state(&self.fingerprint).is_synchronized() {
            return Ok(Duration::ZERO);
        }
        let Some(name) = observation.last_snapshot else {
            return Ok(Duration::ZERO);
        };
        let created = self.destination.at(&name).creation(&self.local).await?;
        let age = chrono::Utc::now().signed_duration_since(created);
        Ok(age.abs().to_std().unwrap_or_default())
    }

    pub async fn lag_level(&self) -> Result<LagLevel> {
        Ok(LagLevel::classify(self.lag().await?, self.wlag, self.clag))
    }

    /// How long the current transfer has been running; zero when idle.
    pub fn runtime(&self) -> Duration {
        if !self.is_running() {
            return Duration::ZERO;
        }
        std::fs::metadata(&self.paths.socket)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|started| SystemTime::now().duration_since(started).ok())
            .unwrap_or_default()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    pub fn is_running(&self) -> bool {
        self.lock.is_live()
    }

    /// Clear a stale lock. Refused while a transfer is live.
    pub fn unlock(&self) -> Result<()> {
        self.lock.release()?;
        tracing::info!(fingerprint = %self.fingerprint, "{} unlocked", self.destination);
        Ok(())
    }

    pub async fn status_report(&self) -> Result<StatusReport> {
        let state = self.state().await?;
        let lag = self.lag().await?;
        Ok(StatusReport {
            source: self.source.clone(),
            destination: self.destination.clone(),
            state,
            status: Status::derive(self.is_running(), state),
            lag,
            lag_level: LagLevel::classify(lag, self.wlag, self.clag),
            locked: self.is_locked(),
            last_snapshot: self.last_snapshot().await?,
            port: self.port,
            runtime: self.runtime(),
        })
    }

    /// Status line, with the last snapshot and port when the invocation asked
    /// for full status.
    pub async fn status_line(&self) -> Result<String> {
        let report = self.status_report().await?;
        Ok(report.render(self.config.settings.full_status))
    }

    /// Stream the live transfer output to `out` until interrupted or the
    /// transfer ends.
    pub async fn runstatus<W>(&self, out: &mut W) -> Result<MonitorOutcome>
    where
        W: AsyncWrite + Unpin,
    {
        if !self.is_running() {
            return Ok(MonitorOutcome::NotRunning);
        }
        let stop = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        relay::monitor(&self.paths.socket, out, stop).await
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn shell(&self) -> Arc<dyn Shell> {
        self.shell.clone()
    }

    pub(crate) fn local(&self) -> &Session {
        &self.local
    }

    pub(crate) fn lock(&self) -> &Lock {
        &self.lock
    }
}

impl fmt::Debug for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pair")
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("fingerprint", &self.fingerprint)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}
