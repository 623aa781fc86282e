//! Dataset handle over the `zfs` tool.
//!
//! A [`Dataset`] is a value: constructing one touches nothing. Every operation
//! issues exactly one `zfs` command through the [`Session`] it is given, so the
//! caller always chooses which host a read or write goes to.

use chrono::{DateTime, TimeZone, Utc};
use std::fmt;

use crate::error::{Error, Result};
use crate::exec::{shell_quote, Process, Session};

/// Value the `zfs` tool prints for an unset property.
const NO_VALUE: &str = "-";

/// Pool version reported as `-` by pools using feature flags.
pub const FEATURE_FLAGS_VERSION: u64 = 5000;

/// First pool version whose `zfs receive` accepts `-o property=value`.
pub const RECEIVE_PROPERTIES_VERSION: u64 = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Filesystem,
    Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    path: String,
    host: String,
    kind: Kind,
}

impl Dataset {
    pub fn new(path: impl Into<String>, host: impl Into<String>) -> Self {
        let path = path.into();
        let kind = if path.contains('@') {
            Kind::Snapshot
        } else {
            Kind::Filesystem
        };
        Self {
            path,
            host: host.into(),
            kind,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// First path segment.
    pub fn pool(&self) -> &str {
        self.filesystem().split('/').next().unwrap_or_default()
    }

    /// Path segments below the pool.
    pub fn subpath(&self) -> Vec<&str> {
        self.filesystem().split('/').skip(1).collect()
    }

    /// The filesystem part of the path, without any `@snapshot` suffix.
    pub fn filesystem(&self) -> &str {
        match self.path.split_once('@') {
            Some((fs, _)) => fs,
            None => &self.path,
        }
    }

    /// Bare snapshot name for snapshots.
    pub fn snapshot_name(&self) -> Option<&str> {
        match self.kind {
            Kind::Snapshot => self.path.rsplit_once('@').map(|(_, name)| name),
            Kind::Filesystem => None,
        }
    }

    pub fn parent(&self) -> Option<&str> {
        self.filesystem().rsplit_once('/').map(|(parent, _)| parent)
    }

    /// Handle for snapshot `name` of this dataset's filesystem.
    pub fn at(&self, name: &str) -> Dataset {
        Dataset::new(format!("{}@{}", self.filesystem(), name), self.host.clone())
    }

    /// Property value, or `None` when the tool reports it unset.
    pub async fn get(&self, session: &Session, property: &str) -> Result<Option<String>> {
        self.get_with(session, property, false).await
    }

    async fn get_with(
        &self,
        session: &Session,
        property: &str,
        parsable: bool,
    ) -> Result<Option<String>> {
        let flags = if parsable { "-H -p" } else { "-H" };
        let output = self
            .zfs(
                session,
                &format!(
                    "get {} -o value {} {}",
                    flags,
                    shell_quote(property),
                    shell_quote(&self.path)
                ),
            )
            .await?;
        let value = output.lines().next().map(str::trim).unwrap_or(NO_VALUE);
        if value.is_empty() || value == NO_VALUE {
            Ok(None)
        } else {
            Ok(Some(value.to_string()))
        }
    }

    pub async fn set(&self, session: &Session, property: &str, value: &str) -> Result<()> {
        self.zfs(
            session,
            &format!(
                "set {} {}",
                shell_quote(&format!("{}={}", property, value)),
                shell_quote(&self.path)
            ),
        )
        .await
        .map(|_| ())
    }

    /// `false` only when the tool says the dataset does not exist.
    pub async fn exists(&self, session: &Session) -> Result<bool> {
        match self.get(session, "creation").await {
            Ok(_) => Ok(true),
            Err(e) if e.is_missing_dataset() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn creation(&self, session: &Session) -> Result<DateTime<Utc>> {
        let raw = self
            .get_with(session, "creation", true)
            .await?
            .ok_or_else(|| Error::Storage(format!("{}: creation time not set", self.path)))?;
        let secs: i64 = raw
            .parse()
            .map_err(|_| Error::Storage(format!("{}: invalid creation time '{}'", self.path, raw)))?;
        Utc.timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| Error::Storage(format!("{}: invalid creation time '{}'", self.path, raw)))
    }

    pub async fn snapshot(&self, session: &Session) -> Result<()> {
        self.zfs(session, &format!("snapshot {}", shell_quote(&self.path)))
            .await
            .map(|_| ())
    }

    pub async fn destroy(&self, session: &Session) -> Result<()> {
        self.zfs(session, &format!("destroy {}", shell_quote(&self.path)))
            .await
            .map(|_| ())
    }

    /// Start `zfs send` of this snapshot piped into `transport`. The returned
    /// process streams the pipeline's output; its exit status is the caller's
    /// to await.
    pub async fn send(
        &self,
        session: &Session,
        options: &SendOptions,
        transport: &str,
    ) -> Result<Process> {
        let command = format!("{} | {}", self.send_command(options), transport);
        session.spawn(&command).await
    }

    pub fn send_command(&self, options: &SendOptions) -> String {
        let mut command = String::from("zfs send");
        if let Some(base) = &options.incremental_from {
            command.push_str(" -i ");
            command.push_str(&shell_quote(base.path()));
        }
        command.push(' ');
        command.push_str(&shell_quote(&self.path));
        command
    }

    /// `zfs receive` into this dataset, reading the stream from stdin.
    pub fn receive_command(&self, options: &ReceiveOptions) -> String {
        let mut command = String::from("zfs receive");
        if options.force {
            command.push_str(" -F");
        }
        for (property, value) in &options.properties {
            command.push_str(" -o ");
            command.push_str(&shell_quote(&format!("{}={}", property, value)));
        }
        command.push(' ');
        command.push_str(&shell_quote(&self.path));
        command
    }

    /// On-disk version of the pool holding this dataset.
    pub async fn zpool_version(&self, session: &Session) -> Result<u64> {
        let output = session
            .run(&format!(
                "zpool get -H -o value version {}",
                shell_quote(self.pool())
            ))
            .await?;
        if !output.success() {
            return Err(Error::Storage(output.diagnostic()));
        }
        let value = output.stdout.trim();
        parse_pool_version(value).ok_or_else(|| {
            Error::Storage(format!("{}: invalid pool version '{}'", self.pool(), value))
        })
    }

    async fn zfs(&self, session: &Session, args: &str) -> Result<String> {
        let output = session.run(&format!("zfs {}", args)).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(Error::Storage(output.diagnostic()))
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.path)
    }
}

fn parse_pool_version(value: &str) -> Option<u64> {
    match value {
        NO_VALUE => Some(FEATURE_FLAGS_VERSION),
        other => other.parse().ok(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Base snapshot for an incremental stream.
    pub incremental_from: Option<Dataset>,
}

#[derive(Debug, Clone, Default)]
pub struct ReceiveOptions {
    pub force: bool,
    pub properties: Vec<(String, String)>,
}
