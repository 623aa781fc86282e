//! Transfer protocol: `initialize` (full stream) and `update` (incremental).
//!
//! Order of operations:
//!
//! 1. lock, then bind the status relay (the pair is now live), then check
//!    the preconditions against a fresh read
//! 2. open a session to the source, compare pool versions, snapshot the source
//! 3. start the local receive pipeline (`mbuffer -I | zfs receive`)
//! 4. after the settle delay, start the remote send pipeline
//!    (`zfs send | mbuffer -O`) and mirror its output onto the relay
//! 5. join both pipelines; either failing aborts the run, and a send that
//!    fails before the receiver finishes stops the receiver
//! 6. commit: record the new snapshot on the destination, then the source
//! 7. on update, prune the previous snapshot on both ends
//!
//! Nothing that marks the pair synchronized happens before step 6.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::fmt;
use std::io;
use std::path::Path;

use super::{Pair, State};
use crate::error::{Error, Result};
use crate::exec::{CommandOutput, Session};
use crate::relay::Publisher;
use crate::zfs::{Dataset, ReceiveOptions, SendOptions, RECEIVE_PROPERTIES_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Initialize,
    Update,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Initialize => "INITIALIZE",
            Mode::Update => "UPDATE",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub mode: Mode,
    pub snapshot: String,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    /// Sending relay's closing summary, e.g. `1.2 GiB in 30.0sec @ 40.9 MiB/s`.
    pub throughput: Option<String>,
    /// Snapshot pruned after an update.
    pub pruned: Option<String>,
}

impl Pair {
    pub async fn initialize(&self) -> Result<TransferReport> {
        self.transfer(Mode::Initialize).await
    }

    pub async fn update(&self) -> Result<TransferReport> {
        self.transfer(Mode::Update).await
    }

    async fn transfer(&self, mode: Mode) -> Result<TransferReport> {
        let lock = self.lock().acquire()?;
        let relay = Publisher::bind(&self.paths().socket)?;

        let result = match self.precondition(mode).await {
            Ok(base) => self.run(mode, base.as_deref(), &relay).await,
            Err(e) => Err(e),
        };
        relay.close();

        if let Err(e) = std::fs::remove_dir_all(&self.paths().scratch) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(error = %e, "failed to remove scratch directory");
            }
        }

        match (lock.release(), result) {
            (Err(e), Err(failure)) => {
                tracing::error!(error = %e, "failed to release lock");
                Err(failure)
            }
            (Err(e), Ok(_)) => Err(e),
            (Ok(()), result) => result,
        }
    }

    /// Check the pair may run `mode`, reading state fresh. Returns the
    /// incremental base for an update.
    async fn precondition(&self, mode: Mode) -> Result<Option<String>> {
        self.invalidate().await;
        let observation = self.observe().await?;
        let state = observation.state(self.fingerprint());
        if let State::Inconsistent(reason) = state {
            return Err(Error::State(reason.to_string()));
        }
        match mode {
            Mode::Initialize if state.is_synchronized() => {
                Err(Error::State("cannot initialize a synchronized pair".into()))
            }
            Mode::Initialize => Ok(None),
            Mode::Update if !state.is_synchronized() => {
                Err(Error::State("must initialize a pair before updating".into()))
            }
            Mode::Update => Ok(observation.last_snapshot),
        }
    }

    async fn run(
        &self,
        mode: Mode,
        base: Option<&str>,
        relay: &Publisher,
    ) -> Result<TransferReport> {
        let remote = Session::open(self.shell(), self.ssh().clone()).await?;
        let started = remote.started();

        let prefix = &self.config().property_prefix;
        let name = snapshot_name(prefix, self.fingerprint(), started);
        let next = self.source().at(&name);

        tracing::info!(
            fingerprint = %self.fingerprint(),
            "{} {} {} START",
            next,
            mode,
            self.destination()
        );

        let source_version = self.source().zpool_version(&remote).await?;
        let destination_version = self.destination().zpool_version(self.local()).await?;
        if destination_version < source_version {
            return Err(Error::transfer(
                "zpool version",
                format!(
                    "destination zpool version {} is older than source zpool version {}",
                    destination_version, source_version
                ),
            ));
        }

        let mut receive = ReceiveOptions {
            force: true,
            properties: vec![("readonly".to_string(), "on".to_string())],
        };

        if mode == Mode::Initialize {
            let props = self.properties();
            let source_identity = self.source().to_string();
            let destination_identity = self.destination().to_string();
            self.source()
                .set(&remote, &props.source, &source_identity)
                .await?;
            self.source()
                .set(&remote, &props.destination, &destination_identity)
                .await?;
            receive
                .properties
                .push((props.source.clone(), source_identity));
            receive
                .properties
                .push((props.destination.clone(), destination_identity));
            if let Some(quota) = self.source().get(&remote, "quota").await? {
                if quota != "none" {
                    receive.properties.push(("quota".to_string(), quota));
                }
            }
        }

        // older pools cannot take properties on receive; set them afterwards
        let deferred = if destination_version < RECEIVE_PROPERTIES_VERSION {
            std::mem::take(&mut receive.properties)
        } else {
            Vec::new()
        };

        next.snapshot(&remote)
            .await
            .map_err(|e| Error::transfer("snapshot", format!("{}: {}", next, e)))?;

        let result = self
            .replicate(&remote, &next, base, &receive, relay)
            .await;

        let throughput = match result {
            Ok(throughput) => throughput,
            Err(e) => {
                // uncommitted
                if let Err(cleanup) = next.destroy(&remote).await {
                    tracing::warn!(error = %cleanup, "failed to destroy {}", next);
                }
                return Err(e);
            }
        };

        self.commit(&remote, mode, &name, &deferred).await?;

        let pruned = match (mode, base) {
            (Mode::Update, Some(base)) => {
                self.prune(&remote, base).await;
                Some(base.to_string())
            }
            _ => None,
        };

        tracing::info!(
            fingerprint = %self.fingerprint(),
            "{} {} {} END",
            next,
            mode,
            self.destination()
        );

        Ok(TransferReport {
            mode,
            snapshot: name,
            started,
            finished: Utc::now(),
            throughput,
            pruned,
        })
    }

    /// Run both pipelines and join them. Returns the throughput summary.
    async fn replicate(
        &self,
        remote: &Session,
        next: &Dataset,
        base: Option<&str>,
        receive: &ReceiveOptions,
        relay: &Publisher,
    ) -> Result<Option<String>> {
        let scratch = &self.paths().scratch;
        std::fs::create_dir_all(scratch)?;

        let mbuffer = &self.config().mbuffer;
        let receive_log = scratch.join("mbuffer.log");
        let receive_err = scratch.join("mbuffer.err");
        let receive_command = format!(
            "mbuffer -s {} -m {} -q -I {} -l {} 2>{} | {}",
            mbuffer.block_size,
            mbuffer.memory,
            self.port(),
            receive_log.display(),
            receive_err.display(),
            self.destination().receive_command(receive)
        );
        tracing::debug!(command = %receive_command, "receive");
        let receiver = self.local().spawn(&receive_command).await?;

        let mut transport = format!("mbuffer -s {} -m {}", mbuffer.block_size, mbuffer.memory);
        if let Some(rate) = &mbuffer.rate_limit {
            transport.push_str(&format!(" -R {}", rate));
        }
        transport.push_str(&format!(
            " -O {}:{} >/dev/null",
            self.destination().host(),
            self.port()
        ));
        let send_options = SendOptions {
            incremental_from: base.map(|name| self.source().at(name)),
        };
        tracing::debug!(
            command = %format!("{} | {}", next.send_command(&send_options), transport),
            "send"
        );

        let settle = self.config().settle_delay();
        let sender = async {
            tokio::time::sleep(settle).await;
            let process = next.send(remote, &send_options, &transport).await?;
            process.stream(|chunk| relay.publish(chunk)).await
        };

        let receiving = receiver.wait_with_output();
        tokio::pin!(receiving, sender);

        let sent = tokio::select! {
            received = &mut receiving => {
                check_receive(received?, &receive_err)?;
                check_send(next, sender.await)?
            }
            sent = &mut sender => match check_send(next, sent) {
                Ok(sent) => {
                    check_receive(receiving.await?, &receive_err)?;
                    sent
                }
                Err(e) => {
                    // a receiver that already failed explains the send failure
                    if let Some(Ok(received)) = receiving.as_mut().now_or_never() {
                        check_receive(received, &receive_err)?;
                    }
                    tracing::warn!(error = %e, "send failed, stopping receive pipeline");
                    return Err(e);
                }
            },
        };

        Ok(throughput_summary(&sent.stderr).or_else(|| throughput_summary(&sent.stdout)))
    }

    /// Record the new snapshot, destination before source. `deferred`
    /// properties are written to the destination first.
    async fn commit(
        &self,
        remote: &Session,
        mode: Mode,
        name: &str,
        deferred: &[(String, String)],
    ) -> Result<()> {
        let props = self.properties();
        let local = self.local();
        for (property, value) in deferred {
            self.destination().set(local, property, value).await?;
        }
        if mode == Mode::Initialize {
            self.destination()
                .set(local, &props.fingerprint, self.fingerprint())
                .await?;
        }
        self.destination()
            .set(local, &props.last_snapshot, name)
            .await?;
        self.invalidate().await;
        self.source()
            .set(remote, &props.last_snapshot, name)
            .await?;
        Ok(())
    }

    /// Destroy the previous base snapshot on both ends. Failures are logged.
    async fn prune(&self, remote: &Session, base: &str) {
        let source = self.source().at(base);
        if let Err(e) = source.destroy(remote).await {
            tracing::warn!(error = %e, "failed to destroy {}", source);
        }
        let destination = self.destination().at(base);
        if let Err(e) = destination.destroy(self.local()).await {
            tracing::warn!(error = %e, "failed to destroy {}", destination);
        }
        self.invalidate().await;
    }
}

fn check_receive(received: CommandOutput, relay_err: &Path) -> Result<()> {
    if received.success() {
        return Ok(());
    }
    let mut message = received.diagnostic();
    if let Ok(text) = std::fs::read_to_string(relay_err) {
        let text = text.trim();
        if !text.is_empty() {
            message.push_str("; ");
            message.push_str(text);
        }
    }
    Err(Error::transfer("receive", message))
}

fn check_send(next: &Dataset, sent: Result<CommandOutput>) -> Result<CommandOutput> {
    let sent = sent?;
    if sent.success() {
        Ok(sent)
    } else {
        Err(Error::transfer(
            "send",
            format!("{}: {}", next, sent.diagnostic()),
        ))
    }
}

/// `{prefix}.{fingerprint}.{UTC timestamp}`
pub fn snapshot_name(prefix: &str, fingerprint: &str, at: DateTime<Utc>) -> String {
    format!("{}.{}.{}", prefix, fingerprint, at.format("%Y%m%d%H%M%SZ"))
}

/// Extract the closing `summary:` line that `mbuffer` prints, rewritten as
/// `X in Y sec @ Z`. Progress output separated by carriage returns is skipped.
pub fn throughput_summary(output: &str) -> Option<String> {
    output
        .split(['\r', '\n'])
        .filter_map(|segment| segment.trim().strip_prefix("summary:"))
        .last()
        .map(|summary| summary.trim().replace("- average of", "@"))
}
