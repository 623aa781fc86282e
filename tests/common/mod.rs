//! In-memory stand-in for `zfs` on two hosts, driven through the `Shell` seam.
//!
//! Understands exactly the commands the engine issues: `get`, `set`,
//! `snapshot`, `destroy`, and the `zfs send | mbuffer` / `mbuffer | zfs
//! receive` pipelines. A send hands its stream to the pending receive through
//! a oneshot channel, so the receive completes only after the send has run.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

use zettabee::config::Settings;
use zettabee::exec::{Process, Shell, Target};
use zettabee::{Config, Pair, PairSpec, Result};

pub const SOURCE_HOST: &str = "src01";
pub const DESTINATION_HOST: &str = "dst01";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Dataset {
    pub properties: BTreeMap<String, String>,
    pub creation: i64,
}

/// Stream produced by a send.
#[derive(Debug)]
struct Stream {
    snapshot: String,
    base: Option<String>,
    creation: i64,
}

#[derive(Default)]
struct World {
    hosts: HashMap<String, BTreeMap<String, Dataset>>,
    pending: Option<oneshot::Sender<Stream>>,
    fail_receive: Option<String>,
    fail_send: Option<String>,
    /// Receive pipelines that never exit, like `mbuffer -I` with no sender.
    hang_receive: bool,
    fail_reads: Option<String>,
    read_delay: Option<Duration>,
    unreachable: Option<String>,
    /// `zpool get version` per host; `-` when unset.
    pool_versions: HashMap<String, String>,
    commands: Vec<(String, String)>,
}

#[derive(Clone, Default)]
pub struct FakeZfs {
    world: Arc<Mutex<World>>,
}

impl FakeZfs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, host: &str, name: &str) {
        let mut world = self.world.lock().unwrap();
        world.hosts.entry(host.to_string()).or_default().insert(
            name.to_string(),
            Dataset {
                creation: chrono::Utc::now().timestamp(),
                ..Default::default()
            },
        );
    }

    pub fn exists(&self, host: &str, name: &str) -> bool {
        let world = self.world.lock().unwrap();
        world
            .hosts
            .get(host)
            .map_or(false, |datasets| datasets.contains_key(name))
    }

    pub fn property(&self, host: &str, name: &str, property: &str) -> Option<String> {
        let world = self.world.lock().unwrap();
        world
            .hosts
            .get(host)?
            .get(name)?
            .properties
            .get(property)
            .cloned()
    }

    pub fn set_property(&self, host: &str, name: &str, property: &str, value: &str) {
        let mut world = self.world.lock().unwrap();
        world
            .hosts
            .get_mut(host)
            .and_then(|datasets| datasets.get_mut(name))
            .expect("dataset exists")
            .properties
            .insert(property.to_string(), value.to_string());
    }

    pub fn set_creation(&self, host: &str, name: &str, creation: i64) {
        let mut world = self.world.lock().unwrap();
        world
            .hosts
            .get_mut(host)
            .and_then(|datasets| datasets.get_mut(name))
            .expect("dataset exists")
            .creation = creation;
    }

    /// Snapshot names (after `@`) of `filesystem` on `host`.
    pub fn snapshots(&self, host: &str, filesystem: &str) -> Vec<String> {
        let world = self.world.lock().unwrap();
        let prefix = format!("{}@", filesystem);
        world
            .hosts
            .get(host)
            .map(|datasets| {
                datasets
                    .keys()
                    .filter_map(|name| name.strip_prefix(&prefix).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every dataset on every host, for before/after comparisons.
    pub fn dump(&self) -> BTreeMap<String, BTreeMap<String, Dataset>> {
        let world = self.world.lock().unwrap();
        world
            .hosts
            .iter()
            .map(|(host, datasets)| (host.clone(), datasets.clone()))
            .collect()
    }

    pub fn fail_receive(&self, message: &str) {
        self.world.lock().unwrap().fail_receive = Some(message.to_string());
    }

    pub fn fail_send(&self, message: &str) {
        self.world.lock().unwrap().fail_send = Some(message.to_string());
    }

    pub fn hang_receive(&self) {
        self.world.lock().unwrap().hang_receive = true;
    }

    /// Make every `zfs get` fail with `message`.
    pub fn fail_reads(&self, message: &str) {
        self.world.lock().unwrap().fail_reads = Some(message.to_string());
    }

    /// Make every `zfs get` take `delay` to exit.
    pub fn delay_reads(&self, delay: Duration) {
        self.world.lock().unwrap().read_delay = Some(delay);
    }

    /// Fail every command sent to `host` the way `ssh` does when it cannot
    /// connect.
    pub fn unreachable(&self, host: &str) {
        self.world.lock().unwrap().unreachable = Some(host.to_string());
    }

    pub fn set_pool_version(&self, host: &str, version: &str) {
        self.world
            .lock()
            .unwrap()
            .pool_versions
            .insert(host.to_string(), version.to_string());
    }

    pub fn commands(&self) -> Vec<(String, String)> {
        self.world.lock().unwrap().commands.clone()
    }

    fn execute(&self, host: &str, command: &str) -> Process {
        let (unreachable, fail_reads, pool_version) = {
            let mut world = self.world.lock().unwrap();
            world
                .commands
                .push((host.to_string(), command.to_string()));
            (
                world.unreachable.as_deref() == Some(host),
                world.fail_reads.clone(),
                world.pool_versions.get(host).cloned(),
            )
        };

        if unreachable {
            return done(
                255,
                "",
                &format!("ssh: connect to host {} port 22: Connection refused\n", host),
            );
        }
        if command == "true" {
            return done(0, "", "");
        }
        if command.starts_with("zpool get -H -o value version ") {
            let version = pool_version.unwrap_or_else(|| "-".to_string());
            return done(0, &format!("{}\n", version), "");
        }
        if let (Some(message), true) = (fail_reads, command.starts_with("zfs get")) {
            return done(1, "", &format!("{}\n", message));
        }
        if command.contains("zfs receive") {
            return self.receive(host, command);
        }
        if command.contains("zfs send") {
            return self.send(host, command);
        }

        let args = words(command);
        let mut world = self.world.lock().unwrap();
        let datasets = world.hosts.entry(host.to_string()).or_default();
        match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
            ["zfs", "get", "-H", rest @ ..] => {
                let (parsable, rest) = match rest {
                    ["-p", rest @ ..] => (true, rest),
                    rest => (false, rest),
                };
                let ["-o", "value", property, name] = rest else {
                    return done(2, "", "bad get");
                };
                let Some(dataset) = datasets.get(*name) else {
                    return missing(name);
                };
                let value = match *property {
                    "creation" if parsable => dataset.creation.to_string(),
                    "creation" => format!("@{}", dataset.creation),
                    "quota" => dataset
                        .properties
                        .get("quota")
                        .cloned()
                        .unwrap_or_else(|| "none".to_string()),
                    other => dataset
                        .properties
                        .get(other)
                        .cloned()
                        .unwrap_or_else(|| "-".to_string()),
                };
                done(0, &format!("{}\n", value), "")
            }
            ["zfs", "set", assignment, name] => {
                let Some(dataset) = datasets.get_mut(*name) else {
                    return missing(name);
                };
                let (property, value) = assignment.split_once('=').unwrap();
                dataset
                    .properties
                    .insert(property.to_string(), value.to_string());
                done(0, "", "")
            }
            ["zfs", "snapshot", name] => {
                let (filesystem, _) = name.split_once('@').unwrap();
                if !datasets.contains_key(filesystem) {
                    return missing(filesystem);
                }
                if datasets.contains_key(*name) {
                    return done(1, "", &format!("cannot create snapshot '{}': dataset already exists\n", name));
                }
                datasets.insert(
                    name.to_string(),
                    Dataset {
                        creation: chrono::Utc::now().timestamp(),
                        ..Default::default()
                    },
                );
                done(0, "", "")
            }
            ["zfs", "destroy", name] => {
                if datasets.remove(*name).is_none() {
                    return missing(name);
                }
                done(0, "", "")
            }
            _ => done(127, "", &format!("fake zfs: unsupported command: {}\n", command)),
        }
    }

    fn send(&self, host: &str, command: &str) -> Process {
        let segment = command.split('|').next().unwrap_or_default();
        let args = words(segment);
        let (base, name) = match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
            ["zfs", "send", "-i", base, name] => (Some(base.to_string()), name.to_string()),
            ["zfs", "send", name] => (None, name.to_string()),
            _ => return done(2, "", "bad send"),
        };

        let mut world = self.world.lock().unwrap();
        let pending = world.pending.take();
        if let Some(message) = world.fail_send.clone() {
            return done(1, "", &format!("{}\n", message));
        }
        let datasets = world.hosts.entry(host.to_string()).or_default();
        let Some(snapshot) = datasets.get(&name) else {
            return missing(&name);
        };
        if let Some(base) = &base {
            if !datasets.contains_key(base) {
                return missing(base);
            }
        }

        let stream = Stream {
            snapshot: snapshot_of(&name),
            base: base.as_deref().map(snapshot_of),
            creation: snapshot.creation,
        };
        match pending {
            Some(tx) => {
                let _ = tx.send(stream);
                done(
                    0,
                    "",
                    "in @ 10.0 MiB/s, out @ 10.0 MiB/s\rsummary:  1.0 MiByte in  0.1sec - average of 10.0 MiB/s\n",
                )
            }
            None => done(1, "", "mbuffer: error: connection refused\n"),
        }
    }

    fn receive(&self, host: &str, command: &str) -> Process {
        let segment = command
            .split('|')
            .find(|s| s.contains("zfs receive"))
            .unwrap_or_default();
        let args = words(segment);
        let destination = args.last().cloned().unwrap_or_default();
        let mut properties = BTreeMap::new();
        let mut iter = args.iter().skip(2);
        while let Some(arg) = iter.next() {
            if arg == "-o" {
                if let Some((k, v)) = iter.next().and_then(|kv| kv.split_once('=')) {
                    properties.insert(k.to_string(), v.to_string());
                }
            }
        }

        let (tx, rx) = oneshot::channel::<Stream>();
        let (fail, hang) = {
            let mut world = self.world.lock().unwrap();
            world.pending = Some(tx);
            (world.fail_receive.clone(), world.hang_receive)
        };
        if let Some(message) = fail {
            return done(1, "", &format!("{}\n", message));
        }
        if hang {
            return Process::new(
                Cursor::new(Vec::new()),
                Cursor::new(Vec::new()),
                std::future::pending(),
            );
        }

        let world = self.world.clone();
        let host = host.to_string();
        let exit = async move {
            let Ok(stream) = rx.await else {
                return Ok(Some(1));
            };
            let mut world = world.lock().unwrap();
            let datasets = world.hosts.entry(host).or_default();
            match &stream.base {
                None => {
                    let filesystem = datasets.entry(destination.clone()).or_insert_with(|| Dataset {
                        creation: chrono::Utc::now().timestamp(),
                        ..Default::default()
                    });
                    filesystem.properties.extend(properties);
                }
                Some(base) => {
                    if !datasets.contains_key(&format!("{}@{}", destination, base)) {
                        return Ok(Some(1));
                    }
                    if let Some(filesystem) = datasets.get_mut(&destination) {
                        filesystem.properties.extend(properties);
                    }
                }
            }
            datasets.insert(
                format!("{}@{}", destination, stream.snapshot),
                Dataset {
                    creation: stream.creation,
                    ..Default::default()
                },
            );
            Ok(Some(0))
        };
        Process::new(Cursor::new(Vec::new()), Cursor::new(Vec::new()), exit)
    }
}

#[async_trait]
impl Shell for FakeZfs {
    async fn spawn(&self, target: &Target, command: &str) -> Result<Process> {
        let host = match target {
            Target::Local => DESTINATION_HOST,
            Target::Remote(ssh) => ssh.hostname.as_str(),
        };
        let delay = self.world.lock().unwrap().read_delay;
        if let (Some(delay), true) = (delay, command.starts_with("zfs get")) {
            tokio::time::sleep(delay).await;
        }
        Ok(self.execute(host, command))
    }
}

fn done(code: i32, stdout: &str, stderr: &str) -> Process {
    Process::new(
        Cursor::new(stdout.as_bytes().to_vec()),
        Cursor::new(stderr.as_bytes().to_vec()),
        async move { Ok(Some(code)) },
    )
}

fn missing(name: &str) -> Process {
    done(
        1,
        "",
        &format!("cannot open '{}': dataset does not exist\n", name),
    )
}

fn snapshot_of(name: &str) -> String {
    name.split_once('@')
        .map(|(_, snap)| snap.to_string())
        .unwrap_or_default()
}

fn words(command: &str) -> Vec<String> {
    command
        .split_whitespace()
        .map(|w| w.trim_matches('\'').to_string())
        .collect()
}

/// A pair `src01:tank/home -> dst01:backup/home` on port 9001 whose local
/// directories live under `root`.
pub fn pair(root: &Path, zfs: &FakeZfs, settle_delay_secs: u64) -> Pair {
    pair_with_settings(root, zfs, settle_delay_secs, Settings::default())
}

pub fn pair_with_settings(
    root: &Path,
    zfs: &FakeZfs,
    settle_delay_secs: u64,
    settings: Settings,
) -> Pair {
    let config = Config {
        run_dir: root.join("run"),
        log_dir: root.join("log"),
        tmp_dir: root.join("tmp"),
        etc_dir: root.join("etc"),
        settle_delay_secs,
        settings,
        ..Default::default()
    };
    config.setup().unwrap();

    let mut spec = PairSpec::new(
        &format!("{}:tank/home", SOURCE_HOST),
        &format!("{}:backup/home", DESTINATION_HOST),
        9001,
    )
    .unwrap();
    spec.wlag = std::time::Duration::from_secs(3600);
    spec.clag = std::time::Duration::from_secs(7200);

    Pair::new(&spec, Arc::new(config), Arc::new(zfs.clone()))
}

/// A fake world with the source filesystem present and nothing on the
/// destination.
pub fn fresh() -> FakeZfs {
    let zfs = FakeZfs::new();
    zfs.create(SOURCE_HOST, "tank/home");
    zfs.create(DESTINATION_HOST, "backup");
    zfs
}
