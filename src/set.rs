//! The configured collection of pairs.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{self, Config, PairSpec};
use crate::error::{Error, Result};
use crate::exec::Shell;
use crate::pair::Pair;

/// Pairs in configuration order, indexed by port, destination path and
/// fingerprint. Each index is unique.
#[derive(Debug)]
pub struct PairSet {
    pairs: Vec<Pair>,
    by_port: HashMap<u16, usize>,
    by_destination: HashMap<String, usize>,
    by_fingerprint: HashMap<String, usize>,
}

impl PairSet {
    /// Read the pair file named in `config`.
    pub fn load(config: Arc<Config>, shell: Arc<dyn Shell>) -> Result<Self> {
        let specs = config::load_pairs(&config.pairs_file)?;
        Self::from_specs(&specs, config, shell)
    }

    pub fn from_specs(
        specs: &[PairSpec],
        config: Arc<Config>,
        shell: Arc<dyn Shell>,
    ) -> Result<Self> {
        let mut set = Self {
            pairs: Vec::with_capacity(specs.len()),
            by_port: HashMap::new(),
            by_destination: HashMap::new(),
            by_fingerprint: HashMap::new(),
        };
        for spec in specs {
            set.insert(Pair::new(spec, config.clone(), shell.clone()))?;
        }
        Ok(set)
    }

    fn insert(&mut self, pair: Pair) -> Result<()> {
        let destination = pair.destination().path().to_string();
        if self.by_destination.contains_key(&destination) {
            return Err(Error::Configuration(format!(
                "duplicate destination: {}:{}",
                destination,
                pair.port()
            )));
        }
        if self.by_port.contains_key(&pair.port()) {
            return Err(Error::Configuration(format!(
                "duplicate port: {}:{}",
                destination,
                pair.port()
            )));
        }
        if self.by_fingerprint.contains_key(pair.fingerprint()) {
            return Err(Error::Configuration(format!(
                "duplicate source::destination: {}",
                destination
            )));
        }

        let index = self.pairs.len();
        self.by_port.insert(pair.port(), index);
        self.by_destination.insert(destination, index);
        self.by_fingerprint
            .insert(pair.fingerprint().to_string(), index);
        self.pairs.push(pair);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Pair> {
        self.pairs.iter()
    }

    pub fn by_port(&self, port: u16) -> Option<&Pair> {
        self.by_port.get(&port).map(|&i| &self.pairs[i])
    }

    pub fn by_destination(&self, destination: &str) -> Option<&Pair> {
        self.by_destination.get(destination).map(|&i| &self.pairs[i])
    }

    pub fn by_fingerprint(&self, fingerprint: &str) -> Option<&Pair> {
        self.by_fingerprint.get(fingerprint).map(|&i| &self.pairs[i])
    }

    /// Resolve an operator-supplied destination, `[host:]path`. A path with
    /// a `/` must match a destination exactly; a bare name matches the last
    /// path component and must be unambiguous.
    pub fn select(&self, destination: &str) -> Result<&Pair> {
        let path = destination.rsplit(':').next().unwrap_or(destination);
        let found: Vec<&Pair> = if path.contains('/') {
            self.by_destination(path).into_iter().collect()
        } else {
            self.pairs
                .iter()
                .filter(|pair| pair.destination().path().rsplit('/').next() == Some(path))
                .collect()
        };
        match found.as_slice() {
            [pair] => Ok(*pair),
            _ => Err(Error::Configuration(format!(
                "invalid destination: {}",
                destination
            ))),
        }
    }
}

impl<'a> IntoIterator for &'a PairSet {
    type Item = &'a Pair;
    type IntoIter = std::slice::Iter<'a, Pair>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
