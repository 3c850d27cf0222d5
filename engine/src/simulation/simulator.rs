//! Model-checked random workloads.
//!
//! The simulator drives a tree with a seeded stream of inserts, removals,
//! updates and lookups and mirrors every step in a `BTreeMap`. Any answer
//! that disagrees with the model, and any structural invariant the tree
//! stops satisfying, is recorded as a violation.
//!
//! Storage faults are only switched on while the file is checkpointed, so
//! they can damage what reaches storage but never a descent in progress.
//! A block whose checksum no longer matches is reported the next time it
//! is loaded; that ends the run without counting as a violation.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::btree2::{
    BTree2, BTreeError, CreateParams, IterOrder, KeyValue, KeyValueClass, Neighbor, UpdateOutcome,
    Walk,
};
use crate::storage::{FileOptions, IndexFile};

use super::storage::{FaultConfig, SimulatedStorage};

/// Configuration for the simulator.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility.
    pub seed: u64,
    /// Faults injected while checkpointing.
    pub fault_config: FaultConfig,
    /// Keys are drawn from `0..key_space`.
    pub key_space: u64,
    /// Tree creation parameters.
    pub params: CreateParams,
    /// Run the file in SWMR mode and advance the shadow epoch at every checkpoint.
    pub swmr_write: bool,
    /// Operations between checkpoints (flush, evict).
    pub checkpoint_interval: u64,
    /// Operations between full invariant checks.
    pub check_interval: u64,
}

impl SimulatorConfig {
    /// Create a new simulator config with the given seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            fault_config: FaultConfig::no_faults(),
            key_space: 500,
            params: CreateParams {
                node_size: 128,
                ..CreateParams::default()
            },
            swmr_write: false,
            checkpoint_interval: 50,
            check_interval: 10,
        }
    }

    /// Set the fault configuration.
    #[must_use]
    pub const fn with_fault_config(mut self, config: FaultConfig) -> Self {
        self.fault_config = config;
        self
    }

    #[must_use]
    pub const fn with_key_space(mut self, key_space: u64) -> Self {
        self.key_space = key_space;
        self
    }

    #[must_use]
    pub const fn with_params(mut self, params: CreateParams) -> Self {
        self.params = params;
        self
    }

    /// Relocate modified nodes once per checkpoint.
    #[must_use]
    pub const fn with_swmr_write(mut self) -> Self {
        self.swmr_write = true;
        self
    }
}

/// Results from a simulation run.
#[derive(Debug, Default)]
pub struct SimulationResult {
    /// The seed used for this simulation.
    pub seed: u64,
    /// Number of operations run.
    pub operations: u64,
    /// Operations that changed the tree.
    pub mutations: u64,
    /// Operations that failed the way the model said they would
    /// (duplicate, missing record, rank out of range).
    pub expected_failures: u64,
    /// Checkpoints that failed on an injected fault.
    pub failed_checkpoints: u64,
    /// A damaged block was detected and the run stopped.
    pub detected_corruption: bool,
    /// Records in the tree at the end of the run.
    pub final_records: u64,
    /// Depth of the tree at the end of the run.
    pub final_depth: u16,
    /// Invariant violations detected.
    pub invariant_violations: Vec<String>,
    /// Whether the simulation ran to the end or stopped on detected damage.
    pub completed_successfully: bool,
    /// Error message if simulation failed.
    pub error: Option<String>,
}

impl SimulationResult {
    /// Check if the simulation passed (no invariant violations).
    #[must_use]
    pub const fn passed(&self) -> bool {
        self.completed_successfully && self.invariant_violations.is_empty()
    }
}

/// How a single step ended, as far as the run is concerned.
enum StepError {
    /// The tree answered differently from the model.
    Violation(String),
    /// Damaged storage was detected; nothing after this can be trusted.
    Damaged(BTreeError),
    /// Any other error.
    Failed(BTreeError),
}

impl From<BTreeError> for StepError {
    fn from(e: BTreeError) -> Self {
        match e {
            BTreeError::ChecksumMismatch { .. } | BTreeError::Corrupt(_) | BTreeError::Storage(_) => {
                Self::Damaged(e)
            }
            other => Self::Failed(other),
        }
    }
}

type StepResult = Result<(), StepError>;

/// The main simulator harness.
pub struct Simulator {
    config: SimulatorConfig,
    rng: StdRng,
    model: BTreeMap<u64, u64>,
    result: SimulationResult,
}

impl Simulator {
    /// Create a new simulator with the given configuration.
    #[must_use]
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        let result = SimulationResult {
            seed: config.seed,
            ..SimulationResult::default()
        };
        Self {
            config,
            rng,
            model: BTreeMap::new(),
            result,
        }
    }

    /// Run `operation_count` random operations against a fresh tree.
    pub fn run(mut self, operation_count: u64) -> SimulationResult {
        let storage = SimulatedStorage::with_config(self.config.seed, FaultConfig::no_faults());
        let options = FileOptions {
            swmr_write: self.config.swmr_write,
            ..FileOptions::default()
        };
        let mut file = match IndexFile::create(storage, options) {
            Ok(file) => file,
            Err(e) => return self.fail(format!("failed to create file: {e}")),
        };
        let tree = match BTree2::create(&mut file, KeyValueClass, self.config.params) {
            Ok(tree) => tree,
            Err(e) => return self.fail(format!("failed to create tree: {e}")),
        };

        info!(
            seed = self.config.seed,
            operation_count,
            swmr_write = self.config.swmr_write,
            "simulation started"
        );

        for step in 1..=operation_count {
            self.result.operations += 1;
            let mut outcome = self.step(&mut file, &tree);
            if outcome.is_ok() && step % self.config.check_interval == 0 {
                outcome = self.check(&mut file, &tree);
            }
            if outcome.is_ok() && step % self.config.checkpoint_interval == 0 {
                outcome = self.checkpoint(&mut file, &tree);
            }

            match outcome {
                Ok(()) => {}
                Err(StepError::Violation(message)) => {
                    warn!(seed = self.config.seed, step, %message, "invariant violated");
                    self.result.invariant_violations.push(message);
                    return self.finish(&mut file, &tree, true);
                }
                Err(StepError::Damaged(e)) => {
                    info!(seed = self.config.seed, step, error = %e, "damaged block detected");
                    self.result.detected_corruption = true;
                    self.result.error = Some(e.to_string());
                    return self.finish(&mut file, &tree, true);
                }
                Err(StepError::Failed(e)) => {
                    self.result.error = Some(format!("step {step}: {e}"));
                    return self.finish(&mut file, &tree, false);
                }
            }
        }

        let outcome = self.check(&mut file, &tree);
        if let Err(StepError::Violation(message)) = outcome {
            self.result.invariant_violations.push(message);
        }
        self.finish(&mut file, &tree, true)
    }

    fn fail(mut self, message: String) -> SimulationResult {
        self.result.error = Some(message);
        self.result
    }

    fn finish(
        mut self,
        file: &mut IndexFile<SimulatedStorage>,
        tree: &BTree2<KeyValueClass>,
        completed: bool,
    ) -> SimulationResult {
        self.result.final_records = self.model.len() as u64;
        self.result.final_depth = tree.depth(file).unwrap_or_default();
        self.result.completed_successfully = completed;
        info!(
            seed = self.result.seed,
            operations = self.result.operations,
            mutations = self.result.mutations,
            violations = self.result.invariant_violations.len(),
            "simulation finished"
        );
        self.result
    }

    fn random_key(&mut self) -> u64 {
        self.rng.random_range(0..self.config.key_space)
    }

    fn step(
        &mut self,
        file: &mut IndexFile<SimulatedStorage>,
        tree: &BTree2<KeyValueClass>,
    ) -> StepResult {
        match self.rng.random_range(0..100) {
            0..40 => self.insert(file, tree),
            40..60 => self.remove(file, tree),
            60..70 => self.remove_by_rank(file, tree),
            70..80 => self.update(file, tree),
            80..90 => self.modify(file, tree),
            _ => self.lookup(file, tree),
        }
    }

    fn insert(
        &mut self,
        file: &mut IndexFile<SimulatedStorage>,
        tree: &BTree2<KeyValueClass>,
    ) -> StepResult {
        let record = KeyValue {
            key: self.random_key(),
            value: self.rng.random(),
        };
        match tree.insert(file, &record) {
            Ok(()) if !self.model.contains_key(&record.key) => {
                self.model.insert(record.key, record.value);
                self.result.mutations += 1;
                Ok(())
            }
            Err(BTreeError::DuplicateRecord) if self.model.contains_key(&record.key) => {
                self.result.expected_failures += 1;
                Ok(())
            }
            Ok(()) => Err(violation(format!("inserted duplicate key {}", record.key))),
            Err(BTreeError::DuplicateRecord) => Err(violation(format!(
                "key {} reported duplicate but is absent",
                record.key
            ))),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(
        &mut self,
        file: &mut IndexFile<SimulatedStorage>,
        tree: &BTree2<KeyValueClass>,
    ) -> StepResult {
        let key = self.random_key();
        let expected = self.model.get(&key).copied();
        match (tree.remove(file, &key), expected) {
            (Ok(record), Some(value)) => {
                self.model.remove(&key);
                self.result.mutations += 1;
                expect_record(record, key, value)
            }
            (Err(BTreeError::RecordNotFound), None) => {
                self.result.expected_failures += 1;
                Ok(())
            }
            (Ok(record), None) => Err(violation(format!("removed absent key {}", record.key))),
            (Err(BTreeError::RecordNotFound), Some(_)) => {
                Err(violation(format!("key {key} not found for removal")))
            }
            (Err(e), _) => Err(e.into()),
        }
    }

    fn remove_by_rank(
        &mut self,
        file: &mut IndexFile<SimulatedStorage>,
        tree: &BTree2<KeyValueClass>,
    ) -> StepResult {
        let len = self.model.len() as u64;
        let n = self.rng.random_range(0..len + 2);
        let order = if self.rng.random_bool(0.5) {
            IterOrder::Ascending
        } else {
            IterOrder::Descending
        };
        let expected = rank_of(&self.model, order, n);

        match (tree.remove_by_idx(file, order, n), expected) {
            (Ok(record), Some((key, value))) => {
                self.model.remove(&key);
                self.result.mutations += 1;
                expect_record(record, key, value)
            }
            (Err(BTreeError::IndexOutOfRange { .. }), None) => {
                self.result.expected_failures += 1;
                Ok(())
            }
            (Ok(record), None) => Err(violation(format!(
                "rank {n} of {len} removed key {}",
                record.key
            ))),
            (Err(BTreeError::IndexOutOfRange { .. }), Some(_)) => {
                Err(violation(format!("rank {n} of {len} reported out of range")))
            }
            (Err(e), _) => Err(e.into()),
        }
    }

    fn update(
        &mut self,
        file: &mut IndexFile<SimulatedStorage>,
        tree: &BTree2<KeyValueClass>,
    ) -> StepResult {
        let key = self.random_key();
        let value = self.rng.random_range(0..4);
        let record = KeyValue { key, value };
        let outcome = tree.update(file, &record, |r| {
            let changed = r.value != value;
            r.value = value;
            changed
        })?;

        let expected = match self.model.insert(key, value) {
            None => UpdateOutcome::Inserted,
            Some(old) if old == value => UpdateOutcome::Unchanged,
            Some(_) => UpdateOutcome::Modified,
        };
        if outcome != expected {
            return Err(violation(format!(
                "update of key {key} returned {outcome:?}, expected {expected:?}"
            )));
        }
        if outcome != UpdateOutcome::Unchanged {
            self.result.mutations += 1;
        }
        Ok(())
    }

    fn modify(
        &mut self,
        file: &mut IndexFile<SimulatedStorage>,
        tree: &BTree2<KeyValueClass>,
    ) -> StepResult {
        let key = self.random_key();
        let value: u64 = self.rng.random();
        let result = tree.modify(file, &key, |r| {
            r.value = value;
            true
        });
        match (result, self.model.get_mut(&key)) {
            (Ok(true), Some(stored)) => {
                *stored = value;
                self.result.mutations += 1;
                Ok(())
            }
            (Err(BTreeError::RecordNotFound), None) => {
                self.result.expected_failures += 1;
                Ok(())
            }
            (Ok(_), None) => Err(violation(format!("modified absent key {key}"))),
            (Ok(false), Some(_)) => Err(violation(format!("modify of key {key} reported no change"))),
            (Err(BTreeError::RecordNotFound), Some(_)) => {
                Err(violation(format!("key {key} not found for modify")))
            }
            (Err(e), _) => Err(e.into()),
        }
    }

    fn lookup(
        &mut self,
        file: &mut IndexFile<SimulatedStorage>,
        tree: &BTree2<KeyValueClass>,
    ) -> StepResult {
        let key = self.random_key();
        let found = tree.find(file, &key)?.map(|r| r.value);
        if found != self.model.get(&key).copied() {
            return Err(violation(format!(
                "find({key}) returned {found:?}, model holds {:?}",
                self.model.get(&key)
            )));
        }

        let less = self.model.range(..key).next_back().map(|(k, _)| *k);
        let greater = self.model.range(key + 1..).next().map(|(k, _)| *k);
        for (direction, expected) in [(Neighbor::Less, less), (Neighbor::Greater, greater)] {
            let actual = match tree.neighbor(file, direction, &key) {
                Ok(record) => Some(record.key),
                Err(BTreeError::RecordNotFound) => None,
                Err(e) => return Err(e.into()),
            };
            if actual != expected {
                return Err(violation(format!(
                    "{direction:?} neighbor of {key} is {actual:?}, expected {expected:?}"
                )));
            }
        }
        Ok(())
    }

    /// Compare the whole tree with the model.
    fn check(
        &mut self,
        file: &mut IndexFile<SimulatedStorage>,
        tree: &BTree2<KeyValueClass>,
    ) -> StepResult {
        match tree.check_invariants(file) {
            Ok(()) => {}
            Err(BTreeError::Corrupt(message)) => return Err(violation(message)),
            Err(e) => return Err(e.into()),
        }

        let nrec = tree.get_nrec(file)?;
        if nrec != self.model.len() as u64 {
            return Err(violation(format!(
                "tree holds {nrec} records, model holds {}",
                self.model.len()
            )));
        }

        let mut expected = self.model.iter();
        let mut mismatch = None;
        tree.iterate(file, |record| match expected.next() {
            Some((&key, &value)) if key == record.key && value == record.value => Walk::Continue,
            other => {
                mismatch = Some(format!("walk reached {record:?}, model has {other:?}"));
                Walk::Stop
            }
        })?;
        match mismatch {
            Some(message) => Err(violation(message)),
            None => Ok(()),
        }
    }

    /// Flush and evict with faults switched on, then advance the epoch.
    fn checkpoint(
        &mut self,
        file: &mut IndexFile<SimulatedStorage>,
        tree: &BTree2<KeyValueClass>,
    ) -> StepResult {
        file.storage_mut()
            .set_fault_config(self.config.fault_config.clone());
        let evicted = file.evict();
        file.storage_mut().set_fault_config(FaultConfig::no_faults());

        match evicted {
            Ok(count) => debug!(evicted = count, "checkpoint"),
            Err(e) => {
                self.result.failed_checkpoints += 1;
                debug!(error = %e, "checkpoint failed");
            }
        }
        if self.config.swmr_write {
            tree.advance_shadow_epoch(file)?;
        }
        Ok(())
    }
}

const fn violation(message: String) -> StepError {
    StepError::Violation(message)
}

fn expect_record(record: KeyValue, key: u64, value: u64) -> StepResult {
    if record.key == key && record.value == value {
        Ok(())
    } else {
        Err(violation(format!(
            "removed {record:?}, expected {key} => {value}"
        )))
    }
}

/// The record at rank `n` of the model in the given order.
fn rank_of(model: &BTreeMap<u64, u64>, order: IterOrder, n: u64) -> Option<(u64, u64)> {
    let n = usize::try_from(n).ok()?;
    let entry = match order {
        IterOrder::Ascending => model.iter().nth(n),
        IterOrder::Descending => model.iter().rev().nth(n),
    };
    entry.map(|(k, v)| (*k, *v))
}
