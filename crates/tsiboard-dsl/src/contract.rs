//! Contract and wave records: frozen DSL bundles addressed by content hash.
//!
//! A contract bundles the circuit text, the two observation texts and the
//! training spec text; a wave record holds one wave file. Identity is the
//! SHA-256 over a length-prefixed concatenation of the texts, so two
//! bundles with the same content always share a hash and any text change
//! produces a new one. The registry hands out frozen records; decoded
//! views are produced on demand and never mutate the record.

use crate::circuit::{self, CircuitInstruction};
use crate::error::{DslError, DslResult};
use crate::jkspec::{self, JkSpecs};
use crate::observation::{self, ObservationSpec};
use crate::wave::{self, WaveSet};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Keys under which DSL segments are snapshotted into a board contract.
pub const SEGMENT_CIRCUIT: &str = "circuit";
pub const SEGMENT_OBSERVATION_SOURCES: &str = "observation.sources";
pub const SEGMENT_OBSERVATION_CHANNELS: &str = "observation.channels";
pub const SEGMENT_JKIMYEI_SPECS: &str = "jkimyei.specs";
pub const SEGMENT_WAVE: &str = "wave";

pub const REQUIRED_SEGMENTS: &[&str] = &[
    SEGMENT_CIRCUIT,
    SEGMENT_OBSERVATION_SOURCES,
    SEGMENT_OBSERVATION_CHANNELS,
    SEGMENT_JKIMYEI_SPECS,
    SEGMENT_WAVE,
];

fn content_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Immutable contract DSL bundle.
#[derive(Debug, Clone, Serialize)]
pub struct ContractRecord {
    pub hash: String,
    pub circuit_dsl: String,
    pub observation_sources_dsl: String,
    pub observation_channels_dsl: String,
    pub jkimyei_specs_dsl: String,
}

impl ContractRecord {
    pub fn new(
        circuit_dsl: impl Into<String>,
        observation_sources_dsl: impl Into<String>,
        observation_channels_dsl: impl Into<String>,
        jkimyei_specs_dsl: impl Into<String>,
    ) -> Self {
        let circuit_dsl = circuit_dsl.into();
        let observation_sources_dsl = observation_sources_dsl.into();
        let observation_channels_dsl = observation_channels_dsl.into();
        let jkimyei_specs_dsl = jkimyei_specs_dsl.into();
        let hash = content_hash(&[
            &circuit_dsl,
            &observation_sources_dsl,
            &observation_channels_dsl,
            &jkimyei_specs_dsl,
        ]);
        ContractRecord {
            hash,
            circuit_dsl,
            observation_sources_dsl,
            observation_channels_dsl,
            jkimyei_specs_dsl,
        }
    }

    pub fn decoded_circuits(&self) -> DslResult<CircuitInstruction> {
        circuit::decode(&self.circuit_dsl)
    }

    pub fn decoded_observation(&self) -> DslResult<ObservationSpec> {
        observation::decode(&self.observation_sources_dsl, &self.observation_channels_dsl)
    }

    pub fn decoded_jkspecs(&self) -> DslResult<JkSpecs> {
        jkspec::decode(&self.jkimyei_specs_dsl)
    }
}

/// Immutable wave DSL bundle.
#[derive(Debug, Clone, Serialize)]
pub struct WaveRecord {
    pub hash: String,
    pub wave_dsl: String,
}

impl WaveRecord {
    pub fn new(wave_dsl: impl Into<String>) -> Self {
        let wave_dsl = wave_dsl.into();
        let hash = content_hash(&[&wave_dsl]);
        WaveRecord { hash, wave_dsl }
    }

    pub fn decoded_waves(&self) -> DslResult<WaveSet> {
        wave::decode(&self.wave_dsl)
    }
}

/// Frozen record store keyed by content hash. Registration decodes every
/// bundled text once up front, so a record that made it into the registry
/// is known to decode.
#[derive(Debug, Default)]
pub struct ContractRegistry {
    contracts: Mutex<BTreeMap<String, Arc<ContractRecord>>>,
    waves: Mutex<BTreeMap<String, Arc<WaveRecord>>>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_contract(&self, record: ContractRecord) -> DslResult<Arc<ContractRecord>> {
        record.decoded_circuits()?;
        record.decoded_observation()?;
        record.decoded_jkspecs()?;
        let record = Arc::new(record);
        let mut contracts = self.contracts.lock().expect("contract registry poisoned");
        Ok(contracts.entry(record.hash.clone()).or_insert(record).clone())
    }

    pub fn register_wave(&self, record: WaveRecord) -> DslResult<Arc<WaveRecord>> {
        record.decoded_waves()?;
        let record = Arc::new(record);
        let mut waves = self.waves.lock().expect("contract registry poisoned");
        Ok(waves.entry(record.hash.clone()).or_insert(record).clone())
    }

    pub fn contract(&self, hash: &str) -> DslResult<Arc<ContractRecord>> {
        self.contracts
            .lock()
            .expect("contract registry poisoned")
            .get(hash)
            .cloned()
            .ok_or_else(|| DslError::compatibility(format!("unknown contract hash: {hash}")))
    }

    pub fn wave(&self, hash: &str) -> DslResult<Arc<WaveRecord>> {
        self.waves
            .lock()
            .expect("contract registry poisoned")
            .get(hash)
            .cloned()
            .ok_or_else(|| DslError::compatibility(format!("unknown wave hash: {hash}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable_and_boundary_sensitive() {
        let a = content_hash(&["ab", "c"]);
        let b = content_hash(&["ab", "c"]);
        let c = content_hash(&["a", "bc"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn registry_rejects_undecodable_bundles() {
        let registry = ContractRegistry::new();
        let record = ContractRecord::new("not a circuit {", "x", "y", "z");
        assert!(registry.register_contract(record).is_err());
        assert!(registry.contract("missing").is_err());
    }

    #[test]
    fn wave_record_hash_tracks_content() {
        let a = WaveRecord::new("WAVE w { MODE run }");
        let b = WaveRecord::new("WAVE w { MODE run }");
        let c = WaveRecord::new("WAVE w { MODE train }");
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.hash, c.hash);
    }
}
