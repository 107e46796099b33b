//! Runtime context: the one place process-lifetime registries live.
//!
//! The DSL decoders, the board builder and the executor all receive a
//! reference to this object instead of reaching for globals. One context
//! per process is the expected shape, but nothing enforces it; tests build
//! as many as they like.

use candle_core::Device;
use tsiboard_dsl::{ContractRegistry, HashNameRegistry};
use tsiboard_learn::SetupRegistry;

pub struct RuntimeContext {
    pub hash_names: HashNameRegistry,
    pub contracts: ContractRegistry,
    pub setups: SetupRegistry,
    pub device: Device,
}

impl RuntimeContext {
    pub fn new(device: Device) -> Self {
        RuntimeContext {
            hash_names: HashNameRegistry::new(),
            contracts: ContractRegistry::new(),
            setups: SetupRegistry::new(),
            device,
        }
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new(Device::Cpu)
    }
}
