use crate::NativeRuntime;
use weightline_core::config::{AdapterConfig, ConfigBlock};
use weightline_core::error::{Error, Result};
use weightline_core::special::SpecialTokenSet;
use weightline_core::vocab::VocabEntry;
use weightline_core::weight::{RecordPayload, WeightRecord};

/// Where a model handle is in the submission protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyState {
    Created,
    ConfigLoaded,
    VocabLoaded,
    WeightsLoaded,
    Finalized,
    /// A runtime call failed; the handle accepts nothing more
    Aborted,
}

/// Drives one model handle through config, vocabulary, weights and
/// finalization, strictly in that order.
///
/// Calls out of order fail with `ProtocolViolation` and leave the state
/// untouched. A failing runtime call moves the assembly to `Aborted`.
pub struct ModelAssembly<'r, R: NativeRuntime> {
    runtime: &'r mut R,
    handle: R::Handle,
    family: String,
    state: AssemblyState,
    weights: usize,
}

impl<'r, R: NativeRuntime> ModelAssembly<'r, R> {
    pub fn create(runtime: &'r mut R, family: &str) -> Result<Self> {
        let handle = runtime.create_model(family)?;
        log::debug!("Assembling {} model as {:?}", family, handle);
        Ok(Self { runtime, handle, family: family.to_string(), state: AssemblyState::Created, weights: 0 })
    }

    pub fn state(&self) -> AssemblyState {
        self.state
    }

    pub fn handle(&self) -> R::Handle {
        self.handle
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn weight_count(&self) -> usize {
        self.weights
    }

    /// Runtime under assembly, for inspection
    pub fn runtime(&self) -> &R {
        self.runtime
    }

    fn require_state(&self, op: &str, allowed: &[AssemblyState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::ProtocolViolation(format!(
                "{} is not allowed in state {:?}",
                op, self.state
            )))
        }
    }

    /// Run one runtime call, aborting the assembly if it fails
    fn submit<F>(&mut self, call: F) -> Result<()>
    where
        F: FnOnce(&mut R, R::Handle) -> Result<()>,
    {
        let result = call(&mut *self.runtime, self.handle);
        if let Err(e) = &result {
            log::debug!("Aborting {:?}: {}", self.handle, e);
            self.state = AssemblyState::Aborted;
        }
        result
    }

    /// Submit config entries, then adapter configs, then the active adapter
    pub fn load_config(
        &mut self,
        config: &ConfigBlock,
        adapters: &[AdapterConfig],
        active_adapter: Option<&str>,
    ) -> Result<()> {
        self.require_state("load_config", &[AssemblyState::Created])?;
        if let Some(active) = active_adapter {
            if !adapters.iter().any(|a| a.name == active) {
                return Err(Error::InvalidArgument(format!("active adapter {} has no config", active)));
            }
        }

        for entry in config.iter() {
            self.submit(|rt, h| rt.set_config(h, &entry.key, &entry.value))?;
        }
        for adapter in adapters {
            for entry in adapter.entries.iter() {
                self.submit(|rt, h| rt.set_adapter_config(h, &adapter.name, &entry.key, &entry.value))?;
            }
        }
        if let Some(active) = active_adapter {
            self.submit(|rt, h| rt.set_active_adapter(h, active))?;
        }
        self.state = AssemblyState::ConfigLoaded;
        Ok(())
    }

    /// Submit the vocabulary one entry at a time, then the special tokens
    pub fn load_vocab(&mut self, entries: &[VocabEntry], special: Option<&SpecialTokenSet>) -> Result<()> {
        self.require_state("load_vocab", &[AssemblyState::ConfigLoaded])?;
        let special = match special {
            Some(set) => Some((to_wire(&set.lengths)?, to_wire(&set.ids)?, set.text.as_slice())),
            None => None,
        };

        let ids = entries.iter().map(|e| to_wire_one(e.id)).collect::<Result<Vec<_>>>()?;

        for (entry, id) in entries.iter().zip(ids) {
            self.submit(|rt, h| rt.add_vocab_entry(h, &entry.bytes, id, entry.score))?;
        }
        if let Some((lengths, ids, text)) = special {
            self.submit(|rt, h| rt.set_special_tokens(h, &lengths, text, &ids))?;
        }
        self.state = AssemblyState::VocabLoaded;
        Ok(())
    }

    /// Submit one record; its buffers are dropped once the runtime has it
    pub fn add_weight(&mut self, record: WeightRecord) -> Result<()> {
        self.require_state("add_weight", &[AssemblyState::VocabLoaded, AssemblyState::WeightsLoaded])?;
        record.validate()?;
        let shape = record.shape.to_native()?;
        let name = record.name.as_str();

        match &record.payload {
            RecordPayload::Dense { source_dtype, target_dtype, data } => self.submit(|rt, h| {
                rt.add_weight(h, name, &shape, *target_dtype, record.kind, *source_dtype, data)
            })?,
            RecordPayload::Quantized { bit_width, scales, packed } => self.submit(|rt, h| {
                rt.add_quantized_weight(h, name, &shape, *bit_width, scales, packed)
            })?,
        }
        self.weights += 1;
        self.state = AssemblyState::WeightsLoaded;
        Ok(())
    }

    /// Initialize parameters then warm up, exactly once
    pub fn finalize(&mut self) -> Result<()> {
        self.require_state("finalize", &[AssemblyState::WeightsLoaded])?;
        self.submit(|rt, h| rt.init_params(h))?;
        self.submit(|rt, h| rt.warmup(h))?;
        self.state = AssemblyState::Finalized;
        log::debug!("Finalized {:?} with {} weights", self.handle, self.weights);
        Ok(())
    }
}

fn to_wire_one(v: u32) -> Result<i32> {
    i32::try_from(v).map_err(|_| Error::InvalidArgument(format!("{} does not fit in i32", v)))
}

fn to_wire(values: &[u32]) -> Result<Vec<i32>> {
    values.iter().map(|&v| to_wire_one(v)).collect()
}
