//! Runtime signals, waves and the node capability set.
//!
//! A signal is what crosses a hop: a string or a tensor payload. Tensor
//! payloads carry their validity mask alongside the data so an
//! `[B,C,T,D]` observation and its `[B,C,T]` mask travel as one
//! `tensor`-kind signal; the wire kind the registry checks is unchanged.

use crate::error::RuntimeResult;
use candle_core::Tensor;
use tsiboard_types::{find_tsi_type, DirectiveId, PayloadKind, TsiTypeId};

#[derive(Debug, Clone)]
pub struct TensorPayload {
    pub data: Tensor,
    pub mask: Option<Tensor>,
}

#[derive(Debug, Clone)]
pub enum Signal {
    Str(String),
    Tensor(TensorPayload),
}

impl Signal {
    pub fn text(text: impl Into<String>) -> Self {
        Signal::Str(text.into())
    }

    pub fn tensor(data: Tensor) -> Self {
        Signal::Tensor(TensorPayload { data, mask: None })
    }

    pub fn tensor_with_mask(data: Tensor, mask: Tensor) -> Self {
        Signal::Tensor(TensorPayload { data, mask: Some(mask) })
    }

    pub fn kind(&self) -> PayloadKind {
        match self {
            Signal::Str(_) => PayloadKind::Str,
            Signal::Tensor(_) => PayloadKind::Tensor,
        }
    }
}

/// Mutable position of a wave inside its execution envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaveCursor {
    pub id: u64,
    pub i: u64,
    pub episode: u64,
    pub batch: u64,
}

/// The execution envelope driving one contract.
#[derive(Debug, Clone, Copy, Default)]
pub struct Wave {
    pub cursor: WaveCursor,
    pub max_batches_per_epoch: u64,
    pub has_time_span: bool,
    pub span_begin_ms: i64,
    pub span_end_ms: i64,
}

/// Normalize the span so `begin <= end`.
pub fn normalize_wave_span(mut wave: Wave) -> Wave {
    if wave.has_time_span && wave.span_begin_ms > wave.span_end_ms {
        std::mem::swap(&mut wave.span_begin_ms, &mut wave.span_end_ms);
    }
    wave
}

/// The `(directive, signal)` event a node receives.
#[derive(Debug, Clone)]
pub struct Ingress {
    pub directive: DirectiveId,
    pub signal: Signal,
}

/// Collects a step's outgoing signals; the executor fans them out along
/// the wired hops in emission order.
#[derive(Debug, Default)]
pub struct Emitter {
    outputs: Vec<(DirectiveId, Signal)>,
}

impl Emitter {
    pub fn emit(&mut self, directive: DirectiveId, signal: Signal) {
        self.outputs.push((directive, signal));
    }

    pub fn drain(&mut self) -> Vec<(DirectiveId, Signal)> {
        std::mem::take(&mut self.outputs)
    }
}

/// What a step tells the executor about wave progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing wave-related happened.
    Continue,
    /// A source finished one batch; the wave advances and the source is
    /// pumped again.
    EndOfBatch,
    /// A source exhausted its epoch.
    EndOfEpoch,
}

/// Shared per-contract execution state visible to every step.
#[derive(Debug, Default)]
pub struct ExecContext {
    /// Last `metric=<float>` reported by a sink this epoch.
    pub last_metric: Option<f64>,
}

/// The capability set every typed node exposes.
pub trait TsiNode: Send {
    fn id(&self) -> u64;
    fn type_id(&self) -> TsiTypeId;
    fn instance_name(&self) -> &str;

    /// Concrete-type access for callers inspecting a finished board.
    fn as_any(&self) -> &dyn std::any::Any;

    fn type_name(&self) -> &'static str {
        find_tsi_type(self.type_id()).canonical
    }

    /// Directive table from the static registry.
    fn directives(&self) -> &'static [tsiboard_types::registry::DirectiveDesc] {
        find_tsi_type(self.type_id()).directives
    }

    /// Advance on one ingress event. Outgoing signals go through the
    /// emitter; the outcome steers wave progression.
    fn step(
        &mut self,
        wave: &Wave,
        ingress: Ingress,
        ctx: &mut ExecContext,
        emitter: &mut Emitter,
    ) -> RuntimeResult<StepOutcome>;

    /// Epoch boundary callback; trainable nodes advance their per-epoch
    /// schedulers here.
    fn on_epoch_end(&mut self, metric: Option<f64>) -> RuntimeResult<()> {
        let _ = metric;
        Ok(())
    }
}
