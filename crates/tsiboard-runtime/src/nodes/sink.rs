//! Sink nodes: the null sink swallows everything; the system-log sink
//! traces what it receives and forwards `metric=<float>` meta payloads to
//! the execution context for metric-gated schedulers.

use crate::error::RuntimeResult;
use crate::node::{Emitter, ExecContext, Ingress, Signal, StepOutcome, TsiNode, Wave};
use tsiboard_types::{DirectiveId, TsiTypeId};
use tracing::{info, warn};

pub struct TsiSinkNull {
    id: u64,
    instance_name: String,
}

impl TsiSinkNull {
    pub fn new(id: u64, instance_name: impl Into<String>) -> Self {
        TsiSinkNull { id, instance_name: instance_name.into() }
    }
}

impl TsiNode for TsiSinkNull {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn type_id(&self) -> TsiTypeId {
        TsiTypeId::SinkNull
    }

    fn instance_name(&self) -> &str {
        &self.instance_name
    }

    fn step(
        &mut self,
        _wave: &Wave,
        _ingress: Ingress,
        _ctx: &mut ExecContext,
        _emitter: &mut Emitter,
    ) -> RuntimeResult<StepOutcome> {
        Ok(StepOutcome::Continue)
    }
}

pub struct TsiSinkLogSys {
    id: u64,
    instance_name: String,
    /// Loss scalars observed, newest last. Kept for callers inspecting a
    /// finished board.
    seen_losses: Vec<f32>,
}

impl TsiSinkLogSys {
    pub fn new(id: u64, instance_name: impl Into<String>) -> Self {
        TsiSinkLogSys { id, instance_name: instance_name.into(), seen_losses: Vec::new() }
    }

    pub fn seen_losses(&self) -> &[f32] {
        &self.seen_losses
    }
}

fn parse_metric(text: &str) -> Option<f64> {
    text.trim().strip_prefix("metric=")?.trim().parse().ok()
}

impl TsiNode for TsiSinkLogSys {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn type_id(&self) -> TsiTypeId {
        TsiTypeId::SinkLogSys
    }

    fn instance_name(&self) -> &str {
        &self.instance_name
    }

    fn step(
        &mut self,
        wave: &Wave,
        ingress: Ingress,
        ctx: &mut ExecContext,
        _emitter: &mut Emitter,
    ) -> RuntimeResult<StepOutcome> {
        match (ingress.directive, ingress.signal) {
            (DirectiveId::Meta, Signal::Str(text)) => {
                if let Some(metric) = parse_metric(&text) {
                    ctx.last_metric = Some(metric);
                }
                info!(
                    sink = %self.instance_name,
                    wave_id = wave.cursor.id,
                    i = wave.cursor.i,
                    "{text}"
                );
            }
            (DirectiveId::Payload, Signal::Str(text)) => {
                info!(
                    sink = %self.instance_name,
                    wave_id = wave.cursor.id,
                    i = wave.cursor.i,
                    "{text}"
                );
            }
            (DirectiveId::Loss, Signal::Tensor(payload)) => {
                let flattened = payload.data.flatten_all()?.to_vec1::<f32>()?;
                match flattened.first() {
                    Some(&value) => {
                        self.seen_losses.push(value);
                        info!(
                            sink = %self.instance_name,
                            wave_id = wave.cursor.id,
                            i = wave.cursor.i,
                            loss = value,
                            "loss received"
                        );
                    }
                    None => warn!(
                        sink = %self.instance_name,
                        wave_id = wave.cursor.id,
                        "empty loss tensor"
                    ),
                }
            }
            (directive, signal) => {
                warn!(
                    sink = %self.instance_name,
                    directive = directive.token(),
                    kind = signal.kind().token(),
                    "unexpected signal dropped"
                );
            }
        }
        Ok(StepOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_payloads_reach_the_context() {
        let mut sink = TsiSinkLogSys::new(1, "sink");
        let mut ctx = ExecContext::default();
        let mut emitter = Emitter::default();
        let wave = Wave::default();
        sink.step(
            &wave,
            Ingress { directive: DirectiveId::Meta, signal: Signal::text("metric=0.25") },
            &mut ctx,
            &mut emitter,
        )
        .unwrap();
        assert_eq!(ctx.last_metric, Some(0.25));
        // non-metric meta leaves the slot untouched
        ctx.last_metric = None;
        sink.step(
            &wave,
            Ingress { directive: DirectiveId::Meta, signal: Signal::text("epoch_end") },
            &mut ctx,
            &mut emitter,
        )
        .unwrap();
        assert_eq!(ctx.last_metric, None);
    }
}
