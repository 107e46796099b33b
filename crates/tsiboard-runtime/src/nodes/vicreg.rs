//! VICReg representation node.
//!
//! In training mode each incoming batch drives one optimization step; the
//! loss scalar leaves on `@loss` and the (SWA or base) encoding on
//! `@payload`. In run mode the node only encodes. Epoch boundaries advance
//! the per-epoch scheduler with the sink-reported metric when one arrived.

use crate::error::{RuntimeError, RuntimeResult};
use crate::node::{Emitter, ExecContext, Ingress, Signal, StepOutcome, TsiNode, Wave};
use candle_core::Tensor;
use tsiboard_learn::Vicreg4D;
use tsiboard_types::{DirectiveId, PayloadKind, TsiTypeId};
use tracing::debug;

pub struct TsiVicreg {
    id: u64,
    instance_name: String,
    model: Vicreg4D,
    train: bool,
    use_swa: bool,
}

impl TsiVicreg {
    pub fn new(
        id: u64,
        instance_name: impl Into<String>,
        model: Vicreg4D,
        train: bool,
        use_swa: bool,
    ) -> Self {
        TsiVicreg { id, instance_name: instance_name.into(), model, train, use_swa }
    }

    pub fn model(&self) -> &Vicreg4D {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut Vicreg4D {
        &mut self.model
    }
}

impl TsiNode for TsiVicreg {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn type_id(&self) -> TsiTypeId {
        TsiTypeId::WikimyeiRepresentationVicreg
    }

    fn instance_name(&self) -> &str {
        &self.instance_name
    }

    fn step(
        &mut self,
        wave: &Wave,
        ingress: Ingress,
        _ctx: &mut ExecContext,
        emitter: &mut Emitter,
    ) -> RuntimeResult<StepOutcome> {
        let payload = match (ingress.directive, ingress.signal) {
            (DirectiveId::Payload, Signal::Tensor(payload)) => payload,
            (directive, signal) => {
                return Err(RuntimeError::exec(
                    &self.instance_name,
                    format!(
                        "vicreg accepts only {}{} ingress, got {}{}",
                        DirectiveId::Payload.token(),
                        PayloadKind::Tensor.token(),
                        directive.token(),
                        signal.kind().token()
                    ),
                ))
            }
        };
        let mask = payload.mask.as_ref().ok_or_else(|| {
            RuntimeError::exec(&self.instance_name, "tensor payload is missing its validity mask")
        })?;

        if self.train {
            match self.model.train_step(&payload.data, mask)? {
                Some(stats) => {
                    debug!(
                        instance = %self.instance_name,
                        episode = wave.cursor.episode,
                        batch = wave.cursor.batch,
                        loss = stats.loss,
                        lr = stats.lr,
                        "vicreg train step"
                    );
                    let loss =
                        Tensor::new(&[stats.loss as f32], payload.data.device())?;
                    emitter.emit(DirectiveId::Loss, Signal::tensor(loss));
                }
                None => {
                    emitter.emit(
                        DirectiveId::Meta,
                        Signal::text("train step skipped: no valid rows in batch"),
                    );
                    return Ok(StepOutcome::Continue);
                }
            }
        }

        let (rep, valid) = self.model.encode(&payload.data, mask, self.use_swa)?;
        emitter.emit(DirectiveId::Payload, Signal::tensor_with_mask(rep, valid));
        Ok(StepOutcome::Continue)
    }

    fn on_epoch_end(&mut self, metric: Option<f64>) -> RuntimeResult<()> {
        if self.train {
            self.model.end_epoch(metric);
        }
        Ok(())
    }
}
