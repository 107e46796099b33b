//! Source node: drives observation batches out of the dataloader.
//!
//! A string command on `@payload` pumps one batch: the node emits the
//! `[B,C,T,D]` tensor with its mask on `@payload` and reports end-of-batch
//! so the executor advances the wave and pumps again. An exhausted epoch
//! resets the loader, emits an `@meta` trace and reports end-of-epoch.

use crate::error::{RuntimeError, RuntimeResult};
use crate::node::{Emitter, ExecContext, Ingress, Signal, StepOutcome, TsiNode, Wave};
use tsiboard_data::Dataloader;
use tsiboard_types::{DirectiveId, PayloadKind, TsiTypeId};

pub struct TsiSourceDataloader {
    id: u64,
    instance_name: String,
    loader: Dataloader,
    batches_this_epoch: u64,
}

impl TsiSourceDataloader {
    pub fn new(id: u64, instance_name: impl Into<String>, loader: Dataloader) -> Self {
        TsiSourceDataloader {
            id,
            instance_name: instance_name.into(),
            loader,
            batches_this_epoch: 0,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.loader.pipeline().channel_count()
    }

    pub fn seq_length(&self) -> usize {
        self.loader.pipeline().seq_length()
    }

    pub fn feature_dim(&self) -> usize {
        self.loader.pipeline().feature_dim()
    }

    pub fn batch_size(&self) -> usize {
        self.loader.batch_size()
    }

    fn end_epoch(&mut self, wave: &Wave, emitter: &mut Emitter, why: &str) -> StepOutcome {
        self.loader.reset_epoch();
        self.batches_this_epoch = 0;
        emitter.emit(
            DirectiveId::Meta,
            Signal::text(format!(
                "epoch_end episode={} batches={} reason={why}",
                wave.cursor.episode, wave.cursor.batch
            )),
        );
        StepOutcome::EndOfEpoch
    }
}

impl TsiNode for TsiSourceDataloader {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn type_id(&self) -> TsiTypeId {
        TsiTypeId::SourceDataloader
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
        if ingress.directive != DirectiveId::Payload || ingress.signal.kind() != PayloadKind::Str {
            return Err(RuntimeError::exec(
                &self.instance_name,
                format!(
                    "source accepts only {}:str commands, got {}{}",
                    DirectiveId::Payload.token(),
                    ingress.directive.token(),
                    ingress.signal.kind().token()
                ),
            ));
        }

        if wave.max_batches_per_epoch > 0 && self.batches_this_epoch >= wave.max_batches_per_epoch
        {
            return Ok(self.end_epoch(wave, emitter, "max_batches"));
        }

        match self.loader.next_batch()? {
            Some(batch) => {
                self.batches_this_epoch += 1;
                emitter.emit(
                    DirectiveId::Payload,
                    Signal::tensor_with_mask(batch.features, batch.mask),
                );
                Ok(StepOutcome::EndOfBatch)
            }
            None => Ok(self.end_epoch(wave, emitter, "exhausted")),
        }
    }
}
