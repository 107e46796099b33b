//! Board executor: single-threaded cooperative event loop.
//!
//! One contract is advanced at a time. Events are FIFO within a node and
//! round-robin across ready nodes; a step's emitted signals fan out along
//! the wired hops in emission order, so downstream nodes observe outputs
//! in the order they were produced. The wave advances between batches and
//! epochs on the source's say-so; a cooperative cancellation token is
//! checked before every step and the current step always finishes.

use crate::builder::BoardContract;
use crate::error::{RuntimeError, RuntimeResult};
use crate::node::{Emitter, ExecContext, Ingress, StepOutcome};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Caller-owned cooperative cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Why the executor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every configured epoch ran to completion.
    Completed,
    /// The event budget ran out.
    BudgetExhausted,
    Cancelled,
}

/// Execution summary for one contract.
#[derive(Debug, Clone, Copy)]
pub struct ExecReport {
    pub events_processed: usize,
    pub epochs_completed: u64,
    pub batches_processed: u64,
    pub stop_reason: StopReason,
}

pub struct Executor {
    /// Upper bound on processed events; guards runaway circuits.
    pub max_events: usize,
    pub cancellation: CancellationToken,
}

impl Default for Executor {
    fn default() -> Self {
        Executor { max_events: 1_000_000, cancellation: CancellationToken::new() }
    }
}

impl Executor {
    pub fn new(max_events: usize, cancellation: CancellationToken) -> Self {
        Executor { max_events, cancellation }
    }

    /// Drive one contract's wave to completion (or budget/cancellation).
    /// On a node failure the error is returned along with the number of
    /// events processed so far.
    pub fn run_contract(
        &self,
        contract: &mut BoardContract,
    ) -> (usize, RuntimeResult<ExecReport>) {
        let mut wave = contract.seed_wave;
        let mut ctx = ExecContext::default();
        let mut queue: VecDeque<(usize, Ingress)> = VecDeque::new();
        queue.push_back((contract.root_index, contract.seed_ingress.clone()));

        let total_epochs = contract.execution.epochs.max(1);
        let mut epochs_completed = 0u64;
        let mut batches_processed = 0u64;
        let mut events_processed = 0usize;
        let mut stop_reason = StopReason::Completed;

        while let Some((node_index, ingress)) = queue.pop_front() {
            if self.cancellation.is_cancelled() {
                stop_reason = StopReason::Cancelled;
                break;
            }
            if events_processed >= self.max_events {
                stop_reason = StopReason::BudgetExhausted;
                break;
            }

            let mut emitter = Emitter::default();
            let outcome = {
                let node = &mut contract.nodes[node_index];
                debug!(
                    node = node.instance_name(),
                    directive = ingress.directive.token(),
                    episode = wave.cursor.episode,
                    batch = wave.cursor.batch,
                    "step"
                );
                match node.step(&wave, ingress, &mut ctx, &mut emitter) {
                    Ok(outcome) => outcome,
                    Err(e) => return (events_processed, Err(e)),
                }
            };
            events_processed += 1;

            // fan out emitted signals along the wired hops, FIFO
            for (directive, signal) in emitter.drain() {
                for hop in &contract.hops {
                    if hop.from_node == node_index && hop.from_directive == directive {
                        if signal.kind() != hop.kind {
                            return (
                                events_processed,
                                Err(RuntimeError::exec(
                                    contract.nodes[node_index].instance_name(),
                                    format!(
                                        "emitted {} on {} but hop expects {}",
                                        signal.kind().token(),
                                        directive.token(),
                                        hop.kind.token()
                                    ),
                                )),
                            );
                        }
                        queue.push_back((
                            hop.to_node,
                            Ingress { directive: hop.to_directive, signal: signal.clone() },
                        ));
                    }
                }
            }

            match outcome {
                StepOutcome::Continue => {}
                StepOutcome::EndOfBatch => {
                    batches_processed += 1;
                    wave.cursor.batch += 1;
                    wave.cursor.i += 1;
                    // pump the source for the next batch
                    queue.push_back((contract.root_index, contract.seed_ingress.clone()));
                }
                StepOutcome::EndOfEpoch => {
                    epochs_completed += 1;
                    wave.cursor.episode += 1;
                    wave.cursor.batch = 0;
                    let metric = ctx.last_metric.take();
                    for node in contract.nodes.iter_mut() {
                        if let Err(e) = node.on_epoch_end(metric) {
                            return (events_processed, Err(e));
                        }
                    }
                    if epochs_completed < total_epochs {
                        queue.push_back((contract.root_index, contract.seed_ingress.clone()));
                    }
                }
            }
        }

        info!(
            contract = %contract.name,
            events = events_processed,
            epochs = epochs_completed,
            batches = batches_processed,
            ?stop_reason,
            "contract execution finished"
        );
        (
            events_processed,
            Ok(ExecReport {
                events_processed,
                epochs_completed,
                batches_processed,
                stop_reason,
            }),
        )
    }

    /// Run every contract of a board in order.
    pub fn run_board(&self, board: &mut crate::builder::Board) -> RuntimeResult<Vec<ExecReport>> {
        let mut reports = Vec::with_capacity(board.contracts.len());
        for contract in &mut board.contracts {
            let (_, result) = self.run_contract(contract);
            reports.push(result?);
        }
        Ok(reports)
    }
}
