//! Learning-rate schedulers built from JKSPEC rows.
//!
//! Each scheduler is a small LR automaton that yields the next rate; the
//! trainer pushes it into the optimizer. Every type declares its stepping
//! mode so the executor knows whether to advance it per batch, per epoch,
//! or per epoch with a reported metric.

use crate::error::{LearnError, LearnResult};
use tsiboard_dsl::jkspec::{tables, Row, ROW_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerMode {
    PerBatch,
    PerEpoch,
    PerEpochWithMetric,
}

/// Runtime scheduler. `step`/`step_metric` return the LR to apply next.
pub trait LrScheduler: Send {
    fn mode(&self) -> SchedulerMode;
    fn step(&mut self) -> f64;
    /// Metric-aware step; non-metric schedulers ignore the value.
    fn step_metric(&mut self, metric: f64) -> f64 {
        let _ = metric;
        self.step()
    }
    fn current_lr(&self) -> f64;
    fn type_name(&self) -> &'static str;
}

pub trait SchedulerBuilder: Send + Sync {
    /// `base_lr` is the optimizer's configured initial rate.
    fn build(&self, base_lr: f64) -> Box<dyn LrScheduler>;
    fn type_name(&self) -> &'static str;
}

macro_rules! scheduler_impl {
    ($name:ident, $mode:expr, $tag:literal) => {
        impl LrScheduler for $name {
            fn mode(&self) -> SchedulerMode {
                $mode
            }
            fn step(&mut self) -> f64 {
                self.advance()
            }
            fn current_lr(&self) -> f64 {
                self.lr
            }
            fn type_name(&self) -> &'static str {
                $tag
            }
        }
    };
}

// ---- ConstantLR -----------------------------------------------------------

/// Holds the LR constant; `lr <= 0` keeps the optimizer's base rate.
struct ConstantLr {
    lr: f64,
}

impl ConstantLr {
    fn advance(&mut self) -> f64 {
        self.lr
    }
}
scheduler_impl!(ConstantLr, SchedulerMode::PerEpoch, "ConstantLR");

// ---- StepLR ---------------------------------------------------------------

struct StepLr {
    lr: f64,
    step_size: i64,
    gamma: f64,
    epoch: i64,
}

impl StepLr {
    fn advance(&mut self) -> f64 {
        self.epoch += 1;
        if self.step_size > 0 && self.epoch % self.step_size == 0 {
            self.lr *= self.gamma;
        }
        self.lr
    }
}
scheduler_impl!(StepLr, SchedulerMode::PerEpoch, "StepLR");

// ---- MultiStepLR ----------------------------------------------------------

struct MultiStepLr {
    lr: f64,
    milestones: Vec<i64>,
    gamma: f64,
    epoch: i64,
}

impl MultiStepLr {
    fn advance(&mut self) -> f64 {
        self.epoch += 1;
        if self.milestones.binary_search(&self.epoch).is_ok() {
            self.lr *= self.gamma;
        }
        self.lr
    }
}
scheduler_impl!(MultiStepLr, SchedulerMode::PerEpoch, "MultiStepLR");

// ---- ExponentialLR --------------------------------------------------------

struct ExponentialLr {
    lr: f64,
    gamma: f64,
}

impl ExponentialLr {
    fn advance(&mut self) -> f64 {
        self.lr *= self.gamma;
        self.lr
    }
}
scheduler_impl!(ExponentialLr, SchedulerMode::PerEpoch, "ExponentialLR");

// ---- ReduceLROnPlateau ----------------------------------------------------

struct ReduceOnPlateau {
    lr: f64,
    maximize: bool,
    factor: f64,
    patience: i64,
    threshold: f64,
    threshold_abs: bool,
    cooldown: i64,
    min_lr: f64,
    eps: f64,
    best: f64,
    has_best: bool,
    bad_epochs: i64,
    cooldown_counter: i64,
}

impl ReduceOnPlateau {
    fn is_better(&self, metric: f64, best: f64) -> bool {
        if metric.is_nan() || best.is_nan() {
            return false;
        }
        match (self.maximize, self.threshold_abs) {
            (false, false) => metric < best * (1.0 - self.threshold),
            (false, true) => metric < best - self.threshold,
            (true, false) => metric > best * (1.0 + self.threshold),
            (true, true) => metric > best + self.threshold,
        }
    }

    fn maybe_reduce(&mut self) {
        if self.cooldown_counter > 0 {
            self.cooldown_counter -= 1;
            return;
        }
        if self.bad_epochs <= self.patience {
            return;
        }
        let next = (self.lr * self.factor).max(self.min_lr);
        if self.lr - next > self.eps {
            self.lr = next;
            self.bad_epochs = 0;
            self.cooldown_counter = self.cooldown;
        }
    }

    fn advance(&mut self) -> f64 {
        // without a metric this scheduler holds
        self.lr
    }
}

impl LrScheduler for ReduceOnPlateau {
    fn mode(&self) -> SchedulerMode {
        SchedulerMode::PerEpochWithMetric
    }

    fn step(&mut self) -> f64 {
        self.advance()
    }

    fn step_metric(&mut self, metric: f64) -> f64 {
        if !metric.is_nan() {
            if !self.has_best {
                self.best = metric;
                self.has_best = true;
                self.bad_epochs = 0;
            } else if self.is_better(metric, self.best) {
                self.best = metric;
                self.bad_epochs = 0;
            } else {
                self.bad_epochs += 1;
            }
        }
        self.maybe_reduce();
        self.lr
    }

    fn current_lr(&self) -> f64 {
        self.lr
    }

    fn type_name(&self) -> &'static str {
        "ReduceLROnPlateau"
    }
}

// ---- OneCycleLR -----------------------------------------------------------

/// Triangular ramp: up for 30% of the cycle, back down for the rest.
struct OneCycleLr {
    lr: f64,
    base_lr: f64,
    peak_lr: f64,
    total_steps: i64,
    step_count: i64,
}

const ONE_CYCLE_PCT_START: f64 = 0.30;

impl OneCycleLr {
    fn advance(&mut self) -> f64 {
        if self.step_count >= self.total_steps {
            self.lr = self.base_lr;
            return self.lr;
        }
        let up = ((ONE_CYCLE_PCT_START * self.total_steps as f64).round() as i64).max(1);
        let down = (self.total_steps - up).max(1);
        if self.step_count < up {
            let t = (self.step_count + 1) as f64 / up as f64;
            self.lr = self.base_lr + (self.peak_lr - self.base_lr) * t;
        } else {
            let t = (self.step_count - up + 1) as f64 / down as f64;
            self.lr = self.peak_lr - (self.peak_lr - self.base_lr) * t;
        }
        self.step_count += 1;
        self.lr
    }
}
scheduler_impl!(OneCycleLr, SchedulerMode::PerBatch, "OneCycleLR");

// ---- CosineAnnealingLR ----------------------------------------------------

struct CosineAnnealingLr {
    lr: f64,
    base_lr: f64,
    eta_min: f64,
    t_max: i64,
    t: i64,
}

impl CosineAnnealingLr {
    fn advance(&mut self) -> f64 {
        let ct = self.t.min(self.t_max) as f64;
        let cos_term = (1.0 + (std::f64::consts::PI * ct / self.t_max as f64).cos()) * 0.5;
        self.lr = self.eta_min + (self.base_lr - self.eta_min) * cos_term;
        if self.t < self.t_max {
            self.t += 1;
        }
        self.lr
    }
}
scheduler_impl!(CosineAnnealingLr, SchedulerMode::PerEpoch, "CosineAnnealingLR");

// ---- WarmupLR -------------------------------------------------------------

/// Linear warmup from `start_factor*base` to `end_factor*base`, then hold.
struct WarmupLr {
    lr: f64,
    base_lr: f64,
    warmup_steps: i64,
    start_factor: f64,
    end_factor: f64,
    t: i64,
}

impl WarmupLr {
    fn advance(&mut self) -> f64 {
        if self.t < self.warmup_steps {
            let a = (self.t + 1) as f64 / self.warmup_steps as f64;
            let factor = self.start_factor + (self.end_factor - self.start_factor) * a;
            self.lr = self.base_lr * factor;
            self.t += 1;
        } else {
            self.lr = self.base_lr * self.end_factor;
        }
        self.lr
    }
}
scheduler_impl!(WarmupLr, SchedulerMode::PerBatch, "WarmupLR");

// ---- builders -------------------------------------------------------------

enum SchedulerConf {
    Constant { lr: f64 },
    Step { step_size: i64, gamma: f64 },
    MultiStep { milestones: Vec<i64>, gamma: f64 },
    Exponential { gamma: f64 },
    Plateau {
        maximize: bool,
        factor: f64,
        patience: i64,
        threshold: f64,
        threshold_abs: bool,
        cooldown: i64,
        min_lr: f64,
        eps: f64,
    },
    OneCycle { max_lr: f64, total_steps: i64 },
    Cosine { t_max: i64, eta_min: f64 },
    Warmup { warmup_steps: i64, start_factor: f64, end_factor: f64 },
}

pub struct ConfiguredSchedulerBuilder {
    conf: SchedulerConf,
    name: &'static str,
}

impl SchedulerBuilder for ConfiguredSchedulerBuilder {
    fn build(&self, base_lr: f64) -> Box<dyn LrScheduler> {
        match &self.conf {
            SchedulerConf::Constant { lr } => {
                let lr = if *lr > 0.0 { *lr } else { base_lr };
                Box::new(ConstantLr { lr })
            }
            SchedulerConf::Step { step_size, gamma } => Box::new(StepLr {
                lr: base_lr,
                step_size: *step_size,
                gamma: *gamma,
                epoch: 0,
            }),
            SchedulerConf::MultiStep { milestones, gamma } => {
                let mut milestones = milestones.clone();
                milestones.sort_unstable();
                milestones.dedup();
                Box::new(MultiStepLr { lr: base_lr, milestones, gamma: *gamma, epoch: 0 })
            }
            SchedulerConf::Exponential { gamma } => {
                Box::new(ExponentialLr { lr: base_lr, gamma: *gamma })
            }
            SchedulerConf::Plateau {
                maximize,
                factor,
                patience,
                threshold,
                threshold_abs,
                cooldown,
                min_lr,
                eps,
            } => Box::new(ReduceOnPlateau {
                lr: base_lr,
                maximize: *maximize,
                factor: *factor,
                patience: (*patience).max(0),
                threshold: threshold.max(0.0),
                threshold_abs: *threshold_abs,
                cooldown: (*cooldown).max(0),
                min_lr: min_lr.max(0.0),
                eps: eps.max(0.0),
                best: if *maximize { f64::NEG_INFINITY } else { f64::INFINITY },
                has_best: false,
                bad_epochs: 0,
                cooldown_counter: 0,
            }),
            SchedulerConf::OneCycle { max_lr, total_steps } => {
                let mut base = base_lr;
                let mut peak = *max_lr;
                if peak < base {
                    std::mem::swap(&mut base, &mut peak);
                }
                Box::new(OneCycleLr {
                    lr: base,
                    base_lr: base,
                    peak_lr: peak,
                    total_steps: (*total_steps).max(1),
                    step_count: 0,
                })
            }
            SchedulerConf::Cosine { t_max, eta_min } => Box::new(CosineAnnealingLr {
                lr: base_lr,
                base_lr,
                eta_min: eta_min.max(0.0),
                t_max: (*t_max).max(1),
                t: 0,
            }),
            SchedulerConf::Warmup { warmup_steps, start_factor, end_factor } => {
                Box::new(WarmupLr {
                    lr: base_lr * start_factor.max(0.0),
                    base_lr,
                    warmup_steps: (*warmup_steps).max(1),
                    start_factor: start_factor.max(0.0),
                    end_factor: end_factor.max(0.0),
                    t: 0,
                })
            }
        }
    }

    fn type_name(&self) -> &'static str {
        self.name
    }
}

/// Build the scheduler builder described by one `lr_schedulers_table` row.
pub fn make_scheduler_builder(row: &Row) -> LearnResult<Box<dyn SchedulerBuilder>> {
    tables::require_columns_exact(row, &[ROW_ID, "type", "options"])?;
    let sched_type = tables::require_column(row, "type")?;

    let f = |key: &str| -> LearnResult<f64> { Ok(tables::to_f64(&tables::require_option(row, key)?)?) };
    let i = |key: &str| -> LearnResult<i64> { Ok(tables::to_i64(&tables::require_option(row, key)?)?) };

    let (conf, name): (SchedulerConf, &'static str) = match sched_type.as_str() {
        "ConstantLR" => {
            tables::validate_options_exact(row, &["lr"])?;
            (SchedulerConf::Constant { lr: f("lr")? }, "ConstantLR")
        }
        "StepLR" => {
            tables::validate_options_exact(row, &["step_size", "gamma"])?;
            (SchedulerConf::Step { step_size: i("step_size")?, gamma: f("gamma")? }, "StepLR")
        }
        "MultiStepLR" => {
            tables::validate_options_exact(row, &["milestones|step_size", "gamma"])?;
            let csv = match tables::has_option(row, "milestones")? {
                true => tables::require_option(row, "milestones")?,
                false => tables::require_option(row, "step_size")?,
            };
            (
                SchedulerConf::MultiStep {
                    milestones: tables::to_i64_list_csv(&csv)?,
                    gamma: f("gamma")?,
                },
                "MultiStepLR",
            )
        }
        "ExponentialLR" => {
            tables::validate_options_exact(row, &["gamma"])?;
            (SchedulerConf::Exponential { gamma: f("gamma")? }, "ExponentialLR")
        }
        "ReduceLROnPlateau" => {
            tables::validate_options_exact(
                row,
                &[
                    "mode",
                    "factor",
                    "patience",
                    "threshold",
                    "threshold_mode",
                    "cooldown",
                    "min_lr",
                    "eps",
                ],
            )?;
            let factor = f("factor")?;
            if !(0.0..1.0).contains(&factor) || factor <= 0.0 {
                return Err(LearnError::config("ReduceLROnPlateau: factor must be in (0,1)"));
            }
            let mode = tables::require_option(row, "mode")?.to_ascii_lowercase();
            let threshold_mode =
                tables::require_option(row, "threshold_mode")?.to_ascii_lowercase();
            (
                SchedulerConf::Plateau {
                    maximize: mode == "max",
                    factor,
                    patience: i("patience")?,
                    threshold: f("threshold")?,
                    threshold_abs: threshold_mode == "abs" || threshold_mode == "absolute",
                    cooldown: i("cooldown")?,
                    min_lr: f("min_lr")?,
                    eps: f("eps")?,
                },
                "ReduceLROnPlateau",
            )
        }
        "OneCycleLR" => {
            tables::validate_options_exact(row, &["max_lr", "total_steps"])?;
            (
                SchedulerConf::OneCycle { max_lr: f("max_lr")?, total_steps: i("total_steps")? },
                "OneCycleLR",
            )
        }
        "CosineAnnealingLR" => {
            tables::validate_options_exact(row, &["T_max", "eta_min"])?;
            (
                SchedulerConf::Cosine { t_max: i("T_max")?, eta_min: f("eta_min")? },
                "CosineAnnealingLR",
            )
        }
        "WarmupLR" => {
            tables::validate_options_exact(row, &["warmup_steps", "start_factor", "end_factor"])?;
            (
                SchedulerConf::Warmup {
                    warmup_steps: i("warmup_steps")?,
                    start_factor: f("start_factor")?,
                    end_factor: f("end_factor")?,
                },
                "WarmupLR",
            )
        }
        other => return Err(LearnError::config(format!("unknown scheduler type: {other}"))),
    };

    Ok(Box::new(ConfiguredSchedulerBuilder { conf, name }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(sched_type: &str, options: &str) -> Row {
        let mut row = Row::new();
        row.insert(ROW_ID.to_string(), "r::scheduler".to_string());
        row.insert("type".to_string(), sched_type.to_string());
        row.insert("options".to_string(), options.to_string());
        row
    }

    #[test]
    fn step_lr_halves_on_schedule() {
        let builder = make_scheduler_builder(&row("StepLR", "step_size=2,gamma=0.5")).unwrap();
        let mut sched = builder.build(1.0);
        assert_eq!(sched.mode(), SchedulerMode::PerEpoch);
        assert_eq!(sched.step(), 1.0);
        assert_eq!(sched.step(), 0.5);
        assert_eq!(sched.step(), 0.5);
        assert_eq!(sched.step(), 0.25);
    }

    #[test]
    fn multi_step_respects_milestones() {
        let builder =
            make_scheduler_builder(&row("MultiStepLR", "milestones=\"2,4\",gamma=0.1")).unwrap();
        let mut sched = builder.build(1.0);
        let lrs: Vec<f64> = (0..5).map(|_| sched.step()).collect();
        assert_eq!(lrs, vec![1.0, 0.1, 0.1, 0.010000000000000002, 0.010000000000000002]);
    }

    #[test]
    fn plateau_reduces_after_patience() {
        let builder = make_scheduler_builder(&row(
            "ReduceLROnPlateau",
            "mode=min,factor=0.5,patience=1,threshold=0.0,threshold_mode=rel,cooldown=0,min_lr=0.0,eps=0.0",
        ))
        .unwrap();
        let mut sched = builder.build(1.0);
        assert_eq!(sched.mode(), SchedulerMode::PerEpochWithMetric);
        assert_eq!(sched.step_metric(1.0), 1.0); // establishes best
        assert_eq!(sched.step_metric(1.0), 1.0); // bad 1 <= patience
        assert_eq!(sched.step_metric(1.0), 0.5); // bad 2 > patience
        // plain step holds
        assert_eq!(sched.step(), 0.5);
    }

    #[test]
    fn one_cycle_ramps_up_then_down() {
        let builder =
            make_scheduler_builder(&row("OneCycleLR", "max_lr=1.0,total_steps=10")).unwrap();
        let mut sched = builder.build(0.1);
        assert_eq!(sched.mode(), SchedulerMode::PerBatch);
        let lrs: Vec<f64> = (0..10).map(|_| sched.step()).collect();
        let peak = lrs.iter().cloned().fold(0.0f64, f64::max);
        assert!((peak - 1.0).abs() < 1e-9);
        assert!(lrs[9] < peak);
    }

    #[test]
    fn warmup_holds_after_ramp() {
        let builder = make_scheduler_builder(&row(
            "WarmupLR",
            "warmup_steps=4,start_factor=0.25,end_factor=1.0",
        ))
        .unwrap();
        let mut sched = builder.build(0.8);
        let lrs: Vec<f64> = (0..6).map(|_| sched.step()).collect();
        assert!(lrs[0] < lrs[3]);
        assert!((lrs[3] - 0.8).abs() < 1e-9);
        assert!((lrs[5] - 0.8).abs() < 1e-9);
    }

    #[test]
    fn cosine_reaches_eta_min() {
        let builder =
            make_scheduler_builder(&row("CosineAnnealingLR", "T_max=4,eta_min=0.1")).unwrap();
        let mut sched = builder.build(1.0);
        let mut last = 1.0;
        for _ in 0..5 {
            last = sched.step();
        }
        assert!((last - 0.1).abs() < 1e-9);
    }

    #[test]
    fn constant_keeps_base_when_zero() {
        let builder = make_scheduler_builder(&row("ConstantLR", "lr=0")).unwrap();
        let mut sched = builder.build(0.33);
        assert_eq!(sched.step(), 0.33);
    }

    #[test]
    fn unknown_and_malformed_rows_fail() {
        assert!(make_scheduler_builder(&row("Cyclical", "gamma=0.5")).is_err());
        assert!(make_scheduler_builder(&row("StepLR", "step_size=2")).is_err());
        assert!(make_scheduler_builder(&row(
            "ReduceLROnPlateau",
            "mode=min,factor=1.5,patience=1,threshold=0.0,threshold_mode=rel,cooldown=0,min_lr=0.0,eps=0.0",
        ))
        .is_err());
    }
}
