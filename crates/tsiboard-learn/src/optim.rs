//! Optimizers built from JKSPEC rows.
//!
//! Each optimizer is a small update rule over the model's `Var`s with its
//! own per-parameter state tensors. Builders validate their option set
//! exactly against their JKSPEC row before anything is constructed; the
//! builder itself is a cheap value that can re-instantiate the optimizer
//! for any parameter list.

use crate::error::{LearnError, LearnResult};
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use tsiboard_dsl::jkspec::{tables, Row, ROW_ID};

/// Runtime optimizer over a fixed parameter list.
pub trait OptimizerAny: Send {
    /// Apply one update from the gradients of the last backward pass.
    fn step(&mut self, grads: &GradStore) -> LearnResult<()>;
    fn learning_rate(&self) -> f64;
    fn set_learning_rate(&mut self, lr: f64);
    /// Clear per-parameter state (momentum buffers etc.).
    fn reset_state(&mut self);
    fn type_name(&self) -> &'static str;

    /// Serializable per-parameter state. Optimizers without checkpointable
    /// state return an empty list.
    fn state_tensors(&self) -> LearnResult<Vec<(String, Tensor)>> {
        Ok(Vec::new())
    }

    /// Restore state from checkpoint tensors keyed as produced by
    /// `state_tensors`. A mismatch is an error the caller may degrade to a
    /// warning.
    fn load_state_tensors(
        &mut self,
        tensors: &std::collections::HashMap<String, Tensor>,
    ) -> LearnResult<()> {
        if tensors.is_empty() {
            return Ok(());
        }
        Err(LearnError::state(format!(
            "{} does not support optimizer state restoration",
            self.type_name()
        )))
    }
}

/// Builder interface: one per optimizer type, constructed from a spec row.
pub trait OptimizerBuilder: Send + Sync {
    fn build(&self, params: Vec<Var>) -> LearnResult<Box<dyn OptimizerAny>>;
    /// Configured initial learning rate; schedulers start from it.
    fn base_lr(&self) -> f64;
    fn type_name(&self) -> &'static str;
}

fn decoupled_weight_decay(var: &Var, lr: f64, weight_decay: f64) -> LearnResult<()> {
    if weight_decay != 0.0 {
        let decayed = var.as_tensor().affine(1.0 - lr * weight_decay, 0.0)?;
        var.set(&decayed)?;
    }
    Ok(())
}

fn coupled_grad(grad: &Tensor, var: &Var, weight_decay: f64) -> LearnResult<Tensor> {
    if weight_decay == 0.0 {
        return Ok(grad.clone());
    }
    Ok((grad + var.as_tensor().affine(weight_decay, 0.0)?)?)
}

// ---- SGD ------------------------------------------------------------------

struct SgdState {
    momentum_buf: Option<Tensor>,
}

pub struct Sgd {
    params: Vec<Var>,
    state: Vec<SgdState>,
    lr: f64,
    momentum: f64,
    dampening: f64,
    weight_decay: f64,
    nesterov: bool,
}

impl OptimizerAny for Sgd {
    fn step(&mut self, grads: &GradStore) -> LearnResult<()> {
        for (var, state) in self.params.iter().zip(self.state.iter_mut()) {
            let Some(grad) = grads.get(var) else { continue };
            let grad = coupled_grad(grad, var, self.weight_decay)?;
            let direction = if self.momentum != 0.0 {
                let buf = match &state.momentum_buf {
                    Some(prev) => {
                        (prev.affine(self.momentum, 0.0)? + grad.affine(1.0 - self.dampening, 0.0)?)?
                    }
                    None => grad.clone(),
                };
                state.momentum_buf = Some(buf.clone());
                if self.nesterov {
                    (grad + buf.affine(self.momentum, 0.0)?)?
                } else {
                    buf
                }
            } else {
                grad
            };
            var.set(&(var.as_tensor() - direction.affine(self.lr, 0.0)?)?)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn reset_state(&mut self) {
        for s in &mut self.state {
            s.momentum_buf = None;
        }
    }

    fn type_name(&self) -> &'static str {
        "SGD"
    }
}

pub struct SgdBuilder {
    lr: f64,
    momentum: f64,
    dampening: f64,
    weight_decay: f64,
    nesterov: bool,
}

impl OptimizerBuilder for SgdBuilder {
    fn base_lr(&self) -> f64 {
        self.lr
    }

    fn build(&self, params: Vec<Var>) -> LearnResult<Box<dyn OptimizerAny>> {
        let state = params.iter().map(|_| SgdState { momentum_buf: None }).collect();
        Ok(Box::new(Sgd {
            params,
            state,
            lr: self.lr,
            momentum: self.momentum,
            dampening: self.dampening,
            weight_decay: self.weight_decay,
            nesterov: self.nesterov,
        }))
    }

    fn type_name(&self) -> &'static str {
        "SGD"
    }
}

// ---- Adam family ----------------------------------------------------------

struct AdamState {
    m: Option<Tensor>,
    v: Option<Tensor>,
    v_max: Option<Tensor>,
    t: i32,
}

pub struct Adam {
    params: Vec<Var>,
    state: Vec<AdamState>,
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    amsgrad: bool,
    /// AdamW decouples the decay from the gradient.
    decoupled: bool,
    name: &'static str,
}

impl OptimizerAny for Adam {
    fn step(&mut self, grads: &GradStore) -> LearnResult<()> {
        for (var, state) in self.params.iter().zip(self.state.iter_mut()) {
            let Some(grad) = grads.get(var) else { continue };
            let grad = if self.decoupled {
                decoupled_weight_decay(var, self.lr, self.weight_decay)?;
                grad.clone()
            } else {
                coupled_grad(grad, var, self.weight_decay)?
            };

            state.t += 1;
            let m = match &state.m {
                Some(prev) => (prev.affine(self.beta1, 0.0)? + grad.affine(1.0 - self.beta1, 0.0)?)?,
                None => grad.affine(1.0 - self.beta1, 0.0)?,
            };
            let v = match &state.v {
                Some(prev) => {
                    (prev.affine(self.beta2, 0.0)? + grad.sqr()?.affine(1.0 - self.beta2, 0.0)?)?
                }
                None => grad.sqr()?.affine(1.0 - self.beta2, 0.0)?,
            };
            state.m = Some(m.clone());
            state.v = Some(v.clone());

            let v_eff = if self.amsgrad {
                let v_max = match &state.v_max {
                    Some(prev) => prev.maximum(&v)?,
                    None => v.clone(),
                };
                state.v_max = Some(v_max.clone());
                v_max
            } else {
                v
            };

            let bias1 = 1.0 - self.beta1.powi(state.t);
            let bias2 = 1.0 - self.beta2.powi(state.t);
            let m_hat = m.affine(1.0 / bias1, 0.0)?;
            let v_hat = v_eff.affine(1.0 / bias2, 0.0)?;
            let update = m_hat
                .affine(self.lr, 0.0)?
                .div(&v_hat.sqrt()?.affine(1.0, self.eps)?)?;
            var.set(&(var.as_tensor() - update)?)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn reset_state(&mut self) {
        for s in &mut self.state {
            s.m = None;
            s.v = None;
            s.v_max = None;
            s.t = 0;
        }
    }

    fn type_name(&self) -> &'static str {
        self.name
    }

    fn state_tensors(&self) -> LearnResult<Vec<(String, Tensor)>> {
        let mut out = Vec::new();
        for (i, state) in self.state.iter().enumerate() {
            if let Some(m) = &state.m {
                out.push((format!("{i}.m"), m.clone()));
            }
            if let Some(v) = &state.v {
                out.push((format!("{i}.v"), v.clone()));
            }
            if let Some(v_max) = &state.v_max {
                out.push((format!("{i}.v_max"), v_max.clone()));
            }
            let device = self.params[i].as_tensor().device().clone();
            out.push((format!("{i}.t"), Tensor::new(&[i64::from(state.t)], &device)?));
        }
        Ok(out)
    }

    fn load_state_tensors(
        &mut self,
        tensors: &std::collections::HashMap<String, Tensor>,
    ) -> LearnResult<()> {
        if tensors.is_empty() {
            return Err(LearnError::state("checkpoint carries no optimizer state"));
        }
        for (i, state) in self.state.iter_mut().enumerate() {
            let expected = self.params[i].as_tensor().dims();
            for (suffix, slot) in
                [("m", &mut state.m), ("v", &mut state.v), ("v_max", &mut state.v_max)]
            {
                if let Some(tensor) = tensors.get(&format!("{i}.{suffix}")) {
                    if tensor.dims() != expected {
                        return Err(LearnError::state(format!(
                            "optimizer state shape mismatch at {i}.{suffix}"
                        )));
                    }
                    *slot = Some(tensor.clone());
                }
            }
            if let Some(tensor) = tensors.get(&format!("{i}.t")) {
                state.t = tensor.flatten_all()?.to_vec1::<i64>()?[0] as i32;
            }
        }
        Ok(())
    }
}

pub struct AdamBuilder {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    amsgrad: bool,
    decoupled: bool,
    name: &'static str,
}

impl OptimizerBuilder for AdamBuilder {
    fn base_lr(&self) -> f64 {
        self.lr
    }

    fn build(&self, params: Vec<Var>) -> LearnResult<Box<dyn OptimizerAny>> {
        let state = params
            .iter()
            .map(|_| AdamState { m: None, v: None, v_max: None, t: 0 })
            .collect();
        Ok(Box::new(Adam {
            params,
            state,
            lr: self.lr,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            weight_decay: self.weight_decay,
            amsgrad: self.amsgrad,
            decoupled: self.decoupled,
            name: self.name,
        }))
    }

    fn type_name(&self) -> &'static str {
        self.name
    }
}

// ---- RMSprop --------------------------------------------------------------

struct RmsState {
    square_avg: Option<Tensor>,
    grad_avg: Option<Tensor>,
    momentum_buf: Option<Tensor>,
}

pub struct RmsProp {
    params: Vec<Var>,
    state: Vec<RmsState>,
    lr: f64,
    alpha: f64,
    eps: f64,
    weight_decay: f64,
    momentum: f64,
    centered: bool,
}

impl OptimizerAny for RmsProp {
    fn step(&mut self, grads: &GradStore) -> LearnResult<()> {
        for (var, state) in self.params.iter().zip(self.state.iter_mut()) {
            let Some(grad) = grads.get(var) else { continue };
            let grad = coupled_grad(grad, var, self.weight_decay)?;

            let square_avg = match &state.square_avg {
                Some(prev) => {
                    (prev.affine(self.alpha, 0.0)? + grad.sqr()?.affine(1.0 - self.alpha, 0.0)?)?
                }
                None => grad.sqr()?.affine(1.0 - self.alpha, 0.0)?,
            };
            state.square_avg = Some(square_avg.clone());

            let avg = if self.centered {
                let grad_avg = match &state.grad_avg {
                    Some(prev) => {
                        (prev.affine(self.alpha, 0.0)? + grad.affine(1.0 - self.alpha, 0.0)?)?
                    }
                    None => grad.affine(1.0 - self.alpha, 0.0)?,
                };
                state.grad_avg = Some(grad_avg.clone());
                (square_avg - grad_avg.sqr()?)?
            } else {
                square_avg
            };

            let denom = avg.sqrt()?.affine(1.0, self.eps)?;
            let scaled = grad.div(&denom)?;
            let update = if self.momentum > 0.0 {
                let buf = match &state.momentum_buf {
                    Some(prev) => (prev.affine(self.momentum, 0.0)? + scaled)?,
                    None => scaled,
                };
                state.momentum_buf = Some(buf.clone());
                buf
            } else {
                scaled
            };
            var.set(&(var.as_tensor() - update.affine(self.lr, 0.0)?)?)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn reset_state(&mut self) {
        for s in &mut self.state {
            s.square_avg = None;
            s.grad_avg = None;
            s.momentum_buf = None;
        }
    }

    fn type_name(&self) -> &'static str {
        "RMSprop"
    }
}

pub struct RmsPropBuilder {
    lr: f64,
    alpha: f64,
    eps: f64,
    weight_decay: f64,
    momentum: f64,
    centered: bool,
}

impl OptimizerBuilder for RmsPropBuilder {
    fn base_lr(&self) -> f64 {
        self.lr
    }

    fn build(&self, params: Vec<Var>) -> LearnResult<Box<dyn OptimizerAny>> {
        let state = params
            .iter()
            .map(|_| RmsState { square_avg: None, grad_avg: None, momentum_buf: None })
            .collect();
        Ok(Box::new(RmsProp {
            params,
            state,
            lr: self.lr,
            alpha: self.alpha,
            eps: self.eps,
            weight_decay: self.weight_decay,
            momentum: self.momentum,
            centered: self.centered,
        }))
    }

    fn type_name(&self) -> &'static str {
        "RMSprop"
    }
}

// ---- Adagrad --------------------------------------------------------------

struct AdagradState {
    sum: Option<Tensor>,
    t: i64,
}

pub struct Adagrad {
    params: Vec<Var>,
    state: Vec<AdagradState>,
    lr: f64,
    lr_decay: f64,
    weight_decay: f64,
    eps: f64,
}

impl OptimizerAny for Adagrad {
    fn step(&mut self, grads: &GradStore) -> LearnResult<()> {
        for (var, state) in self.params.iter().zip(self.state.iter_mut()) {
            let Some(grad) = grads.get(var) else { continue };
            let grad = coupled_grad(grad, var, self.weight_decay)?;

            let sum = match &state.sum {
                Some(prev) => (prev + grad.sqr()?)?,
                None => grad.sqr()?,
            };
            state.sum = Some(sum.clone());

            let clr = self.lr / (1.0 + state.t as f64 * self.lr_decay);
            state.t += 1;
            let update = grad.affine(clr, 0.0)?.div(&sum.sqrt()?.affine(1.0, self.eps)?)?;
            var.set(&(var.as_tensor() - update)?)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn reset_state(&mut self) {
        for s in &mut self.state {
            s.sum = None;
            s.t = 0;
        }
    }

    fn type_name(&self) -> &'static str {
        "Adagrad"
    }
}

pub struct AdagradBuilder {
    lr: f64,
    lr_decay: f64,
    weight_decay: f64,
    eps: f64,
}

impl OptimizerBuilder for AdagradBuilder {
    fn base_lr(&self) -> f64 {
        self.lr
    }

    fn build(&self, params: Vec<Var>) -> LearnResult<Box<dyn OptimizerAny>> {
        let state = params.iter().map(|_| AdagradState { sum: None, t: 0 }).collect();
        Ok(Box::new(Adagrad {
            params,
            state,
            lr: self.lr,
            lr_decay: self.lr_decay,
            weight_decay: self.weight_decay,
            eps: self.eps,
        }))
    }

    fn type_name(&self) -> &'static str {
        "Adagrad"
    }
}

// ---- row → builder --------------------------------------------------------

/// Build the optimizer builder described by one `optimizers_table` row.
pub fn make_optimizer_builder(row: &Row) -> LearnResult<Box<dyn OptimizerBuilder>> {
    tables::require_columns_exact(row, &[ROW_ID, "type", "options"])?;
    let opt_type = tables::require_column(row, "type")?;

    let f = |key: &str| -> LearnResult<f64> { Ok(tables::to_f64(&tables::require_option(row, key)?)?) };
    let b = |key: &str| -> LearnResult<bool> { Ok(tables::to_bool(&tables::require_option(row, key)?)?) };

    match opt_type.as_str() {
        "SGD" => {
            tables::validate_options_exact(
                row,
                &["initial_learning_rate", "momentum", "dampening", "weight_decay", "nesterov"],
            )?;
            Ok(Box::new(SgdBuilder {
                lr: f("initial_learning_rate")?,
                momentum: f("momentum")?,
                dampening: f("dampening")?,
                weight_decay: f("weight_decay")?,
                nesterov: b("nesterov")?,
            }))
        }
        "Adam" => {
            tables::validate_options_exact(
                row,
                &["initial_learning_rate", "beta1", "beta2", "eps", "weight_decay", "amsgrad"],
            )?;
            Ok(Box::new(AdamBuilder {
                lr: f("initial_learning_rate")?,
                beta1: f("beta1")?,
                beta2: f("beta2")?,
                eps: f("eps")?,
                weight_decay: f("weight_decay")?,
                amsgrad: b("amsgrad")?,
                decoupled: false,
                name: "Adam",
            }))
        }
        "AdamW" => {
            tables::validate_options_exact(
                row,
                &["initial_learning_rate", "beta1", "beta2", "eps", "weight_decay"],
            )?;
            Ok(Box::new(AdamBuilder {
                lr: f("initial_learning_rate")?,
                beta1: f("beta1")?,
                beta2: f("beta2")?,
                eps: f("eps")?,
                weight_decay: f("weight_decay")?,
                amsgrad: false,
                decoupled: true,
                name: "AdamW",
            }))
        }
        "RMSprop" => {
            tables::validate_options_exact(
                row,
                &["initial_learning_rate", "alpha", "eps", "weight_decay", "momentum", "centered"],
            )?;
            Ok(Box::new(RmsPropBuilder {
                lr: f("initial_learning_rate")?,
                alpha: f("alpha")?,
                eps: f("eps")?,
                weight_decay: f("weight_decay")?,
                momentum: f("momentum")?,
                centered: b("centered")?,
            }))
        }
        "Adagrad" => {
            tables::validate_options_exact(
                row,
                &["initial_learning_rate", "lr_decay", "weight_decay", "eps"],
            )?;
            Ok(Box::new(AdagradBuilder {
                lr: f("initial_learning_rate")?,
                lr_decay: f("lr_decay")?,
                weight_decay: f("weight_decay")?,
                eps: f("eps")?,
            }))
        }
        other => Err(LearnError::config(format!("unknown optimizer type: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn row(opt_type: &str, options: &str) -> Row {
        let mut row = Row::new();
        row.insert(ROW_ID.to_string(), "r::optimizer".to_string());
        row.insert("type".to_string(), opt_type.to_string());
        row.insert("options".to_string(), options.to_string());
        row
    }

    fn quadratic_step(builder: &dyn OptimizerBuilder) -> f32 {
        // minimize f(x) = x^2 a few steps from x=1
        let device = Device::Cpu;
        let var = Var::ones((1,), DType::F32, &device).unwrap();
        let mut optimizer = builder.build(vec![var.clone()]).unwrap();
        for _ in 0..30 {
            let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
            let grads = loss.backward().unwrap();
            optimizer.step(&grads).unwrap();
        }
        var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap()[0].abs()
    }

    #[test]
    fn every_optimizer_descends_a_quadratic() {
        let cases: Vec<Box<dyn OptimizerBuilder>> = vec![
            make_optimizer_builder(&row(
                "SGD",
                "initial_learning_rate=0.1,momentum=0.9,dampening=0.0,weight_decay=0.0,nesterov=false",
            ))
            .unwrap(),
            make_optimizer_builder(&row(
                "Adam",
                "initial_learning_rate=0.1,beta1=0.9,beta2=0.999,eps=1e-8,weight_decay=0.0,amsgrad=true",
            ))
            .unwrap(),
            make_optimizer_builder(&row(
                "AdamW",
                "initial_learning_rate=0.1,beta1=0.9,beta2=0.999,eps=1e-8,weight_decay=0.01",
            ))
            .unwrap(),
            make_optimizer_builder(&row(
                "RMSprop",
                "initial_learning_rate=0.05,alpha=0.99,eps=1e-8,weight_decay=0.0,momentum=0.0,centered=true",
            ))
            .unwrap(),
            make_optimizer_builder(&row(
                "Adagrad",
                "initial_learning_rate=0.5,lr_decay=0.0,weight_decay=0.0,eps=1e-10",
            ))
            .unwrap(),
        ];
        for builder in cases {
            let residual = quadratic_step(builder.as_ref());
            assert!(residual < 0.5, "{} residual {residual}", builder.type_name());
        }
    }

    #[test]
    fn option_set_must_match_exactly() {
        let missing = row("SGD", "initial_learning_rate=0.1,momentum=0.9");
        assert!(make_optimizer_builder(&missing).is_err());
        let extra = row(
            "Adagrad",
            "initial_learning_rate=0.5,lr_decay=0.0,weight_decay=0.0,eps=1e-10,bogus=1",
        );
        assert!(make_optimizer_builder(&extra).is_err());
        assert!(make_optimizer_builder(&row("Lion", "initial_learning_rate=0.1")).is_err());
    }

    #[test]
    fn lr_is_adjustable_and_state_resets() {
        let builder = make_optimizer_builder(&row(
            "SGD",
            "initial_learning_rate=0.1,momentum=0.9,dampening=0.0,weight_decay=0.0,nesterov=true",
        ))
        .unwrap();
        let device = Device::Cpu;
        let var = Var::ones((2,), DType::F32, &device).unwrap();
        let mut optimizer = builder.build(vec![var.clone()]).unwrap();
        assert_eq!(optimizer.learning_rate(), 0.1);
        optimizer.set_learning_rate(0.01);
        assert_eq!(optimizer.learning_rate(), 0.01);
        let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        optimizer.step(&grads).unwrap();
        optimizer.reset_state();
    }
}
