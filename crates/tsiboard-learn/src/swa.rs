//! Stochastic weight averaging over a VarMap.
//!
//! The SWA copy lives in its own VarMap with the same key layout as the
//! live model. Each update folds the live weights into the running mean:
//! `avg += (live - avg) / (n + 1)`. Trainable parameters are always
//! averaged; non-trainable running buffers are folded in only when
//! `average_buffers` is set, otherwise they are copied verbatim so the
//! averaged encoder still normalizes with the live statistics.

use crate::error::{LearnError, LearnResult};
use candle_nn::VarMap;
use std::collections::HashMap;

#[derive(Debug)]
pub struct SwaState {
    n_averaged: u64,
    average_buffers: bool,
    /// Keys treated as running buffers rather than trainable weights.
    buffer_keys: Vec<String>,
}

fn varmap_tensors(varmap: &VarMap) -> HashMap<String, candle_core::Var> {
    varmap.data().lock().expect("varmap poisoned").clone()
}

impl SwaState {
    pub fn new(average_buffers: bool, buffer_keys: Vec<String>) -> Self {
        SwaState { n_averaged: 0, average_buffers, buffer_keys }
    }

    pub fn n_averaged(&self) -> u64 {
        self.n_averaged
    }

    fn is_buffer(&self, key: &str) -> bool {
        self.buffer_keys.iter().any(|b| key.contains(b.as_str()))
    }

    /// Fold the live weights into the SWA copy.
    pub fn update(&mut self, live: &VarMap, swa: &VarMap) -> LearnResult<()> {
        let live_vars = varmap_tensors(live);
        let swa_vars = varmap_tensors(swa);
        let n = self.n_averaged as f64;

        for (key, live_var) in &live_vars {
            let swa_var = swa_vars.get(key).ok_or_else(|| {
                LearnError::state(format!("SWA copy is missing parameter key '{key}'"))
            })?;
            let live_t = live_var.as_tensor();
            if self.is_buffer(key) && !self.average_buffers {
                swa_var.set(live_t)?;
                continue;
            }
            if self.n_averaged == 0 {
                swa_var.set(live_t)?;
            } else {
                let avg = swa_var.as_tensor();
                let updated = (avg + ((live_t - avg)?.affine(1.0 / (n + 1.0), 0.0)?))?;
                swa_var.set(&updated)?;
            }
        }
        self.n_averaged += 1;
        Ok(())
    }

    /// Copy live → SWA verbatim and reset the average count.
    pub fn reset_from(&mut self, live: &VarMap, swa: &VarMap) -> LearnResult<()> {
        let live_vars = varmap_tensors(live);
        let swa_vars = varmap_tensors(swa);
        for (key, live_var) in &live_vars {
            let swa_var = swa_vars.get(key).ok_or_else(|| {
                LearnError::state(format!("SWA copy is missing parameter key '{key}'"))
            })?;
            swa_var.set(live_var.as_tensor())?;
        }
        self.n_averaged = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::Init;

    fn varmap_with(key: &str, value: f32, device: &Device) -> VarMap {
        let varmap = VarMap::new();
        varmap.get((2,), key, Init::Const(value as f64), DType::F32, device).unwrap();
        varmap
    }

    fn value_of(varmap: &VarMap, key: &str) -> f32 {
        let vars = varmap.data().lock().unwrap();
        vars[key].as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap()[0]
    }

    #[test]
    fn running_mean_over_updates() {
        let device = Device::Cpu;
        let live = varmap_with("w", 0.0, &device);
        let swa = varmap_with("w", 0.0, &device);
        let mut state = SwaState::new(true, vec![]);

        for step in 1..=3 {
            let vars = live.data().lock().unwrap();
            vars["w"]
                .set(&Tensor::full(step as f32, (2,), &device).unwrap())
                .unwrap();
            drop(vars);
            state.update(&live, &swa).unwrap();
        }
        // mean of 1, 2, 3
        assert!((value_of(&swa, "w") - 2.0).abs() < 1e-6);
        assert_eq!(state.n_averaged(), 3);
    }

    #[test]
    fn buffers_copied_when_averaging_disabled() {
        let device = Device::Cpu;
        let live = varmap_with("bn.running_mean", 0.0, &device);
        let swa = varmap_with("bn.running_mean", 0.0, &device);
        let mut state = SwaState::new(false, vec!["running_".to_string()]);

        for step in 1..=3 {
            let vars = live.data().lock().unwrap();
            vars["bn.running_mean"]
                .set(&Tensor::full(step as f32, (2,), &device).unwrap())
                .unwrap();
            drop(vars);
            state.update(&live, &swa).unwrap();
        }
        // buffer tracks the live value, not the mean
        assert!((value_of(&swa, "bn.running_mean") - 3.0).abs() < 1e-6);
    }

    #[test]
    fn missing_key_is_a_state_error() {
        let device = Device::Cpu;
        let live = varmap_with("w", 1.0, &device);
        let swa = varmap_with("other", 1.0, &device);
        let mut state = SwaState::new(true, vec![]);
        assert!(state.update(&live, &swa).is_err());
    }
}
