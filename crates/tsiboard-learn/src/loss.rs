//! Loss functions built from JKSPEC rows.
//!
//! VICReg is the workhorse: invariance (MSE between views), a variance
//! hinge that keeps every embedding dimension alive, and a covariance
//! penalty that decorrelates dimensions. Invalid positions never reach the
//! terms; the caller masks rows out before projection.

use crate::error::{LearnError, LearnResult};
use candle_core::{DType, Tensor, D};
use tsiboard_dsl::jkspec::{tables, Row, ROW_ID};

fn scalar_f64(t: &Tensor) -> LearnResult<f64> {
    Ok(t.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}

/// Scalar loss plus the VICReg term breakdown for metrics.
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub total: Tensor,
    pub invariance: f64,
    pub variance: f64,
    pub covariance: f64,
}

pub trait LossAny: Send + Sync {
    /// `za`, `zb` are `[N, E]` projected views over valid rows only.
    fn forward(&self, za: &Tensor, zb: &Tensor) -> LearnResult<LossOutput>;
    fn type_name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy)]
pub struct VicRegLoss {
    pub sim_coeff: f64,
    pub std_coeff: f64,
    pub cov_coeff: f64,
}

fn center(z: &Tensor) -> LearnResult<Tensor> {
    let mean = z.mean_keepdim(0)?;
    Ok(z.broadcast_sub(&mean)?)
}

fn variance_term(z: &Tensor) -> LearnResult<Tensor> {
    let n = z.dims()[0] as f64;
    let centered = center(z)?;
    let var = centered.sqr()?.sum(0)?.affine(1.0 / (n - 1.0).max(1.0), 0.0)?;
    let std = var.affine(1.0, 1e-4)?.sqrt()?;
    // hinge at std = 1
    let hinge = std.affine(-1.0, 1.0)?.relu()?;
    Ok(hinge.mean_all()?)
}

fn covariance_term(z: &Tensor) -> LearnResult<Tensor> {
    let (n, e) = z.dims2()?;
    let centered = center(z)?;
    let cov = centered
        .transpose(0, 1)?
        .matmul(&centered)?
        .affine(1.0 / (n as f64 - 1.0).max(1.0), 0.0)?;
    // off-diagonal squared sum / E
    let diag_mask = Tensor::eye(e, cov.dtype(), cov.device())?;
    let off_diag = cov.mul(&diag_mask.affine(-1.0, 1.0)?)?;
    Ok(off_diag.sqr()?.sum_all()?.affine(1.0 / e as f64, 0.0)?)
}

impl LossAny for VicRegLoss {
    fn forward(&self, za: &Tensor, zb: &Tensor) -> LearnResult<LossOutput> {
        if za.dims() != zb.dims() {
            return Err(LearnError::config("VICReg views must share a shape"));
        }
        let invariance = (za - zb)?.sqr()?.mean_all()?;
        let variance = (variance_term(za)? + variance_term(zb)?)?;
        let covariance = (covariance_term(za)? + covariance_term(zb)?)?;

        let total = (invariance.affine(self.sim_coeff, 0.0)?
            + (variance.affine(self.std_coeff, 0.0)? + covariance.affine(self.cov_coeff, 0.0)?)?)?;
        Ok(LossOutput {
            invariance: scalar_f64(&invariance)?,
            variance: scalar_f64(&variance)?,
            covariance: scalar_f64(&covariance)?,
            total,
        })
    }

    fn type_name(&self) -> &'static str {
        "VicReg"
    }
}

/// Plain mean squared error between the two inputs.
pub struct MseLoss;

impl LossAny for MseLoss {
    fn forward(&self, za: &Tensor, zb: &Tensor) -> LearnResult<LossOutput> {
        let total = (za - zb)?.sqr()?.mean_all()?;
        let value = scalar_f64(&total)?;
        Ok(LossOutput { total, invariance: value, variance: 0.0, covariance: 0.0 })
    }

    fn type_name(&self) -> &'static str {
        "MeanSquaredError"
    }
}

/// Cross entropy of logits `za` against target distributions `zb`.
pub struct CrossEntropyLoss {
    pub label_smoothing: f64,
}

impl LossAny for CrossEntropyLoss {
    fn forward(&self, za: &Tensor, zb: &Tensor) -> LearnResult<LossOutput> {
        let e = za.dims2()?.1 as f64;
        let log_probs = candle_nn::ops::log_softmax(za, D::Minus1)?;
        let target = if self.label_smoothing > 0.0 {
            zb.affine(1.0 - self.label_smoothing, self.label_smoothing / e)?
        } else {
            zb.clone()
        };
        let total = target.mul(&log_probs)?.sum(D::Minus1)?.mean_all()?.affine(-1.0, 0.0)?;
        let value = scalar_f64(&total)?;
        Ok(LossOutput { total, invariance: value, variance: 0.0, covariance: 0.0 })
    }

    fn type_name(&self) -> &'static str {
        "CrossEntropy"
    }
}

/// Build the loss described by one `loss_functions_table` row.
pub fn make_loss(row: &Row) -> LearnResult<Box<dyn LossAny>> {
    tables::require_columns_exact(row, &[ROW_ID, "type", "options"])?;
    let loss_type = tables::require_column(row, "type")?;
    let f = |key: &str| -> LearnResult<f64> { Ok(tables::to_f64(&tables::require_option(row, key)?)?) };

    match loss_type.as_str() {
        "VicReg" => {
            tables::validate_options_exact(row, &["sim_coeff", "std_coeff", "cov_coeff"])?;
            Ok(Box::new(VicRegLoss {
                sim_coeff: f("sim_coeff")?,
                std_coeff: f("std_coeff")?,
                cov_coeff: f("cov_coeff")?,
            }))
        }
        "MeanSquaredError" => {
            tables::validate_options_exact(row, &["reduction"])?;
            Ok(Box::new(MseLoss))
        }
        "CrossEntropy" => {
            tables::validate_options_exact(row, &["reduction", "label_smoothing"])?;
            Ok(Box::new(CrossEntropyLoss { label_smoothing: f("label_smoothing")? }))
        }
        other => Err(LearnError::config(format!("unknown loss type: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn row(loss_type: &str, options: &str) -> Row {
        let mut row = Row::new();
        row.insert(ROW_ID.to_string(), "r::loss".to_string());
        row.insert("type".to_string(), loss_type.to_string());
        row.insert("options".to_string(), options.to_string());
        row
    }

    #[test]
    fn vicreg_identical_views_have_zero_invariance() {
        let device = Device::Cpu;
        let z = Tensor::randn(0f32, 1f32, (16, 8), &device).unwrap();
        let loss = VicRegLoss { sim_coeff: 25.0, std_coeff: 25.0, cov_coeff: 1.0 };
        let out = loss.forward(&z, &z).unwrap();
        assert!(out.invariance.abs() < 1e-6);
        let total = out.total.to_scalar::<f32>().unwrap();
        assert!(total.is_finite());
    }

    #[test]
    fn vicreg_penalizes_collapsed_embeddings() {
        let device = Device::Cpu;
        let collapsed = Tensor::zeros((16, 8), candle_core::DType::F32, &device).unwrap();
        let spread = Tensor::randn(0f32, 2f32, (16, 8), &device).unwrap();
        let loss = VicRegLoss { sim_coeff: 0.0, std_coeff: 1.0, cov_coeff: 0.0 };
        let collapsed_v = loss.forward(&collapsed, &collapsed).unwrap().variance;
        let spread_v = loss.forward(&spread, &spread).unwrap().variance;
        assert!(collapsed_v > spread_v);
        // fully collapsed embeddings sit on the hinge maximum
        assert!((collapsed_v - 2.0).abs() < 0.1);
    }

    #[test]
    fn builders_enforce_exact_option_sets() {
        assert!(make_loss(&row("VicReg", "sim_coeff=25.0,std_coeff=25.0,cov_coeff=1.0")).is_ok());
        assert!(make_loss(&row("VicReg", "sim_coeff=25.0")).is_err());
        assert!(make_loss(&row("MeanSquaredError", "reduction=mean")).is_ok());
        assert!(make_loss(&row("CrossEntropy", "reduction=mean,label_smoothing=0.1")).is_ok());
        assert!(make_loss(&row("Hinge", "margin=1.0")).is_err());
    }
}
