//! Causality-preserving batch augmentation.
//!
//! Two views of every training batch come out of this module. The core is
//! a per-sample strictly increasing warp map over the time axis; around it
//! sit value jitter, a contiguous time band mask, per-sample channel
//! dropout and random point drop, all restricted to valid positions.

use crate::error::{LearnError, LearnResult};
use candle_core::{DType, Device, Tensor, D};
use rand::rngs::StdRng;
use rand::Rng;
use tsiboard_dsl::jkspec::{tables, Table};

const MIN_WARP_STEP: f64 = 1e-3;

/// Base time-perception curve of a warp map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarpCurve {
    Linear,
    MarketFade,
    PulseCentered,
    FrontLoaded,
    FadeLate,
    ChaoticDrift,
}

impl WarpCurve {
    pub fn parse(text: &str) -> LearnResult<Self> {
        match text {
            "Linear" => Ok(WarpCurve::Linear),
            "MarketFade" => Ok(WarpCurve::MarketFade),
            "PulseCentered" => Ok(WarpCurve::PulseCentered),
            "FrontLoaded" => Ok(WarpCurve::FrontLoaded),
            "FadeLate" => Ok(WarpCurve::FadeLate),
            "ChaoticDrift" => Ok(WarpCurve::ChaoticDrift),
            other => Err(LearnError::config(format!("unknown warp curve: {other}"))),
        }
    }
}

/// One augmentation preset row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WarpPreset {
    pub curve: WarpCurve,
    pub curve_param: f64,
    pub noise_scale: f64,
    pub smoothing_kernel_size: i64,
    pub point_drop_prob: f64,
    pub value_jitter_std: f64,
    pub time_mask_band_frac: f64,
    pub channel_dropout_prob: f64,
}

/// Decode the `vicreg_augmentations` table into presets, enforcing every
/// parameter domain. `time_mask_band_frac == 1` would zero every position
/// and is rejected here.
pub fn presets_from_table(table: &Table) -> LearnResult<Vec<WarpPreset>> {
    let mut presets = Vec::with_capacity(table.len());
    for row in table {
        let curve_text = match row.get("curve") {
            Some(v) => v.clone(),
            None => tables::require_column(row, "kind")?,
        };
        let preset = WarpPreset {
            curve: WarpCurve::parse(&curve_text)?,
            curve_param: tables::to_f64(&tables::require_column(row, "curve_param")?)?,
            noise_scale: tables::to_f64(&tables::require_column(row, "noise_scale")?)?,
            smoothing_kernel_size: tables::to_i64(&tables::require_column(
                row,
                "smoothing_kernel_size",
            )?)?,
            point_drop_prob: tables::to_f64(&tables::require_column(row, "point_drop_prob")?)?,
            value_jitter_std: tables::to_f64(&tables::require_column(row, "value_jitter_std")?)?,
            time_mask_band_frac: tables::to_f64(&tables::require_column(
                row,
                "time_mask_band_frac",
            )?)?,
            channel_dropout_prob: tables::to_f64(&tables::require_column(
                row,
                "channel_dropout_prob",
            )?)?,
        };

        if preset.smoothing_kernel_size < 1 {
            return Err(LearnError::config("'smoothing_kernel_size' must be >= 1"));
        }
        if !(0.0..=1.0).contains(&preset.point_drop_prob) {
            return Err(LearnError::config("'point_drop_prob' must be in [0,1]"));
        }
        if preset.value_jitter_std < 0.0 {
            return Err(LearnError::config("'value_jitter_std' must be >= 0"));
        }
        if !(0.0..1.0).contains(&preset.time_mask_band_frac) {
            return Err(LearnError::config("'time_mask_band_frac' must be in [0,1)"));
        }
        if !(0.0..=1.0).contains(&preset.channel_dropout_prob) {
            return Err(LearnError::config("'channel_dropout_prob' must be in [0,1]"));
        }
        presets.push(preset);
    }
    Ok(presets)
}

fn diff_along(t: &Tensor, dim: usize) -> LearnResult<Tensor> {
    let len = t.dims()[dim];
    let hi = t.narrow(dim, 1, len - 1)?;
    let lo = t.narrow(dim, 0, len - 1)?;
    Ok((hi - lo)?)
}

/// Build a `[B, T]` strictly increasing warp map with endpoints locked to
/// `0` and `T-1`.
///
/// 1. sample the base curve on T normalized points,
/// 2. rescale to `[0, T-1]` and broadcast to the batch,
/// 3. add Gaussian perturbations (ChaoticDrift already carries its own),
/// 4. optional box smoothing,
/// 5. monotonize: diff → ReLU+ε → cumsum,
/// 6. rescale and lock both endpoints exactly.
pub fn build_warp_map(
    b: usize,
    t: usize,
    preset: &WarpPreset,
    device: &Device,
) -> LearnResult<Tensor> {
    if b == 0 || t < 2 {
        return Err(LearnError::config("warp map requires B > 0 and T > 1"));
    }

    let step = 1.0f32 / (t as f32 - 1.0);
    let t_norm = Tensor::arange(0f32, t as f32, device)?.affine(f64::from(step), 0.0)?;

    let base = match preset.curve {
        WarpCurve::Linear => t_norm,
        WarpCurve::MarketFade => {
            let s = preset.curve_param;
            candle_nn::ops::sigmoid(&t_norm.affine(s, -0.5 * s)?)?
        }
        WarpCurve::PulseCentered => {
            let two_pi = 2.0 * std::f64::consts::PI;
            t_norm.affine(two_pi, 0.0)?.cos()?.affine(-0.5, 0.5)?
        }
        WarpCurve::FrontLoaded => t_norm.powf(preset.curve_param)?,
        WarpCurve::FadeLate => {
            let s = preset.curve_param;
            candle_nn::ops::sigmoid(&t_norm.affine(s, -0.5 * s)?)?.affine(-1.0, 1.0)?
        }
        WarpCurve::ChaoticDrift => {
            let noise = Tensor::randn(0f32, 1f32, t, device)?.affine(preset.noise_scale, 0.0)?;
            (t_norm + noise)?
        }
    };

    // rescale to [0, T-1]
    let min = base.min(0)?.to_scalar::<f32>()? as f64;
    let max = base.max(0)?.to_scalar::<f32>()? as f64;
    let span = (max - min).max(1e-6);
    let base = base.affine((t as f64 - 1.0) / span, -min * (t as f64 - 1.0) / span)?;

    let mut warp = base.unsqueeze(0)?.expand((b, t))?.contiguous()?;
    if preset.noise_scale != 0.0 && preset.curve != WarpCurve::ChaoticDrift {
        let noise =
            Tensor::randn(0f32, 1f32, (b, t), device)?.affine(preset.noise_scale, 0.0)?;
        warp = (warp + noise)?;
    }

    if preset.smoothing_kernel_size > 1 {
        let k = preset.smoothing_kernel_size as usize;
        let kernel = Tensor::ones((1, 1, k), DType::F32, device)?.affine(1.0 / k as f64, 0.0)?;
        let pad = k / 2;
        warp = warp.unsqueeze(1)?.conv1d(&kernel, pad, 1, 1, 1)?.squeeze(1)?;
        // even kernels emit one extra column; keep T fixed
        let out_len = warp.dims()[1];
        if out_len > t {
            warp = warp.narrow(1, 0, t)?;
        }
    }

    // strictly positive steps, then integrate
    let diffs = diff_along(&warp, 1)?;
    let pos_diffs = diffs.relu()?.affine(1.0, MIN_WARP_STEP)?;
    let first = warp.narrow(1, 0, 1)?;
    let warp_mono =
        Tensor::cat(&[&first, &first.broadcast_add(&pos_diffs.cumsum(1)?)?], 1)?;

    // rescale per sample to [0, T-1] and lock endpoints exactly
    let min_vals = warp_mono.narrow(1, 0, 1)?;
    let max_vals = warp_mono.narrow(1, t - 1, 1)?;
    let denom = max_vals.broadcast_sub(&min_vals)?.affine(1.0, 1e-6)?;
    let warp_map = warp_mono
        .broadcast_sub(&min_vals)?
        .broadcast_div(&denom)?
        .affine(t as f64 - 1.0, 0.0)?;

    let zeros = Tensor::zeros((b, 1), DType::F32, device)?;
    let last = Tensor::full((t - 1) as f32, (b, 1), device)?;
    let interior = warp_map.narrow(1, 1, t - 2)?;
    Ok(Tensor::cat(&[&zeros, &interior, &last], 1)?.contiguous()?)
}

/// Warp `x: [B,C,T,D]` along T with a strictly increasing `warp_map:
/// [B,T]`. Hard-mask semantics: an output point whose floor or ceil source
/// is masked off becomes invalid and zero.
pub fn causal_time_warp(
    x: &Tensor,
    m: &Tensor,
    warp_map: &Tensor,
) -> LearnResult<(Tensor, Tensor)> {
    let (b, c, t, d) = x.dims4()?;
    if m.dims() != [b, c, t] {
        return Err(LearnError::config("mask must be [B,C,T] matching data"));
    }
    if warp_map.dims() != [b, t] {
        return Err(LearnError::config("warp_map must be [B,T]"));
    }

    let w = warp_map.clamp(0.0, t as f64 - 1.0 - 1e-6)?;
    let i0 = w.floor()?;
    let i1 = i0.affine(1.0, 1.0)?;
    let alpha = (&w - &i0)?;

    let expand4 = |idx: &Tensor| -> LearnResult<Tensor> {
        Ok(idx
            .to_dtype(DType::U32)?
            .reshape((b, 1, t, 1))?
            .expand((b, c, t, d))?
            .contiguous()?)
    };
    let expand3 = |idx: &Tensor| -> LearnResult<Tensor> {
        Ok(idx
            .to_dtype(DType::U32)?
            .reshape((b, 1, t))?
            .expand((b, c, t))?
            .contiguous()?)
    };

    let x0 = x.gather(&expand4(&i0)?, 2)?;
    let x1 = x.gather(&expand4(&i1)?, 2)?;
    let m0 = m.gather(&expand3(&i0)?, 2)?;
    let m1 = m.gather(&expand3(&i1)?, 2)?;
    let valid = (m0 * m1)?; // u8 AND

    let alpha4 = alpha
        .to_dtype(x.dtype())?
        .reshape((b, 1, t, 1))?
        .broadcast_as((b, c, t, d))?;
    let y = (&x0 + alpha4.mul(&(&x1 - &x0)?)?)?;

    let valid_f = valid.to_dtype(y.dtype())?.unsqueeze(D::Minus1)?.broadcast_as((b, c, t, d))?;
    let y = y.mul(&valid_f)?;
    Ok((y, valid))
}

/// Drop valid mask points independently with probability `prob`.
pub fn random_point_drop(m: &Tensor, prob: f64, device: &Device) -> LearnResult<Tensor> {
    if !(0.0..=1.0).contains(&prob) {
        return Err(LearnError::config("point drop probability must be in [0,1]"));
    }
    if prob == 0.0 {
        return Ok(m.clone());
    }
    let keep = Tensor::rand(0f32, 1f32, m.dims(), device)?
        .ge(prob)?
        .to_dtype(m.dtype())?;
    Ok((m * keep)?)
}

/// The augmentation engine: a preset table plus the ops above.
#[derive(Debug, Clone)]
pub struct Augmentation {
    pub presets: Vec<WarpPreset>,
}

impl Augmentation {
    pub fn from_table(table: &Table) -> LearnResult<Self> {
        let presets = presets_from_table(table)?;
        if presets.is_empty() {
            return Err(LearnError::config("no augmentation presets configured"));
        }
        Ok(Augmentation { presets })
    }

    /// Apply one preset to `(x, m)`.
    pub fn apply(
        &self,
        x: &Tensor,
        m: &Tensor,
        preset: &WarpPreset,
        rng: &mut StdRng,
    ) -> LearnResult<(Tensor, Tensor)> {
        let (b, c, t, d) = x.dims4()?;
        let device = x.device().clone();

        let warp_map = build_warp_map(b, t, preset, &device)?;
        let (mut data, mut mask) = causal_time_warp(x, m, &warp_map)?;

        // value jitter on valid points only
        if preset.value_jitter_std > 0.0 {
            let noise = Tensor::randn(0f32, 1f32, (b, c, t, d), &device)?
                .affine(preset.value_jitter_std, 0.0)?
                .to_dtype(data.dtype())?;
            let valid4 = mask
                .to_dtype(data.dtype())?
                .unsqueeze(D::Minus1)?
                .broadcast_as((b, c, t, d))?;
            data = (data + noise.mul(&valid4)?)?;
        }

        // contiguous time band mask
        if preset.time_mask_band_frac > 0.0 {
            let band =
                (((t as f64) * preset.time_mask_band_frac).round() as usize).clamp(1, t - 1);
            let mut band_keep = vec![1f32; b * t];
            for bi in 0..b {
                let start = rng.gen_range(0..=(t - band));
                for ti in start..start + band {
                    band_keep[bi * t + ti] = 0.0;
                }
            }
            let band_keep = Tensor::from_vec(band_keep, (b, 1, t), &device)?;
            mask = mask.broadcast_mul(&band_keep.to_dtype(mask.dtype())?)?;
            data = data.broadcast_mul(
                &band_keep.to_dtype(data.dtype())?.unsqueeze(D::Minus1)?,
            )?;
        }

        // per-sample channel dropout
        if preset.channel_dropout_prob > 0.0 {
            let keep = Tensor::rand(0f32, 1f32, (b, c, 1), &device)?
                .ge(preset.channel_dropout_prob)?;
            mask = mask.broadcast_mul(&keep.to_dtype(mask.dtype())?)?;
            data = data.broadcast_mul(
                &keep.to_dtype(data.dtype())?.unsqueeze(D::Minus1)?,
            )?;
        }

        let mask = random_point_drop(&mask, preset.point_drop_prob, &device)?;
        Ok((data, mask))
    }

    /// Sample one preset uniformly with the trainer RNG and apply it.
    pub fn augment(&self, x: &Tensor, m: &Tensor, rng: &mut StdRng) -> LearnResult<(Tensor, Tensor)> {
        let idx = rng.gen_range(0..self.presets.len());
        let preset = self.presets[idx];
        self.apply(x, m, &preset, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn preset(curve: WarpCurve) -> WarpPreset {
        WarpPreset {
            curve,
            curve_param: 5.0,
            noise_scale: 0.1,
            smoothing_kernel_size: 5,
            point_drop_prob: 0.0,
            value_jitter_std: 0.0,
            time_mask_band_frac: 0.0,
            channel_dropout_prob: 0.0,
        }
    }

    #[test]
    fn warp_map_is_strictly_increasing_with_locked_endpoints() {
        let device = Device::Cpu;
        let p = WarpPreset { curve_param: 5.0, ..preset(WarpCurve::MarketFade) };
        let warp = build_warp_map(4, 128, &p, &device).unwrap();
        let rows: Vec<Vec<f32>> = warp.to_vec2().unwrap();
        for row in &rows {
            assert_eq!(row[0], 0.0);
            assert_eq!(row[127], 127.0);
            for w in row.windows(2) {
                assert!(w[1] - w[0] >= 1e-3 - 1e-6, "step {} -> {}", w[0], w[1]);
            }
        }
    }

    #[test]
    fn every_curve_builds_a_monotone_map() {
        let device = Device::Cpu;
        for curve in [
            WarpCurve::Linear,
            WarpCurve::MarketFade,
            WarpCurve::PulseCentered,
            WarpCurve::FrontLoaded,
            WarpCurve::FadeLate,
            WarpCurve::ChaoticDrift,
        ] {
            let mut p = preset(curve);
            if curve == WarpCurve::FrontLoaded {
                p.curve_param = 0.5;
            }
            let warp = build_warp_map(2, 32, &p, &device).unwrap();
            let rows: Vec<Vec<f32>> = warp.to_vec2().unwrap();
            for row in rows {
                for w in row.windows(2) {
                    assert!(w[1] > w[0], "curve {curve:?}");
                }
            }
        }
    }

    #[test]
    fn time_warp_marks_contaminated_positions_invalid_and_zero() {
        let device = Device::Cpu;
        let (b, c, t, d) = (1, 1, 6, 1);
        let x = Tensor::arange(0f32, (b * c * t * d) as f32, &device)
            .unwrap()
            .reshape((b, c, t, d))
            .unwrap();
        // positions 0..=1 invalid (left padding)
        let m = Tensor::from_vec(vec![0u8, 0, 1, 1, 1, 1], (b, c, t), &device).unwrap();
        let identity = Tensor::from_vec(
            (0..t).map(|i| i as f32).collect::<Vec<_>>(),
            (b, t),
            &device,
        )
        .unwrap();
        let (y, valid) = causal_time_warp(&x, &m, &identity).unwrap();
        let valid: Vec<Vec<Vec<u8>>> = valid.to_vec3().unwrap();
        assert_eq!(valid[0][0], vec![0, 0, 1, 1, 1, 1]);
        let y: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(y[0], 0.0);
        assert_eq!(y[1], 0.0);
        assert!(y[2] > 0.0);
    }

    #[test]
    fn band_mask_zeroes_a_contiguous_band() {
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(11);
        let (b, c, t, d) = (2, 2, 16, 3);
        let x = Tensor::ones((b, c, t, d), DType::F32, &device).unwrap();
        let m = Tensor::ones((b, c, t), DType::U8, &device).unwrap();
        let p = WarpPreset {
            curve: WarpCurve::Linear,
            curve_param: 0.0,
            noise_scale: 0.0,
            smoothing_kernel_size: 1,
            point_drop_prob: 0.0,
            value_jitter_std: 0.0,
            time_mask_band_frac: 0.25,
            channel_dropout_prob: 0.0,
        };
        let aug = Augmentation { presets: vec![p] };
        let (_data, mask) = aug.apply(&x, &m, &p, &mut rng).unwrap();
        let mask: Vec<Vec<Vec<u8>>> = mask.to_vec3().unwrap();
        for bi in 0..b {
            let dropped: usize =
                mask[bi][0].iter().map(|&v| usize::from(v == 0)).sum();
            assert_eq!(dropped, 4, "band width is frac*T");
        }
    }

    #[test]
    fn preset_table_rejects_full_band() {
        let mut row = tsiboard_dsl::jkspec::Row::new();
        for (k, v) in [
            ("row_id", "N/A"),
            ("kind", "Linear"),
            ("curve_param", "0.0"),
            ("noise_scale", "0.0"),
            ("smoothing_kernel_size", "1"),
            ("point_drop_prob", "0.0"),
            ("value_jitter_std", "0.0"),
            ("time_mask_band_frac", "1.0"),
            ("channel_dropout_prob", "0.0"),
        ] {
            row.insert(k.to_string(), v.to_string());
        }
        let err = presets_from_table(&vec![row]).unwrap_err();
        assert!(err.to_string().contains("time_mask_band_frac"), "{err}");
    }

    #[test]
    fn augment_produces_same_shapes() {
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(3);
        let x = Tensor::randn(0f32, 1f32, (2, 3, 12, 4), &device).unwrap();
        let m = Tensor::ones((2, 3, 12), DType::U8, &device).unwrap();
        let aug = Augmentation {
            presets: vec![WarpPreset {
                curve: WarpCurve::MarketFade,
                curve_param: 3.0,
                noise_scale: 0.02,
                smoothing_kernel_size: 3,
                point_drop_prob: 0.05,
                value_jitter_std: 0.01,
                time_mask_band_frac: 0.1,
                channel_dropout_prob: 0.05,
            }],
        };
        let (data, mask) = aug.augment(&x, &m, &mut rng).unwrap();
        assert_eq!(data.dims(), x.dims());
        assert_eq!(mask.dims(), m.dims());
    }
}
