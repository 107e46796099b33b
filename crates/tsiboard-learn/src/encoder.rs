//! VICReg-4D encoder: per-channel expansion, channel fusion, stacked
//! residual blocks, projection head to the embedding width.
//!
//! The mask travels with the data: masked positions are zeroed before the
//! channel stack is fused so padding never contaminates a timestep, and a
//! `[B, T]` time-validity mask (any channel valid) is returned alongside
//! the representation.

use crate::error::LearnResult;
use candle_core::{DType, Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderDims {
    pub c: usize,
    pub t: usize,
    pub d: usize,
    pub encoding_dims: usize,
    pub channel_expansion_dim: usize,
    pub fused_feature_dim: usize,
    pub encoder_hidden_dims: usize,
    pub encoder_depth: usize,
}

#[derive(Debug)]
struct EncoderBlock {
    fc1: Linear,
    fc2: Linear,
}

impl EncoderBlock {
    fn forward(&self, x: &Tensor) -> LearnResult<Tensor> {
        let h = self.fc1.forward(x)?.gelu_erf()?;
        let h = self.fc2.forward(&h)?;
        // residual keeps deep stacks stable
        Ok((x + h)?)
    }
}

#[derive(Debug)]
pub struct VicregEncoder {
    dims: EncoderDims,
    channel_expand: Linear,
    channel_fuse: Linear,
    trunk_in: Linear,
    blocks: Vec<EncoderBlock>,
    head: Linear,
}

impl VicregEncoder {
    pub fn new(dims: EncoderDims, vb: VarBuilder) -> LearnResult<Self> {
        let channel_expand = linear(dims.d, dims.channel_expansion_dim, vb.pp("channel_expand"))?;
        let channel_fuse = linear(
            dims.c * dims.channel_expansion_dim,
            dims.fused_feature_dim,
            vb.pp("channel_fuse"),
        )?;
        let trunk_in = linear(dims.fused_feature_dim, dims.encoder_hidden_dims, vb.pp("trunk_in"))?;
        let mut blocks = Vec::with_capacity(dims.encoder_depth);
        for i in 0..dims.encoder_depth {
            let vb_block = vb.pp(format!("block_{i}"));
            blocks.push(EncoderBlock {
                fc1: linear(dims.encoder_hidden_dims, dims.encoder_hidden_dims, vb_block.pp("fc1"))?,
                fc2: linear(dims.encoder_hidden_dims, dims.encoder_hidden_dims, vb_block.pp("fc2"))?,
            });
        }
        let head = linear(dims.encoder_hidden_dims, dims.encoding_dims, vb.pp("head"))?;
        Ok(VicregEncoder { dims, channel_expand, channel_fuse, trunk_in, blocks, head })
    }

    /// `x: [B,C,T,D]`, `mask: [B,C,T]` (u8) → `([B,T,E], [B,T])`.
    pub fn forward(&self, x: &Tensor, mask: &Tensor) -> LearnResult<(Tensor, Tensor)> {
        let (b, c, t, _d) = x.dims4()?;

        // zero masked positions before anything mixes across channels
        let mask_f = mask.to_dtype(x.dtype())?.unsqueeze(D::Minus1)?;
        let x = x.broadcast_mul(&mask_f)?;

        // per-channel expansion: [B,C,T,D] -> [B,C,T,X]
        let expanded = self.channel_expand.forward(&x)?;
        let expanded = expanded.broadcast_mul(&mask_f)?;

        // fuse channels per timestep: [B,T,C*X]
        let fused_in = expanded
            .transpose(1, 2)? // [B,T,C,X]
            .contiguous()?
            .reshape((b, t, c * self.dims.channel_expansion_dim))?;
        let fused = self.channel_fuse.forward(&fused_in)?.gelu_erf()?;

        let mut h = self.trunk_in.forward(&fused)?.gelu_erf()?;
        for block in &self.blocks {
            h = block.forward(&h)?;
        }
        let rep = self.head.forward(&h)?;

        // timestep valid iff any channel carries real data there
        let time_mask = mask.to_dtype(DType::F32)?.sum(1)?.gt(0.0)?;
        Ok((rep, time_mask))
    }

    pub fn dims(&self) -> EncoderDims {
        self.dims
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::{VarBuilder, VarMap};

    fn dims() -> EncoderDims {
        EncoderDims {
            c: 2,
            t: 12,
            d: 4,
            encoding_dims: 16,
            channel_expansion_dim: 8,
            fused_feature_dim: 8,
            encoder_hidden_dims: 8,
            encoder_depth: 2,
        }
    }

    #[test]
    fn forward_shapes_and_mask() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = VicregEncoder::new(dims(), vb).unwrap();

        let x = Tensor::randn(0f32, 1f32, (3, 2, 12, 4), &device).unwrap();
        let mut mask_data = vec![1u8; 3 * 2 * 12];
        // knock out every channel at t=0 for sample 0
        mask_data[0] = 0;
        mask_data[12] = 0;
        let mask = Tensor::from_vec(mask_data, (3, 2, 12), &device).unwrap();

        let (rep, time_mask) = encoder.forward(&x, &mask).unwrap();
        assert_eq!(rep.dims(), &[3, 12, 16]);
        assert_eq!(time_mask.dims(), &[3, 12]);
        let tm: Vec<Vec<u8>> = time_mask.to_vec2().unwrap();
        assert_eq!(tm[0][0], 0);
        assert_eq!(tm[0][1], 1);
    }

    #[test]
    fn masked_positions_do_not_change_output_elsewhere() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = VicregEncoder::new(dims(), vb).unwrap();

        let x = Tensor::randn(0f32, 1f32, (1, 2, 12, 4), &device).unwrap();
        let mask = Tensor::ones((1, 2, 12), DType::U8, &device).unwrap();
        let (rep_full, _) = encoder.forward(&x, &mask).unwrap();

        // poison the masked-out position with huge values
        let mut mask_data = vec![1u8; 2 * 12];
        mask_data[5] = 0;
        mask_data[12 + 5] = 0;
        let mask2 = Tensor::from_vec(mask_data, (1, 2, 12), &device).unwrap();
        let poison = Tensor::full(1e6f32, (1, 2, 12, 4), &device).unwrap();
        let sel = mask2
            .to_dtype(DType::F32)
            .unwrap()
            .unsqueeze(D::Minus1)
            .unwrap()
            .broadcast_as((1, 2, 12, 4))
            .unwrap();
        let x_poisoned =
            (x.mul(&sel).unwrap() + poison.mul(&sel.affine(-1.0, 1.0).unwrap()).unwrap()).unwrap();
        let (rep_poisoned, _) = encoder.forward(&x_poisoned, &mask2).unwrap();

        // unmasked timestep t=0 must be identical under both inputs
        let a: Vec<f32> =
            rep_full.narrow(1, 0, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> =
            rep_poisoned.narrow(1, 0, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }
}
