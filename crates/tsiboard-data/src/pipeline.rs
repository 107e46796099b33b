//! Multi-channel observation assembly and batching.
//!
//! Each active channel of the observation spec owns one memory-mapped
//! dataset. A query at timestamp `t` pulls every channel's sequence window
//! ending at `t`, right-aligns the blocks on `t` and stacks them into the
//! canonical `[C, T_max, D_max]` tensor plus a `[C, T_max]` validity mask
//! (u8, 1 = real row). The dataloader iterates the driving channel's keys
//! under the configured sampler and span, producing `[B,C,T,D]` batches.

use crate::dataset::ConcatDataset;
use crate::error::{DataError, DataResult};
use crate::record::{BasicRecord, KlineRecord, Record};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::Path;
use tsiboard_dsl::observation::{ChannelDecl, ObservationSpec, RecordLayout};

/// One multi-channel observation.
#[derive(Debug, Clone)]
pub struct ObservationSample {
    /// `[C, T, D]`, f32, zero-padded.
    pub features: Tensor,
    /// `[C, T]`, u8, 1 where the feature row is real data.
    pub mask: Tensor,
}

/// One batched observation.
#[derive(Debug, Clone)]
pub struct ObservationBatch {
    /// `[B, C, T, D]`.
    pub features: Tensor,
    /// `[B, C, T]`.
    pub mask: Tensor,
}

/// Record-layout dispatch over one channel file.
#[derive(Debug)]
enum ChannelDataset {
    Kline(ConcatDataset<KlineRecord>),
    Basic(ConcatDataset<BasicRecord>),
}

impl ChannelDataset {
    fn open(layout: RecordLayout, path: &Path) -> DataResult<Self> {
        match layout {
            RecordLayout::Kline => Ok(ChannelDataset::Kline(ConcatDataset::open(path)?)),
            RecordLayout::Basic => Ok(ChannelDataset::Basic(ConcatDataset::open(path)?)),
        }
    }

    fn feature_dim(&self) -> usize {
        match self {
            ChannelDataset::Kline(_) => KlineRecord::FEATURE_DIM,
            ChannelDataset::Basic(_) => BasicRecord::FEATURE_DIM,
        }
    }

    fn len(&self) -> usize {
        match self {
            ChannelDataset::Kline(ds) => ds.len(),
            ChannelDataset::Basic(ds) => ds.len(),
        }
    }

    fn key_at(&self, index: usize) -> DataResult<i64> {
        match self {
            ChannelDataset::Kline(ds) => ds.key_at(index),
            ChannelDataset::Basic(ds) => ds.key_at(index),
        }
    }

    fn leftmost_key(&self) -> i64 {
        match self {
            ChannelDataset::Kline(ds) => ds.leftmost_key(),
            ChannelDataset::Basic(ds) => ds.leftmost_key(),
        }
    }

    fn rightmost_key(&self) -> i64 {
        match self {
            ChannelDataset::Kline(ds) => ds.rightmost_key(),
            ChannelDataset::Basic(ds) => ds.rightmost_key(),
        }
    }

    fn sequence_ending_at(
        &self,
        key: i64,
        n: usize,
    ) -> DataResult<crate::dataset::SequenceBlock> {
        match self {
            ChannelDataset::Kline(ds) => ds.get_sequence_ending_at_key_value(key, n),
            ChannelDataset::Basic(ds) => ds.get_sequence_ending_at_key_value(key, n),
        }
    }
}

struct ChannelPipe {
    decl: ChannelDecl,
    dataset: ChannelDataset,
}

/// Aligned multi-channel pipeline over the active channels of a spec.
pub struct ObservationPipeline {
    channels: Vec<ChannelPipe>,
    t_max: usize,
    d_max: usize,
    device: Device,
}

impl ObservationPipeline {
    /// Open every active channel's file for `instrument`.
    pub fn open(spec: &ObservationSpec, instrument: &str, device: Device) -> DataResult<Self> {
        let mut channels = Vec::new();
        for decl in spec.active_channels() {
            if decl.instrument != instrument {
                continue;
            }
            let source = spec.source_for(&decl.instrument, &decl.interval).ok_or_else(|| {
                DataError::range(format!(
                    "channel references undeclared source: {} {}",
                    decl.instrument, decl.interval
                ))
            })?;
            let dataset = ChannelDataset::open(source.layout, Path::new(&source.file))?;
            channels.push(ChannelPipe { decl: decl.clone(), dataset });
        }
        if channels.is_empty() {
            return Err(DataError::range(format!(
                "observation spec has no active channels for instrument {instrument}"
            )));
        }
        let t_max = channels.iter().map(|c| c.decl.seq_length).max().expect("non-empty");
        let d_max = channels.iter().map(|c| c.dataset.feature_dim()).max().expect("non-empty");
        Ok(ObservationPipeline { channels, t_max, d_max, device })
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn seq_length(&self) -> usize {
        self.t_max
    }

    pub fn feature_dim(&self) -> usize {
        self.d_max
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Keys of the driving channel (channel 0).
    pub fn driving_len(&self) -> usize {
        self.channels[0].dataset.len()
    }

    pub fn driving_key_at(&self, index: usize) -> DataResult<i64> {
        self.channels[0].dataset.key_at(index)
    }

    /// Intersection of every channel's key range.
    pub fn key_range(&self) -> (i64, i64) {
        let begin =
            self.channels.iter().map(|c| c.dataset.leftmost_key()).max().expect("non-empty");
        let end =
            self.channels.iter().map(|c| c.dataset.rightmost_key()).min().expect("non-empty");
        (begin, end)
    }

    /// Assemble one `[C, T_max, D_max]` observation ending at `t`.
    pub fn sample_at(&self, t: i64) -> DataResult<ObservationSample> {
        let c = self.channels.len();
        let mut features = vec![0.0f32; c * self.t_max * self.d_max];
        let mut mask = vec![0u8; c * self.t_max];

        for (ci, channel) in self.channels.iter().enumerate() {
            let block = channel.dataset.sequence_ending_at(t, channel.decl.seq_length)?;
            // right-align on t: the block's last row lands on T_max-1
            let t_offset = self.t_max - block.rows;
            for row in 0..block.rows {
                let dst_t = t_offset + row;
                if block.mask[row] {
                    mask[ci * self.t_max + dst_t] = 1;
                }
                let src = row * block.dim;
                let dst = (ci * self.t_max + dst_t) * self.d_max;
                features[dst..dst + block.dim].copy_from_slice(&block.features[src..src + block.dim]);
            }
        }

        let features =
            Tensor::from_vec(features, (c, self.t_max, self.d_max), &self.device)?;
        let mask = Tensor::from_vec(mask, (c, self.t_max), &self.device)?;
        Ok(ObservationSample { features, mask })
    }

    /// Stack samples at the given timestamps into one batch.
    pub fn batch_at(&self, timestamps: &[i64]) -> DataResult<ObservationBatch> {
        if timestamps.is_empty() {
            return Err(DataError::range("empty batch timestamp list".to_string()));
        }
        let mut features = Vec::with_capacity(timestamps.len());
        let mut masks = Vec::with_capacity(timestamps.len());
        for &t in timestamps {
            let sample = self.sample_at(t)?;
            features.push(sample.features);
            masks.push(sample.mask);
        }
        Ok(ObservationBatch {
            features: Tensor::stack(&features, 0)?,
            mask: Tensor::stack(&masks, 0)?,
        })
    }
}

/// Index traversal order over the driving channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerMode {
    Sequential,
    Random,
}

/// Epoch-oriented batch iterator over an observation pipeline.
pub struct Dataloader {
    pipeline: ObservationPipeline,
    batch_size: usize,
    mode: SamplerMode,
    rng: StdRng,
    /// Driving-channel indices eligible under the configured span.
    indices: Vec<usize>,
    cursor: usize,
}

impl Dataloader {
    /// `span` restricts eligible anchors to driving keys inside
    /// `[begin, end]`; `None` admits every driving key.
    pub fn new(
        pipeline: ObservationPipeline,
        batch_size: usize,
        mode: SamplerMode,
        span: Option<(i64, i64)>,
        seed: u64,
    ) -> DataResult<Self> {
        if batch_size == 0 {
            return Err(DataError::range("batch_size must be > 0".to_string()));
        }
        let mut indices = Vec::new();
        for i in 0..pipeline.driving_len() {
            let key = pipeline.driving_key_at(i)?;
            let eligible = match span {
                Some((begin, end)) => key >= begin && key <= end,
                None => true,
            };
            // anchors must be representable in every channel
            let (range_begin, _) = pipeline.key_range();
            if eligible && key >= range_begin {
                indices.push(i);
            }
        }
        if indices.is_empty() {
            return Err(DataError::range(
                "no driving-channel records eligible under the configured span".to_string(),
            ));
        }
        let mut loader = Dataloader {
            pipeline,
            batch_size,
            mode,
            rng: StdRng::seed_from_u64(seed),
            indices,
            cursor: 0,
        };
        loader.reset_epoch();
        Ok(loader)
    }

    pub fn pipeline(&self) -> &ObservationPipeline {
        &self.pipeline
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }

    /// Restart the epoch; random mode reshuffles.
    pub fn reset_epoch(&mut self) {
        self.cursor = 0;
        if self.mode == SamplerMode::Random {
            self.indices.shuffle(&mut self.rng);
        }
    }

    /// Next batch of this epoch, or `None` when the epoch is exhausted.
    pub fn next_batch(&mut self) -> DataResult<Option<ObservationBatch>> {
        if self.cursor >= self.indices.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.indices.len());
        let mut timestamps = Vec::with_capacity(end - self.cursor);
        for &index in &self.indices[self.cursor..end] {
            timestamps.push(self.pipeline.driving_key_at(index)?);
        }
        self.cursor = end;
        Ok(Some(self.pipeline.batch_at(&timestamps)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packer::vec_to_binary;
    use crate::record::BasicRecord;
    use tsiboard_dsl::observation;

    const HOUR_MS: i64 = 3_600_000;

    fn fixture(dir: &tempfile::TempDir) -> ObservationSpec {
        // hourly channel: 48 records, 4-hourly channel: 12 records
        let hourly: Vec<BasicRecord> = (0..48)
            .map(|i| BasicRecord { time: (i + 1) * HOUR_MS - 1, value: i as f64 })
            .collect();
        let four_hourly: Vec<BasicRecord> = (0..12)
            .map(|i| BasicRecord { time: (i + 1) * 4 * HOUR_MS - 1, value: 100.0 + i as f64 })
            .collect();
        let p1 = dir.path().join("btc_1h.bin");
        let p4 = dir.path().join("btc_4h.bin");
        vec_to_binary(&hourly, &p1).unwrap();
        vec_to_binary(&four_hourly, &p4).unwrap();

        let sources = format!(
            "SOURCE BTCUSDT INTERVAL 1h RECORD basic FILE {}\n\
             SOURCE BTCUSDT INTERVAL 4h RECORD basic FILE {}\n",
            p1.display(),
            p4.display()
        );
        let channels = "CHANNEL BTCUSDT INTERVAL 1h SEQ_LENGTH 8 ACTIVE true\n\
                        CHANNEL BTCUSDT INTERVAL 4h SEQ_LENGTH 4 ACTIVE true\n";
        observation::decode(&sources, channels).unwrap()
    }

    #[test]
    fn sample_shape_and_alignment() {
        let dir = tempfile::tempdir().unwrap();
        let spec = fixture(&dir);
        let pipeline = ObservationPipeline::open(&spec, "BTCUSDT", Device::Cpu).unwrap();
        assert_eq!(pipeline.channel_count(), 2);
        assert_eq!(pipeline.seq_length(), 8);
        assert_eq!(pipeline.feature_dim(), 1);

        let t = 24 * HOUR_MS - 1;
        let sample = pipeline.sample_at(t).unwrap();
        assert_eq!(sample.features.dims(), &[2, 8, 1]);
        assert_eq!(sample.mask.dims(), &[2, 8]);

        let mask: Vec<Vec<u8>> = sample.mask.to_vec2().unwrap();
        // hourly channel fills its full window
        assert!(mask[0].iter().all(|&m| m == 1));
        // 4h channel has 4 real rows, right-aligned into the 8-wide window
        assert_eq!(&mask[1][..4], &[0, 0, 0, 0]);
        assert_eq!(&mask[1][4..], &[1, 1, 1, 1]);

        let feats: Vec<Vec<Vec<f32>>> = sample.features.to_vec3().unwrap();
        // last hourly row is record index 23 (close at t)
        assert!((feats[0][7][0] - 23.0).abs() < 1e-6);
        // last 4h row closes at t as well (record index 5)
        assert!((feats[1][7][0] - 105.0).abs() < 1e-6);
        // padded region is zero
        assert_eq!(feats[1][0][0], 0.0);
    }

    #[test]
    fn query_returns_latest_record_not_after_t() {
        let dir = tempfile::tempdir().unwrap();
        let spec = fixture(&dir);
        let pipeline = ObservationPipeline::open(&spec, "BTCUSDT", Device::Cpu).unwrap();
        // mid-interval query: closest hourly close before t is index 11
        let t = 12 * HOUR_MS + 123;
        let sample = pipeline.sample_at(t).unwrap();
        let feats: Vec<Vec<Vec<f32>>> = sample.features.to_vec3().unwrap();
        assert!((feats[0][7][0] - 11.0).abs() < 1e-6);
    }

    #[test]
    fn dataloader_walks_epoch_in_batches() {
        let dir = tempfile::tempdir().unwrap();
        let spec = fixture(&dir);
        let pipeline = ObservationPipeline::open(&spec, "BTCUSDT", Device::Cpu).unwrap();
        let span = Some((4 * HOUR_MS - 1, 20 * HOUR_MS));
        let mut loader =
            Dataloader::new(pipeline, 4, SamplerMode::Sequential, span, 1).unwrap();

        let mut batches = 0;
        let mut rows = 0;
        while let Some(batch) = loader.next_batch().unwrap() {
            batches += 1;
            rows += batch.features.dims()[0];
            assert_eq!(batch.features.dims()[1..], [2, 8, 1]);
            assert_eq!(batch.mask.dims()[1..], [2, 8]);
        }
        assert_eq!(batches, loader.batches_per_epoch());
        // eligible anchors: hourly closes within the span and inside every
        // channel's range
        assert_eq!(rows, 17);
        assert!(loader.next_batch().unwrap().is_none());
        loader.reset_epoch();
        assert!(loader.next_batch().unwrap().is_some());
    }

    #[test]
    fn random_sampler_is_seed_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let spec = fixture(&dir);
        let collect = |seed: u64| -> Vec<f32> {
            let pipeline = ObservationPipeline::open(&spec, "BTCUSDT", Device::Cpu).unwrap();
            let mut loader =
                Dataloader::new(pipeline, 4, SamplerMode::Random, None, seed).unwrap();
            let batch = loader.next_batch().unwrap().unwrap();
            batch.features.flatten_all().unwrap().to_vec1().unwrap()
        };
        assert_eq!(collect(7), collect(7));
    }

    #[test]
    fn empty_span_fails() {
        let dir = tempfile::tempdir().unwrap();
        let spec = fixture(&dir);
        let pipeline = ObservationPipeline::open(&spec, "BTCUSDT", Device::Cpu).unwrap();
        assert!(Dataloader::new(pipeline, 4, SamplerMode::Sequential, Some((0, 1)), 1).is_err());
    }
}
