//! Fixed-size binary records.
//!
//! A channel file is a raw concatenation of records of identical size,
//! little-endian, no header or footer. Each record type declares the byte
//! offset of its monotonically non-decreasing key field so key extraction
//! is a single 8-byte read; full decoding happens only when features are
//! materialized.

use crate::error::{DataError, DataResult};

/// Fixed-layout row stored in a channel file.
pub trait Record: Sized {
    /// Serialized size in bytes.
    const SIZE: usize;
    /// Byte offset of the key field inside one record.
    const KEY_OFFSET: usize;
    /// Feature vector width.
    const FEATURE_DIM: usize;
    /// Short layout tag used by the observation spec.
    const LAYOUT_TAG: &'static str;

    /// Read the key from one serialized record.
    fn key_of(buf: &[u8]) -> i64;
    /// Decode one serialized record.
    fn from_bytes(buf: &[u8]) -> Self;
    /// Serialize into exactly `SIZE` bytes.
    fn to_bytes(&self) -> Vec<u8>;
    /// Feature values in the fixed packer order.
    fn features(&self) -> Vec<f32>;
    /// Parse one CSV line (packer input).
    fn from_csv(line: &str, line_number: usize) -> DataResult<Self>;
}

fn read_i64_le(buf: &[u8], offset: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    i64::from_le_bytes(bytes)
}

fn read_f64_le(buf: &[u8], offset: usize) -> f64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    f64::from_le_bytes(bytes)
}

fn read_i32_le(buf: &[u8], offset: usize) -> i32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    i32::from_le_bytes(bytes)
}

fn csv_field<'a>(fields: &[&'a str], idx: usize, line_number: usize) -> DataResult<&'a str> {
    fields.get(idx).copied().ok_or_else(|| {
        DataError::range(format!("csv line {line_number}: missing field {idx}"))
    })
}

fn parse_csv<T: std::str::FromStr>(
    fields: &[&str],
    idx: usize,
    line_number: usize,
) -> DataResult<T> {
    let raw = csv_field(fields, idx, line_number)?;
    raw.trim().parse().map_err(|_| {
        DataError::range(format!("csv line {line_number}: invalid value '{raw}' at field {idx}"))
    })
}

/// One candlestick row. Key is `close_time` (unix ms).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KlineRecord {
    pub open_time: i64,
    pub open_price: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub close_price: f64,
    pub volume: f64,
    pub close_time: i64,
    pub quote_asset_volume: f64,
    pub number_of_trades: i32,
    pub taker_buy_base_volume: f64,
    pub taker_buy_quote_volume: f64,
}

impl Record for KlineRecord {
    // 2 x i64 + 8 x f64 + 1 x i32, packed
    const SIZE: usize = 84;
    const KEY_OFFSET: usize = 48;
    const FEATURE_DIM: usize = 8;
    const LAYOUT_TAG: &'static str = "kline";

    fn key_of(buf: &[u8]) -> i64 {
        read_i64_le(buf, Self::KEY_OFFSET)
    }

    fn from_bytes(buf: &[u8]) -> Self {
        KlineRecord {
            open_time: read_i64_le(buf, 0),
            open_price: read_f64_le(buf, 8),
            high_price: read_f64_le(buf, 16),
            low_price: read_f64_le(buf, 24),
            close_price: read_f64_le(buf, 32),
            volume: read_f64_le(buf, 40),
            close_time: read_i64_le(buf, 48),
            quote_asset_volume: read_f64_le(buf, 56),
            number_of_trades: read_i32_le(buf, 64),
            taker_buy_base_volume: read_f64_le(buf, 68),
            taker_buy_quote_volume: read_f64_le(buf, 76),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.open_time.to_le_bytes());
        out.extend_from_slice(&self.open_price.to_le_bytes());
        out.extend_from_slice(&self.high_price.to_le_bytes());
        out.extend_from_slice(&self.low_price.to_le_bytes());
        out.extend_from_slice(&self.close_price.to_le_bytes());
        out.extend_from_slice(&self.volume.to_le_bytes());
        out.extend_from_slice(&self.close_time.to_le_bytes());
        out.extend_from_slice(&self.quote_asset_volume.to_le_bytes());
        out.extend_from_slice(&self.number_of_trades.to_le_bytes());
        out.extend_from_slice(&self.taker_buy_base_volume.to_le_bytes());
        out.extend_from_slice(&self.taker_buy_quote_volume.to_le_bytes());
        out
    }

    fn features(&self) -> Vec<f32> {
        vec![
            self.open_price as f32,
            self.high_price as f32,
            self.low_price as f32,
            self.close_price as f32,
            self.volume as f32,
            self.quote_asset_volume as f32,
            self.taker_buy_base_volume as f32,
            self.taker_buy_quote_volume as f32,
        ]
    }

    fn from_csv(line: &str, line_number: usize) -> DataResult<Self> {
        let fields: Vec<&str> = line.split(',').collect();
        Ok(KlineRecord {
            open_time: parse_csv(&fields, 0, line_number)?,
            open_price: parse_csv(&fields, 1, line_number)?,
            high_price: parse_csv(&fields, 2, line_number)?,
            low_price: parse_csv(&fields, 3, line_number)?,
            close_price: parse_csv(&fields, 4, line_number)?,
            volume: parse_csv(&fields, 5, line_number)?,
            close_time: parse_csv(&fields, 6, line_number)?,
            quote_asset_volume: parse_csv(&fields, 7, line_number)?,
            number_of_trades: parse_csv(&fields, 8, line_number)?,
            taker_buy_base_volume: parse_csv(&fields, 9, line_number)?,
            taker_buy_quote_volume: parse_csv(&fields, 10, line_number)?,
        })
    }
}

/// Minimal `(time, value)` row. Key is `time` (unix ms).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BasicRecord {
    pub time: i64,
    pub value: f64,
}

impl Record for BasicRecord {
    const SIZE: usize = 16;
    const KEY_OFFSET: usize = 0;
    const FEATURE_DIM: usize = 1;
    const LAYOUT_TAG: &'static str = "basic";

    fn key_of(buf: &[u8]) -> i64 {
        read_i64_le(buf, Self::KEY_OFFSET)
    }

    fn from_bytes(buf: &[u8]) -> Self {
        BasicRecord { time: read_i64_le(buf, 0), value: read_f64_le(buf, 8) }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.time.to_le_bytes());
        out.extend_from_slice(&self.value.to_le_bytes());
        out
    }

    fn features(&self) -> Vec<f32> {
        vec![self.value as f32]
    }

    fn from_csv(line: &str, line_number: usize) -> DataResult<Self> {
        let fields: Vec<&str> = line.split(',').collect();
        Ok(BasicRecord {
            time: parse_csv(&fields, 0, line_number)?,
            value: parse_csv(&fields, 1, line_number)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_kline(i: i64) -> KlineRecord {
        KlineRecord {
            open_time: i * 3_600_000,
            open_price: 100.0 + i as f64,
            high_price: 101.0 + i as f64,
            low_price: 99.0 + i as f64,
            close_price: 100.5 + i as f64,
            volume: 10.0,
            close_time: (i + 1) * 3_600_000 - 1,
            quote_asset_volume: 1000.0,
            number_of_trades: 42,
            taker_buy_base_volume: 5.0,
            taker_buy_quote_volume: 500.0,
        }
    }

    #[test]
    fn kline_bytes_round_trip() {
        let rec = sample_kline(3);
        let bytes = rec.to_bytes();
        assert_eq!(bytes.len(), KlineRecord::SIZE);
        assert_eq!(KlineRecord::from_bytes(&bytes), rec);
        assert_eq!(KlineRecord::key_of(&bytes), rec.close_time);
        assert_eq!(rec.features().len(), KlineRecord::FEATURE_DIM);
    }

    #[test]
    fn basic_bytes_round_trip() {
        let rec = BasicRecord { time: 1_000, value: 2.5 };
        let bytes = rec.to_bytes();
        assert_eq!(bytes.len(), BasicRecord::SIZE);
        assert_eq!(BasicRecord::from_bytes(&bytes), rec);
        assert_eq!(BasicRecord::key_of(&bytes), 1_000);
    }

    #[test]
    fn kline_csv_parses_and_fails_loud() {
        let line = "0,100,101,99,100.5,10,3599999,1000,42,5,500";
        let rec = KlineRecord::from_csv(line, 1).unwrap();
        assert_eq!(rec.close_time, 3_599_999);
        assert!(KlineRecord::from_csv("1,2,3", 2).is_err());
        assert!(KlineRecord::from_csv("a,b,c,d,e,f,g,h,i,j,k", 3).is_err());
    }
}
