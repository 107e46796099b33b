//! Observation spec DSL: binary sources and aligned channels.
//!
//! Two texts travel in a contract. The sources text binds each
//! `(instrument, interval)` pair to a binary file and record layout; the
//! channels text declares which pairs feed the observation tensor and how
//! long each channel's sequence window is.
//!
//! ```text
//! SOURCE BTCUSDT INTERVAL 1h RECORD kline FILE /data/btcusdt_1h.bin
//! CHANNEL BTCUSDT INTERVAL 1h SEQ_LENGTH 48 ACTIVE true
//! ```

use crate::error::{DslError, DslResult, Location};
use serde::Serialize;
use std::collections::BTreeSet;

/// Record layouts the binary files may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordLayout {
    Kline,
    Basic,
}

impl RecordLayout {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "kline" => Some(RecordLayout::Kline),
            "basic" => Some(RecordLayout::Basic),
            _ => None,
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            RecordLayout::Kline => "kline",
            RecordLayout::Basic => "basic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceDecl {
    pub instrument: String,
    pub interval: String,
    pub layout: RecordLayout,
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelDecl {
    pub instrument: String,
    pub interval: String,
    pub seq_length: usize,
    pub active: bool,
}

/// Decoded observation spec: sources plus channels, cross-validated.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservationSpec {
    pub sources: Vec<SourceDecl>,
    pub channels: Vec<ChannelDecl>,
}

impl ObservationSpec {
    /// Channels marked active, declaration order preserved.
    pub fn active_channels(&self) -> Vec<&ChannelDecl> {
        self.channels.iter().filter(|c| c.active).collect()
    }

    pub fn source_for(&self, instrument: &str, interval: &str) -> Option<&SourceDecl> {
        self.sources
            .iter()
            .find(|s| s.instrument == instrument && s.interval == interval)
    }

    /// Longest sequence window over active channels.
    pub fn max_seq_length(&self) -> usize {
        self.active_channels().iter().map(|c| c.seq_length).max().unwrap_or(0)
    }
}

fn parse_bool(text: &str, location: Location) -> DslResult<bool> {
    match text.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(DslError::parse(location, format!("expected true|false, got: {other}"))),
    }
}

fn clean_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines().enumerate().filter_map(|(i, raw)| {
        let line = raw.trim();
        if line.is_empty() || line.starts_with("//") || line.starts_with('#') {
            None
        } else {
            Some((i + 1, line))
        }
    })
}

pub fn decode_sources(text: &str) -> DslResult<Vec<SourceDecl>> {
    let mut out = Vec::new();
    let mut seen = BTreeSet::new();
    for (line_no, line) in clean_lines(text) {
        let location = Location::new(line_no, 1);
        let fields: Vec<&str> = line.split_ascii_whitespace().collect();
        match fields.as_slice() {
            ["SOURCE", instrument, "INTERVAL", interval, "RECORD", layout, "FILE", file] => {
                let layout = RecordLayout::parse(layout).ok_or_else(|| {
                    DslError::parse(location, format!("invalid RECORD layout: {layout}"))
                })?;
                if !seen.insert((instrument.to_string(), interval.to_string())) {
                    return Err(DslError::schema(format!(
                        "duplicate SOURCE declaration: {instrument} {interval}"
                    )));
                }
                out.push(SourceDecl {
                    instrument: instrument.to_string(),
                    interval: interval.to_string(),
                    layout,
                    file: file.to_string(),
                });
            }
            _ => {
                return Err(DslError::parse(
                    location,
                    format!("unrecognized observation source statement: {line}"),
                ))
            }
        }
    }
    if out.is_empty() {
        return Err(DslError::parse_nowhere("no observation sources decoded"));
    }
    Ok(out)
}

pub fn decode_channels(text: &str) -> DslResult<Vec<ChannelDecl>> {
    let mut out = Vec::new();
    let mut seen = BTreeSet::new();
    for (line_no, line) in clean_lines(text) {
        let location = Location::new(line_no, 1);
        let fields: Vec<&str> = line.split_ascii_whitespace().collect();
        match fields.as_slice() {
            ["CHANNEL", instrument, "INTERVAL", interval, "SEQ_LENGTH", len, "ACTIVE", active] => {
                let seq_length: usize = len.parse().map_err(|_| {
                    DslError::parse(location, format!("invalid SEQ_LENGTH value: {len}"))
                })?;
                if seq_length == 0 {
                    return Err(DslError::range("SEQ_LENGTH must be > 0".to_string()));
                }
                if !seen.insert((instrument.to_string(), interval.to_string())) {
                    return Err(DslError::schema(format!(
                        "duplicate CHANNEL declaration: {instrument} {interval}"
                    )));
                }
                out.push(ChannelDecl {
                    instrument: instrument.to_string(),
                    interval: interval.to_string(),
                    seq_length,
                    active: parse_bool(active, location)?,
                });
            }
            _ => {
                return Err(DslError::parse(
                    location,
                    format!("unrecognized observation channel statement: {line}"),
                ))
            }
        }
    }
    if out.is_empty() {
        return Err(DslError::parse_nowhere("no observation channels decoded"));
    }
    Ok(out)
}

/// Decode both texts and cross-validate channel → source references.
pub fn decode(sources_text: &str, channels_text: &str) -> DslResult<ObservationSpec> {
    let spec = ObservationSpec {
        sources: decode_sources(sources_text)?,
        channels: decode_channels(channels_text)?,
    };
    for channel in &spec.channels {
        if spec.source_for(&channel.instrument, &channel.interval).is_none() {
            return Err(DslError::schema(format!(
                "channel references undeclared source: {} {}",
                channel.instrument, channel.interval
            )));
        }
    }
    if spec.active_channels().is_empty() {
        return Err(DslError::schema("observation spec has no active channels"));
    }
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCES: &str = "\
        SOURCE BTCUSDT INTERVAL 1h RECORD kline FILE /data/btc_1h.bin\n\
        SOURCE BTCUSDT INTERVAL 4h RECORD basic FILE /data/btc_4h.bin\n";
    const CHANNELS: &str = "\
        CHANNEL BTCUSDT INTERVAL 1h SEQ_LENGTH 48 ACTIVE true\n\
        CHANNEL BTCUSDT INTERVAL 4h SEQ_LENGTH 12 ACTIVE true\n";

    #[test]
    fn decodes_and_cross_validates() {
        let spec = decode(SOURCES, CHANNELS).unwrap();
        assert_eq!(spec.sources.len(), 2);
        assert_eq!(spec.active_channels().len(), 2);
        assert_eq!(spec.max_seq_length(), 48);
        assert_eq!(spec.source_for("BTCUSDT", "4h").unwrap().layout, RecordLayout::Basic);
    }

    #[test]
    fn dangling_channel_rejected() {
        let channels = "CHANNEL ETHUSDT INTERVAL 1h SEQ_LENGTH 8 ACTIVE true\n";
        let err = decode(SOURCES, channels).unwrap_err();
        assert!(err.to_string().contains("undeclared source"), "{err}");
    }

    #[test]
    fn zero_seq_length_rejected() {
        let channels = "CHANNEL BTCUSDT INTERVAL 1h SEQ_LENGTH 0 ACTIVE true\n";
        assert!(decode(SOURCES, channels).is_err());
    }

    #[test]
    fn all_inactive_rejected() {
        let channels = "CHANNEL BTCUSDT INTERVAL 1h SEQ_LENGTH 8 ACTIVE false\n";
        assert!(decode(SOURCES, channels).is_err());
    }

    #[test]
    fn duplicate_declarations_rejected() {
        let dup = format!("{SOURCES}SOURCE BTCUSDT INTERVAL 1h RECORD kline FILE /x.bin\n");
        assert!(decode_sources(&dup).is_err());
    }
}
