//! Wave DSL decoder and the circuit invoke payload grammar.
//!
//! A wave file holds one or more execution envelopes:
//!
//! ```text
//! WAVE warmup_2020 {
//!   MODE train
//!   SAMPLER sequential
//!   EPOCHS 3
//!   BATCH_SIZE 16
//!   MAX_BATCHES_PER_EPOCH 0
//!   WIKIMYEI PATH tsi.wikimyei.representation.vicreg.lumen_the_pilot TRAIN true PROFILE_ID fast
//!   SOURCE PATH tsi.source.dataloader SYMBOL BTCUSDT FROM 01.01.2020 TO 31.12.2020
//! }
//! ```
//!
//! The invoke payload grammar is
//! `wave@key:value(,key:value)*@<source_command>`; a payload without the
//! `wave@` prefix is the source command verbatim. Dates are `dd.mm.yyyy`
//! UTC (from = start of day, to = end of day); `from`/`to` and
//! `from_ms`/`to_ms` must come in pairs and the span is normalized to
//! `min..max`.

use crate::error::{DslError, DslResult, Location};
use chrono::NaiveDate;
use nom::{
    bytes::complete::take_while1,
    character::complete::space0,
    combinator::{all_consuming, map},
    sequence::tuple,
    IResult,
};
use serde::Serialize;
use std::collections::BTreeSet;

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WaveMode {
    Train,
    Run,
}

impl WaveMode {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "train" => Some(WaveMode::Train),
            "run" => Some(WaveMode::Run),
            _ => None,
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            WaveMode::Train => "train",
            WaveMode::Run => "run",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SamplerKind {
    Sequential,
    Random,
}

impl SamplerKind {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "sequential" => Some(SamplerKind::Sequential),
            "random" => Some(SamplerKind::Random),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaveWikimyeiDecl {
    pub path: String,
    pub train: bool,
    pub profile_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaveSourceDecl {
    pub path: String,
    pub symbol: String,
    /// dd.mm.yyyy as written
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WaveDecl {
    pub name: String,
    pub mode: WaveMode,
    pub sampler: SamplerKind,
    pub epochs: u64,
    pub batch_size: u64,
    pub max_batches_per_epoch: u64,
    pub wikimyeis: Vec<WaveWikimyeiDecl>,
    pub sources: Vec<WaveSourceDecl>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WaveSet {
    pub waves: Vec<WaveDecl>,
}

/// Parsed invoke payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WaveInvoke {
    pub source_command: String,
    pub source_symbol: String,
    pub episode: u64,
    pub batch: u64,
    pub wave_i: u64,
    pub total_epochs: u64,
    pub max_batches_per_epoch: u64,
    pub has_time_span: bool,
    pub span_begin_ms: i64,
    pub span_end_ms: i64,
}

/// `dd.mm.yyyy` → unix ms, UTC. Start of day or last ms of the day.
pub fn parse_ddmmyyyy_to_unix_ms(text: &str, end_of_day: bool) -> DslResult<i64> {
    let mut parts = text.split('.');
    let (d, m, y) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(d), Some(m), Some(y), None) => (d, m, y),
        _ => return Err(DslError::range(format!("invalid date (expected dd.mm.yyyy): {text}"))),
    };
    let day: u32 = d.parse().map_err(|_| DslError::range(format!("invalid day in date: {text}")))?;
    let month: u32 =
        m.parse().map_err(|_| DslError::range(format!("invalid month in date: {text}")))?;
    let year: i32 =
        y.parse().map_err(|_| DslError::range(format!("invalid year in date: {text}")))?;
    if year < 1970 {
        return Err(DslError::range(format!("date before 1970 not supported: {text}")));
    }
    let date = NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| DslError::range(format!("invalid calendar date: {text}")))?;
    let day_start_ms = date
        .and_hms_opt(0, 0, 0)
        .expect("midnight always exists")
        .and_utc()
        .timestamp_millis();
    Ok(day_start_ms + if end_of_day { MS_PER_DAY - 1 } else { 0 })
}

fn extract_symbol_from_command(command: &str) -> String {
    let command = command.trim();
    if command.is_empty() || command.starts_with("batches=") {
        return String::new();
    }
    match command.find('[') {
        Some(lb) => command[..lb].trim().to_string(),
        None => command.to_string(),
    }
}

/// Parse the invoke payload envelope.
pub fn parse_wave_invoke(payload: &str) -> DslResult<WaveInvoke> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Err(DslError::parse_nowhere("empty circuit invoke payload"));
    }

    let mut out = WaveInvoke::default();

    let Some(rest) = payload.strip_prefix("wave@") else {
        out.source_command = payload.to_string();
        out.source_symbol = extract_symbol_from_command(payload);
        return Ok(out);
    };

    let sep = rest.find('@').ok_or_else(|| {
        DslError::parse_nowhere(format!(
            "wave invoke envelope missing source command separator '@': {payload}"
        ))
    })?;
    let meta = rest[..sep].trim();
    let source_command = rest[sep + 1..].trim();
    if source_command.is_empty() {
        return Err(DslError::parse_nowhere("wave invoke envelope has empty source command"));
    }

    let mut has_wave_i = false;
    let mut has_from = false;
    let mut has_to = false;
    let mut span_from_ms = 0i64;
    let mut span_to_ms = 0i64;

    for item in meta.split(',') {
        let item = item.trim();
        if item.is_empty() {
            return Err(DslError::parse_nowhere("empty wave invoke metadata token"));
        }
        let colon = item.find(':').ok_or_else(|| {
            DslError::parse_nowhere(format!(
                "invalid wave invoke metadata token (expected key:value): {item}"
            ))
        })?;
        let key = item[..colon].trim().to_ascii_lowercase();
        let value = item[colon + 1..].trim();
        if key.is_empty() || value.is_empty() {
            return Err(DslError::parse_nowhere(format!(
                "invalid empty key/value in wave invoke metadata token: {item}"
            )));
        }

        let parse_u64 = |v: &str, what: &str| -> DslResult<u64> {
            v.parse::<u64>().map_err(|_| {
                DslError::range(format!("invalid {what} value in wave invoke metadata: {v}"))
            })
        };

        match key.as_str() {
            "symbol" => out.source_symbol = value.to_string(),
            "episode" => out.episode = parse_u64(value, "episode")?,
            "batch" => out.batch = parse_u64(value, "batch")?,
            "epochs" => out.total_epochs = parse_u64(value, "epochs")?,
            "max_batches" => out.max_batches_per_epoch = parse_u64(value, "max_batches")?,
            "i" => {
                out.wave_i = parse_u64(value, "i")?;
                has_wave_i = true;
            }
            "from" => {
                span_from_ms = parse_ddmmyyyy_to_unix_ms(value, false)?;
                has_from = true;
            }
            "to" => {
                span_to_ms = parse_ddmmyyyy_to_unix_ms(value, true)?;
                has_to = true;
            }
            "from_ms" => {
                let v: i64 = value.parse().map_err(|_| {
                    DslError::range(format!("invalid from_ms value in wave invoke metadata: {value}"))
                })?;
                if v < 0 {
                    return Err(DslError::range(format!(
                        "from_ms must be >= 0 in wave invoke metadata: {value}"
                    )));
                }
                span_from_ms = v;
                has_from = true;
            }
            "to_ms" => {
                let v: i64 = value.parse().map_err(|_| {
                    DslError::range(format!("invalid to_ms value in wave invoke metadata: {value}"))
                })?;
                if v < 0 {
                    return Err(DslError::range(format!(
                        "to_ms must be >= 0 in wave invoke metadata: {value}"
                    )));
                }
                span_to_ms = v;
                has_to = true;
            }
            other => {
                return Err(DslError::parse_nowhere(format!(
                    "unknown wave invoke metadata key: {other}"
                )))
            }
        }
    }

    if has_from != has_to {
        return Err(DslError::parse_nowhere(
            "wave invoke metadata requires both from/to (or from_ms/to_ms) when one is provided",
        ));
    }

    out.source_command = source_command.to_string();
    if out.source_symbol.is_empty() {
        out.source_symbol = extract_symbol_from_command(source_command);
    }
    if !has_wave_i {
        out.wave_i = out.batch;
    }
    if has_from && has_to {
        out.has_time_span = true;
        out.span_begin_ms = span_from_ms.min(span_to_ms);
        out.span_end_ms = span_from_ms.max(span_to_ms);
    }
    Ok(out)
}

/// Recompose an invoke payload from a wave's source entry.
pub fn compose_invoke_payload(source: &WaveSourceDecl, wave: &WaveDecl) -> String {
    let source_command = format!("{}[{},{}]", source.symbol, source.from, source.to);
    let mut payload = format!(
        "wave@symbol:{},epochs:{},episode:0,batch:0,i:0,from:{},to:{}",
        source.symbol, wave.epochs, source.from, source.to
    );
    if wave.max_batches_per_epoch > 0 {
        payload.push_str(&format!(",max_batches:{}", wave.max_batches_per_epoch));
    }
    payload.push('@');
    payload.push_str(&source_command);
    payload
}

// ---- wave file parsing ----------------------------------------------------

fn ident(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_ascii_whitespace() && c != '{' && c != '}')(input)
}

fn header(input: &str) -> IResult<&str, &str> {
    map(
        all_consuming(tuple((
            space0,
            nom::bytes::complete::tag("WAVE"),
            space0,
            ident,
            space0,
            nom::character::complete::char('{'),
            space0,
        ))),
        |(_, _, _, name, _, _, _)| name,
    )(input)
}

fn split_fields(line: &str) -> Vec<&str> {
    line.split_ascii_whitespace().collect()
}

struct WaveBuilder {
    name: String,
    mode: Option<WaveMode>,
    sampler: Option<SamplerKind>,
    epochs: Option<u64>,
    batch_size: Option<u64>,
    max_batches_per_epoch: u64,
    wikimyeis: Vec<WaveWikimyeiDecl>,
    sources: Vec<WaveSourceDecl>,
}

impl WaveBuilder {
    fn new(name: &str) -> Self {
        WaveBuilder {
            name: name.to_string(),
            mode: None,
            sampler: None,
            epochs: None,
            batch_size: None,
            max_batches_per_epoch: 0,
            wikimyeis: Vec::new(),
            sources: Vec::new(),
        }
    }

    fn finish(self, location: Location) -> DslResult<WaveDecl> {
        let missing = |what: &str| {
            DslError::parse(location, format!("WAVE '{}' missing {what}", self.name))
        };
        Ok(WaveDecl {
            mode: self.mode.ok_or_else(|| missing("MODE"))?,
            sampler: self.sampler.ok_or_else(|| missing("SAMPLER"))?,
            epochs: self.epochs.ok_or_else(|| missing("EPOCHS"))?,
            batch_size: self.batch_size.ok_or_else(|| missing("BATCH_SIZE"))?,
            max_batches_per_epoch: self.max_batches_per_epoch,
            name: self.name,
            wikimyeis: self.wikimyeis,
            sources: self.sources,
        })
    }
}

fn parse_u64_field(value: &str, what: &str, location: Location) -> DslResult<u64> {
    value
        .parse()
        .map_err(|_| DslError::parse(location, format!("invalid {what} value: {value}")))
}

/// Decode a wave file into a set of wave declarations.
pub fn decode(text: &str) -> DslResult<WaveSet> {
    let mut out = WaveSet::default();
    let mut current: Option<WaveBuilder> = None;
    let mut seen_names = BTreeSet::new();

    for (line_no, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with("//") || line.starts_with('#') {
            continue;
        }
        let location = Location::new(line_no + 1, 1);

        if let Some(builder) = current.as_mut() {
            if line == "}" {
                let wave = current.take().expect("current set").finish(location)?;
                if !seen_names.insert(wave.name.clone()) {
                    return Err(DslError::parse(
                        location,
                        format!("duplicate WAVE name '{}'", wave.name),
                    ));
                }
                out.waves.push(wave);
                continue;
            }

            let fields = split_fields(line);
            match fields.as_slice() {
                ["MODE", value] => {
                    builder.mode = Some(WaveMode::parse(value).ok_or_else(|| {
                        DslError::parse(location, format!("invalid MODE; expected run|train: {value}"))
                    })?);
                }
                ["SAMPLER", value] => {
                    builder.sampler = Some(SamplerKind::parse(value).ok_or_else(|| {
                        DslError::parse(
                            location,
                            format!("invalid SAMPLER; expected sequential|random: {value}"),
                        )
                    })?);
                }
                ["EPOCHS", value] => {
                    builder.epochs = Some(parse_u64_field(value, "EPOCHS", location)?)
                }
                ["BATCH_SIZE", value] => {
                    builder.batch_size = Some(parse_u64_field(value, "BATCH_SIZE", location)?)
                }
                ["MAX_BATCHES_PER_EPOCH", value] => {
                    builder.max_batches_per_epoch =
                        parse_u64_field(value, "MAX_BATCHES_PER_EPOCH", location)?
                }
                ["WIKIMYEI", "PATH", path, "TRAIN", train, "PROFILE_ID", profile] => {
                    let train = match train.to_ascii_lowercase().as_str() {
                        "true" => true,
                        "false" => false,
                        other => {
                            return Err(DslError::parse(
                                location,
                                format!("invalid TRAIN; expected true|false: {other}"),
                            ))
                        }
                    };
                    builder.wikimyeis.push(WaveWikimyeiDecl {
                        path: path.to_string(),
                        train,
                        profile_id: profile.to_string(),
                    });
                }
                ["SOURCE", "PATH", path, "SYMBOL", symbol, "FROM", from, "TO", to] => {
                    // dates validated here so a bad wave file fails at decode
                    parse_ddmmyyyy_to_unix_ms(from, false)?;
                    parse_ddmmyyyy_to_unix_ms(to, true)?;
                    builder.sources.push(WaveSourceDecl {
                        path: path.to_string(),
                        symbol: symbol.to_string(),
                        from: from.to_string(),
                        to: to.to_string(),
                    });
                }
                _ => {
                    return Err(DslError::parse(
                        location,
                        format!("unrecognized statement in WAVE block: {line}"),
                    ))
                }
            }
            continue;
        }

        if let Ok((_, name)) = header(line) {
            current = Some(WaveBuilder::new(name));
            continue;
        }

        return Err(DslError::parse(
            location,
            format!("unrecognized statement at wave file scope: {line}"),
        ));
    }

    if current.is_some() {
        return Err(DslError::parse_nowhere("unterminated WAVE block"));
    }
    if out.waves.is_empty() {
        return Err(DslError::parse_nowhere("no waves decoded"));
    }
    Ok(out)
}

/// Select a wave by name; ambiguity and absence are both errors.
pub fn select_wave<'a>(set: &'a WaveSet, wave_id: &str) -> DslResult<&'a WaveDecl> {
    let wave_id = wave_id.trim();
    if wave_id.is_empty() {
        return Err(DslError::compatibility("missing required wave id"));
    }
    let mut chosen = None;
    for wave in &set.waves {
        if wave.name == wave_id {
            if chosen.is_some() {
                return Err(DslError::compatibility(format!(
                    "ambiguous wave selection: wave id '{wave_id}' matches multiple WAVE blocks"
                )));
            }
            chosen = Some(wave);
        }
    }
    chosen.ok_or_else(|| {
        DslError::compatibility(format!("no WAVE matches requested wave id '{wave_id}'"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAVES: &str = r#"
        WAVE warmup {
          MODE train
          SAMPLER sequential
          EPOCHS 2
          BATCH_SIZE 8
          MAX_BATCHES_PER_EPOCH 16
          WIKIMYEI PATH tsi.wikimyei.representation.vicreg.tagged TRAIN true PROFILE_ID fast
          SOURCE PATH tsi.source.dataloader SYMBOL BTCUSDT FROM 01.01.2020 TO 31.12.2020
        }
        # a runtime wave
        WAVE inference {
          MODE run
          SAMPLER random
          EPOCHS 1
          BATCH_SIZE 4
          WIKIMYEI PATH tsi.wikimyei.representation.vicreg.tagged TRAIN false PROFILE_ID fast
          SOURCE PATH tsi.source.dataloader SYMBOL BTCUSDT FROM 01.06.2020 TO 02.06.2020
        }
    "#;

    #[test]
    fn decodes_wave_blocks() {
        let set = decode(WAVES).unwrap();
        assert_eq!(set.waves.len(), 2);
        let w = &set.waves[0];
        assert_eq!(w.name, "warmup");
        assert_eq!(w.mode, WaveMode::Train);
        assert_eq!(w.sampler, SamplerKind::Sequential);
        assert_eq!(w.epochs, 2);
        assert_eq!(w.max_batches_per_epoch, 16);
        assert_eq!(w.wikimyeis.len(), 1);
        assert!(w.wikimyeis[0].train);
        assert_eq!(w.sources[0].symbol, "BTCUSDT");
        assert_eq!(select_wave(&set, "inference").unwrap().mode, WaveMode::Run);
        assert!(select_wave(&set, "absent").is_err());
    }

    #[test]
    fn date_parsing_is_utc_day_bounds() {
        let start = parse_ddmmyyyy_to_unix_ms("01.01.2020", false).unwrap();
        assert_eq!(start, 1_577_836_800_000);
        let end = parse_ddmmyyyy_to_unix_ms("01.01.2020", true).unwrap();
        assert_eq!(end, start + MS_PER_DAY - 1);
        assert!(parse_ddmmyyyy_to_unix_ms("31.12.1969", false).is_err());
        assert!(parse_ddmmyyyy_to_unix_ms("30.02.2020", false).is_err());
        assert!(parse_ddmmyyyy_to_unix_ms("2020-01-01", false).is_err());
    }

    #[test]
    fn invoke_payload_full_envelope() {
        let invoke = parse_wave_invoke(
            "wave@symbol:BTCUSDT,episode:2,batch:5,from:02.01.2020,to:01.01.2020,max_batches:7@BTCUSDT[01.01.2020,02.01.2020]",
        )
        .unwrap();
        assert_eq!(invoke.source_symbol, "BTCUSDT");
        assert_eq!(invoke.episode, 2);
        assert_eq!(invoke.batch, 5);
        // i defaults to batch
        assert_eq!(invoke.wave_i, 5);
        assert_eq!(invoke.max_batches_per_epoch, 7);
        assert!(invoke.has_time_span);
        // span normalized: from written after to
        assert!(invoke.span_begin_ms < invoke.span_end_ms);
    }

    #[test]
    fn invoke_payload_plain_command() {
        let invoke = parse_wave_invoke("ETHUSDT[01.01.2021,02.01.2021]").unwrap();
        assert_eq!(invoke.source_command, "ETHUSDT[01.01.2021,02.01.2021]");
        assert_eq!(invoke.source_symbol, "ETHUSDT");
        assert!(!invoke.has_time_span);
    }

    #[test]
    fn invoke_payload_unbalanced_span_fails() {
        assert!(parse_wave_invoke("wave@from:01.01.2020@cmd").is_err());
        assert!(parse_wave_invoke("wave@to_ms:10@cmd").is_err());
        assert!(parse_wave_invoke("wave@from_ms:-1,to_ms:10@cmd").is_err());
        assert!(parse_wave_invoke("wave@unknown:1@cmd").is_err());
        assert!(parse_wave_invoke("wave@symbol:X").is_err());
    }

    #[test]
    fn composed_payload_round_trips() {
        let set = decode(WAVES).unwrap();
        let wave = &set.waves[0];
        let payload = compose_invoke_payload(&wave.sources[0], wave);
        let invoke = parse_wave_invoke(&payload).unwrap();
        assert_eq!(invoke.source_symbol, "BTCUSDT");
        assert_eq!(invoke.total_epochs, 2);
        assert_eq!(invoke.max_batches_per_epoch, 16);
        assert!(invoke.has_time_span);
        assert_eq!(invoke.source_command, "BTCUSDT[01.01.2020,31.12.2020]");
    }

    #[test]
    fn missing_required_field_fails() {
        let text = r#"
            WAVE broken {
              MODE train
              SAMPLER sequential
              EPOCHS 2
            }
        "#;
        let err = decode(text).unwrap_err();
        assert!(err.to_string().contains("BATCH_SIZE"), "{err}");
    }
}
