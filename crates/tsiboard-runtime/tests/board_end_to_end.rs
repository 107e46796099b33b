//! Build a minimal contract and drive it through the executor: source →
//! vicreg → sinks over a known one-day window.

use candle_core::Device;
use tsiboard_data::packer::vec_to_binary;
use tsiboard_data::BasicRecord;
use tsiboard_dsl::{ContractRecord, WaveRecord};
use tsiboard_runtime::nodes::TsiSinkLogSys;
use tsiboard_runtime::{build_board, CancellationToken, Executor, RuntimeContext, StopReason};

const HOUR_MS: i64 = 3_600_000;
/// 2020-01-01T00:00:00Z
const DAY_START_MS: i64 = 1_577_836_800_000;

const CIRCUIT: &str = r#"
training = {
  dl   = tsi.source.dataloader
  enc  = tsi.wikimyei.representation.vicreg.prime
  sink = tsi.sink.log.sys
  drop = tsi.sink.null
  dl@payload:tensor -> enc@payload
  enc@payload:tensor -> drop@payload
  enc@loss:tensor -> sink@loss
  dl@meta:str -> sink@meta
}
training(wave@symbol:BTCUSDT@BTCUSDT[01.01.2020,01.01.2020]);
"#;

const JKSPEC: &str = r#"
JKSPEC 2.0
COMPONENT "tsi.wikimyei.representation.vicreg" "VICReg_representation" {
  PROFILE "base" {
    OPTIMIZER "AdamW" {
      initial_learning_rate: 0.005
      beta1: 0.9
      beta2: 0.999
      eps: 1e-8
      weight_decay: 0.0
    }
    LR_SCHEDULER "ConstantLR" { lr: 0 }
    LOSS "VicReg" { sim_coeff: 25.0 std_coeff: 25.0 cov_coeff: 1.0 }
    COMPONENT_PARAMS {
      encoding_dims: 12
      channel_expansion_dim: 6
      fused_feature_dim: 8
      encoder_hidden_dims: 8
      encoder_depth: 1
      projector_mlp_spec: "16-12"
      projector_norm: "None"
      projector_activation: "ReLU"
      projector_hidden_bias: true
      projector_last_bias: true
      projector_bn_in_fp32: false
      optimizer_threshold_reset: 0
      enable_buffer_averaging: false
      swa_start_iter: 2
    }
    REPRODUCIBILITY { seed: 42 workers: 1 deterministic: true }
    NUMERICS { dtype: "f32" device: "cpu" }
    GRADIENT { clip_norm: 5.0 accumulation_steps: 1 }
    CHECKPOINT { directory: "/tmp/tsiboard-ckpt" every_n_epochs: 1 keep_last: 1 }
    METRICS { log_every_n_batches: 1 enable_loss_breakdown: true }
    DATA_REF { dataset_key: "BTCUSDT" }
  }
  ACTIVE_PROFILE: "base"
}
"#;

const WAVES: &str = r#"
WAVE smoke {
  MODE train
  SAMPLER sequential
  EPOCHS 1
  BATCH_SIZE 4
  WIKIMYEI PATH tsi.wikimyei.representation.vicreg.prime TRAIN true PROFILE_ID base
  SOURCE PATH tsi.source.dataloader SYMBOL BTCUSDT FROM 01.01.2020 TO 01.01.2020
}
"#;

fn write_fixture(dir: &tempfile::TempDir) -> (String, String) {
    // two days of hourly closes so the one-day window has history behind it
    let hourly: Vec<BasicRecord> = (0..48)
        .map(|i| BasicRecord {
            time: DAY_START_MS - 24 * HOUR_MS + (i + 1) * HOUR_MS - 1,
            value: (i as f64 * 0.1).sin(),
        })
        .collect();
    let path = dir.path().join("btc_1h.bin");
    vec_to_binary(&hourly, &path).unwrap();

    let sources =
        format!("SOURCE BTCUSDT INTERVAL 1h RECORD basic FILE {}\n", path.display());
    let channels = "CHANNEL BTCUSDT INTERVAL 1h SEQ_LENGTH 8 ACTIVE true\n".to_string();
    (sources, channels)
}

#[test]
fn board_builds_and_executes_one_training_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let (sources, channels) = write_fixture(&dir);

    let ctx = RuntimeContext::new(Device::Cpu);
    let contract = ctx
        .contracts
        .register_contract(ContractRecord::new(CIRCUIT, sources.as_str(), channels.as_str(), JKSPEC))
        .unwrap();
    let wave_record = ctx.contracts.register_wave(WaveRecord::new(WAVES)).unwrap();

    let mut board = build_board(&ctx, &contract, &wave_record, "smoke").unwrap();
    assert_eq!(board.contracts.len(), 1);
    let contract_built = &board.contracts[0];
    assert_eq!(contract_built.spec.instrument, "BTCUSDT");
    assert_eq!(contract_built.spec.channels, 1);
    assert_eq!(contract_built.spec.timesteps, 8);
    assert_eq!(contract_built.spec.features, 1);
    assert!(contract_built
        .spec
        .representation_component_name
        .starts_with("VICReg_representation@training."));
    // every required DSL segment is snapshotted
    for key in
        ["circuit", "observation.sources", "observation.channels", "jkimyei.specs", "wave"]
    {
        assert!(contract_built.dsl_segments.contains_key(key), "missing segment {key}");
    }
    assert!(contract_built.seed_wave.has_time_span);

    let executor = Executor::default();
    let reports = executor.run_board(&mut board).unwrap();
    assert_eq!(reports.len(), 1);
    let report = reports[0];
    assert_eq!(report.stop_reason, StopReason::Completed);
    assert_eq!(report.epochs_completed, 1);
    // 24 hourly anchors at batch size 4
    assert_eq!(report.batches_processed, 6);

    // the log sink saw one finite loss per batch
    let contract_built = &board.contracts[0];
    let sink_index = contract_built.node_index_by_alias("sink").unwrap();
    let sink = contract_built.nodes[sink_index]
        .as_any()
        .downcast_ref::<TsiSinkLogSys>()
        .unwrap();
    assert_eq!(sink.seen_losses().len(), 6);
    for loss in sink.seen_losses() {
        assert!(loss.is_finite(), "loss {loss}");
    }
}

#[test]
fn board_rejects_wave_with_unknown_profile() {
    let dir = tempfile::tempdir().unwrap();
    let (sources, channels) = write_fixture(&dir);

    let ctx = RuntimeContext::new(Device::Cpu);
    let contract = ctx
        .contracts
        .register_contract(ContractRecord::new(CIRCUIT, sources.as_str(), channels.as_str(), JKSPEC))
        .unwrap();
    let bad_waves = WAVES.replace("PROFILE_ID base", "PROFILE_ID ghost");
    let wave_record = ctx.contracts.register_wave(WaveRecord::new(bad_waves)).unwrap();

    let err = build_board(&ctx, &contract, &wave_record, "smoke").unwrap_err();
    assert!(err.to_string().contains("PROFILE_ID"), "{err}");
}

#[test]
fn board_rejects_mismatched_wave_paths() {
    let dir = tempfile::tempdir().unwrap();
    let (sources, channels) = write_fixture(&dir);

    let ctx = RuntimeContext::new(Device::Cpu);
    let contract = ctx
        .contracts
        .register_contract(ContractRecord::new(CIRCUIT, sources.as_str(), channels.as_str(), JKSPEC))
        .unwrap();
    let bad_waves = WAVES.replace("vicreg.prime", "vicreg.other");
    let wave_record = ctx.contracts.register_wave(WaveRecord::new(bad_waves)).unwrap();

    assert!(build_board(&ctx, &contract, &wave_record, "smoke").is_err());
}

#[test]
fn cancellation_stops_between_steps() {
    let dir = tempfile::tempdir().unwrap();
    let (sources, channels) = write_fixture(&dir);

    let ctx = RuntimeContext::new(Device::Cpu);
    let contract = ctx
        .contracts
        .register_contract(ContractRecord::new(CIRCUIT, sources.as_str(), channels.as_str(), JKSPEC))
        .unwrap();
    let wave_record = ctx.contracts.register_wave(WaveRecord::new(WAVES)).unwrap();
    let mut board = build_board(&ctx, &contract, &wave_record, "smoke").unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let executor = Executor::new(1_000_000, token);
    let reports = executor.run_board(&mut board).unwrap();
    assert_eq!(reports[0].stop_reason, StopReason::Cancelled);
    assert_eq!(reports[0].events_processed, 0);

    // a tiny budget stops early but reports faithfully
    let executor = Executor::new(3, CancellationToken::new());
    let mut board = build_board(&ctx, &contract, &wave_record, "smoke").unwrap();
    let reports = executor.run_board(&mut board).unwrap();
    assert_eq!(reports[0].stop_reason, StopReason::BudgetExhausted);
    assert!(reports[0].events_processed <= 3);

    // identity pair is carried on the board
    assert_eq!(board.contract_hash, contract.hash);
    assert_eq!(board.wave_hash, wave_record.hash);
}
