use super::*;
use std::collections::HashMap;

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |var| map.get(var).cloned()
}

// -------------------- Defaults --------------------

#[test]
fn defaults_are_valid() {
    let cfg = EngineConfig::default();
    assert_eq!(cfg.data_dir, PathBuf::from("./logkv_data"));
    assert_eq!(cfg.max_segment_size, 100 * 1024 * 1024);
    assert_eq!(cfg.max_key_len, 1024);
    assert_eq!(cfg.max_key_len, record::DEFAULT_MAX_KEY_LEN);
    assert_eq!(cfg.compaction_interval, Duration::from_secs(5));
    assert_eq!(cfg.compaction_threshold, 0.7);
    assert!(!cfg.sync_writes);
    cfg.validate().unwrap();
}

// -------------------- Builder --------------------

#[test]
fn builder_overrides_fields() {
    let cfg = EngineConfig::builder()
        .data_dir("/tmp/kv")
        .max_segment_size(4096)
        .max_key_len(64)
        .compaction_interval(Duration::from_millis(50))
        .compaction_threshold(0.5)
        .sync_writes(true)
        .build()
        .unwrap();

    assert_eq!(cfg.data_dir, PathBuf::from("/tmp/kv"));
    assert_eq!(cfg.max_segment_size, 4096);
    assert_eq!(cfg.max_key_len, 64);
    assert_eq!(cfg.compaction_interval, Duration::from_millis(50));
    assert_eq!(cfg.compaction_threshold, 0.5);
    assert!(cfg.sync_writes);
}

#[test]
fn builder_rejects_out_of_range_values() {
    let bad = [
        EngineConfig::builder().max_segment_size(0),
        EngineConfig::builder().max_segment_size(u64::from(u32::MAX) + 1),
        EngineConfig::builder().max_key_len(0),
        EngineConfig::builder().max_key_len(70_000),
        EngineConfig::builder().compaction_interval(Duration::ZERO),
        EngineConfig::builder().compaction_threshold(0.0),
        EngineConfig::builder().compaction_threshold(1.5),
        EngineConfig::builder().compaction_threshold(f64::NAN),
        EngineConfig::builder().data_dir(""),
    ];
    for b in bad {
        assert!(matches!(b.build(), Err(ConfigError::Invalid(_))));
    }
}

#[test]
fn threshold_of_one_is_allowed() {
    assert!(EngineConfig::builder().compaction_threshold(1.0).build().is_ok());
}

// -------------------- Environment --------------------

#[test]
fn empty_environment_gives_defaults() {
    let cfg = EngineConfig::from_lookup(lookup_from(&[])).unwrap();
    assert_eq!(cfg, EngineConfig::default());
}

#[test]
fn environment_overrides_defaults() {
    let cfg = EngineConfig::from_lookup(lookup_from(&[
        (ENV_DATA_DIR, "/var/lib/logkv"),
        (ENV_MAX_SEGMENT_BYTES, "1048576"),
        (ENV_MAX_KEY_LEN, " 256 "),
        (ENV_COMPACTION_INTERVAL_SECS, "30"),
        (ENV_COMPACTION_THRESHOLD, "0.25"),
        (ENV_SYNC_WRITES, "true"),
    ]))
    .unwrap();

    assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/logkv"));
    assert_eq!(cfg.max_segment_size, 1 << 20);
    assert_eq!(cfg.max_key_len, 256);
    assert_eq!(cfg.compaction_interval, Duration::from_secs(30));
    assert_eq!(cfg.compaction_threshold, 0.25);
    assert!(cfg.sync_writes);
}

#[test]
fn unparsable_variable_names_the_variable() {
    let err = EngineConfig::from_lookup(lookup_from(&[(ENV_MAX_KEY_LEN, "lots")])).unwrap_err();
    assert_eq!(
        err,
        ConfigError::Parse {
            var: ENV_MAX_KEY_LEN,
            value: "lots".into()
        }
    );
}

#[test]
fn parsed_but_invalid_variable_fails_validation() {
    let err = EngineConfig::from_lookup(lookup_from(&[(ENV_COMPACTION_THRESHOLD, "2")]))
        .unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
}
