use std::io::Write;

use fab_sim::{ConfigError, SimConfig, Simulation};

#[test]
fn test_load_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[simulation]
ticks = 40
seed = 3

[maintenance]
repair_min = 2
repair_max = 2

[refill]
every = 0

[[machines]]
id = "m1"
capabilities = ["mixing", "baking"]
durations = {{ mixing = 1, baking = 2 }}

[[suppliers]]
id = "s1"
stock = {{ flour = 100, sugar = 100, butter = 100 }}
capacity = {{ flour = 20, sugar = 20, butter = 20 }}
"#
    )
    .unwrap();

    let config = SimConfig::load(file.path()).unwrap();
    assert_eq!(config.simulation.ticks, 40);
    assert_eq!(config.simulation.seed, Some(3));
    assert_eq!(config.machines.len(), 1);
    assert_eq!(config.machines[0].durations["baking"], 2);
    assert_eq!(config.suppliers[0].delivery_distance, 4);
    assert!(config.transports.is_empty());
    assert_eq!(config.maintenance.policy().min_ticks, 2);

    Simulation::build(config).unwrap();
}

#[test]
fn test_missing_file_is_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = SimConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
}

#[test]
fn test_malformed_file_is_parse_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[simulation\nticks = ").unwrap();
    let err = SimConfig::load(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
    assert!(err.to_string().contains(&file.path().display().to_string()));
}

#[test]
fn test_invalid_file_is_rejected_on_load() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[[machines]]\nid = \"maintenance\"\ncapabilities = [\"baking\"]").unwrap();
    let err = SimConfig::load(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
}

#[test]
fn test_explicit_path_wins_over_default() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[simulation]\nticks = 7").unwrap();
    let config = SimConfig::resolve(Some(file.path())).unwrap();
    assert_eq!(config.simulation.ticks, 7);
}
