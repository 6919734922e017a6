//! Configuration file resolution through PipelineConfig::load

use powdb_common::config::{ConfigOrigin, CONFIG_ENV_VAR};
use powdb_ingest::config::{Region, SourceConfig};
use powdb_ingest::PipelineConfig;
use serial_test::serial;
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

const AUCKLAND: &str = r#"
[logging]
level = "debug"

[merge]
tolerance_m = 60.0

[[sources]]
kind = "overpass"
id = "osm-akl"
region = { south = -37.1, west = 174.4, north = -36.6, east = 175.0 }
"#;

#[test]
#[serial]
fn command_line_path_is_loaded() {
    std::env::remove_var(CONFIG_ENV_VAR);
    let file = write_config(AUCKLAND);

    let (config, origin) = PipelineConfig::load(Some(file.path())).unwrap();

    assert_eq!(origin, ConfigOrigin::CommandLine(file.path().to_path_buf()));
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.merge.tolerance_m, 60.0);
    assert_eq!(config.sources.len(), 1);
    let SourceConfig::Overpass(osm) = &config.sources[0] else {
        panic!("expected overpass source");
    };
    assert!(matches!(osm.region, Region::BoundingBox { .. }));
}

#[test]
#[serial]
fn environment_variable_is_used_without_argument() {
    let file = write_config("[merge]\nname_threshold = 0.9\n");
    std::env::set_var(CONFIG_ENV_VAR, file.path());

    let (config, origin) = PipelineConfig::load(None).unwrap();
    std::env::remove_var(CONFIG_ENV_VAR);

    assert!(origin.is_explicit());
    assert_eq!(origin.path(), Some(file.path()));
    assert_eq!(config.merge.name_threshold, 0.9);
    assert_eq!(config.sources.len(), 2);
}

#[test]
#[serial]
fn command_line_wins_over_environment() {
    let env_file = write_config("[merge]\ntolerance_m = 10.0\n");
    let cli_file = write_config(AUCKLAND);
    std::env::set_var(CONFIG_ENV_VAR, env_file.path());

    let (config, origin) = PipelineConfig::load(Some(cli_file.path())).unwrap();
    std::env::remove_var(CONFIG_ENV_VAR);

    assert!(matches!(origin, ConfigOrigin::CommandLine(_)));
    assert_eq!(config.merge.tolerance_m, 60.0);
}

#[test]
#[serial]
fn missing_explicit_file_is_an_error() {
    std::env::remove_var(CONFIG_ENV_VAR);
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.toml");

    let err = PipelineConfig::load(Some(&missing)).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
}

#[test]
#[serial]
fn invalid_settings_fail_at_load() {
    std::env::remove_var(CONFIG_ENV_VAR);
    let file = write_config("[merge]\nname_threshold = 2.0\n");

    let err = PipelineConfig::load(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("name_threshold"));
}

#[test]
#[serial]
fn malformed_toml_is_an_error() {
    std::env::remove_var(CONFIG_ENV_VAR);
    let file = write_config("[merge\ntolerance_m = ");

    assert!(PipelineConfig::load(Some(file.path())).is_err());
}
