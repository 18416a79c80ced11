//! Defaults, TOML files and the generated template.

use embedsearch::Settings;
use embedsearch::compute::Backend;

#[test]
fn test_partial_toml_keeps_other_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.toml");
    std::fs::write(
        &path,
        r#"
[compute]
enabled = false
preferred_backend = "none"

[clustering]
min_embeddings = 5000
fan_out = 5
seed = 42
"#,
    )
    .unwrap();

    let settings = Settings::load_from(&path).unwrap();
    assert!(!settings.compute.enabled);
    assert_eq!(settings.compute.preferred_backend, Backend::None);
    assert_eq!(settings.clustering.min_embeddings, 5000);
    assert_eq!(settings.clustering.fan_out, 5);
    assert_eq!(settings.clustering.seed, Some(42));
    assert_eq!(settings.index.dimensions, 1024);
    assert_eq!(settings.compute.matrix_threshold, 1000);
}

#[test]
fn test_generated_template_loads_as_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = Settings::init_config_file(dir.path(), false).unwrap();
    assert!(path.ends_with(".embedsearch/settings.toml"));

    let loaded = Settings::load_from(&path).unwrap();
    assert_eq!(loaded.clustering, Settings::default().clustering);
    assert_eq!(loaded.compute, Settings::default().compute);

    // A second init without force refuses to overwrite
    assert!(Settings::init_config_file(dir.path(), false).is_err());
    assert!(Settings::init_config_file(dir.path(), true).is_ok());
}
