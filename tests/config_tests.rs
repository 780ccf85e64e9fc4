mod common;

use std::time::Duration;

use common::*;
use step_runners::{BackendType, LoadError, RunnerConfig};

#[test]
fn test_default_runner_config() {
    let config = RunnerConfig::default();
    assert_eq!(config.output_limit, 10 * 1024 * 1024);
    assert!(config.backends.is_empty());
    assert!(config.binary.is_none());
}

#[test]
fn test_load_minimal_config() {
    let dir = create_test_dir();
    write_runner_config(dir.path(), "output_limit: 2048");

    let config = RunnerConfig::load(dir.path().join("runners.yaml")).unwrap();
    assert_eq!(config.output_limit, 2048);
    assert_eq!(config.pool.idle_timeout, 300);
}

#[test]
fn test_load_full_config() {
    let dir = create_test_dir();
    write_runner_config(
        dir.path(),
        r#"
binary: ./target/release/helper
bin_dir: /opt/step/bin

pool:
  idle_timeout: 120
  cleanup_interval: 15
  dial_attempts: 4
  dial_backoff_ms: 250
  connect_timeout: 3

backends:
  build:
    type: docker
    docker:
      image: rust:1.80
      persistent: true
      env:
        CARGO_TERM_COLOR: always
      volumes:
        - /srv/cache:/cache
      network: host
      workdir: /src
  deploy:
    type: ssh
    ssh:
      host: deploy.internal
      user: ci
      key_file: ~/.ssh/id_ed25519
      workdir: /srv/app
"#,
    );

    let config = RunnerConfig::load(dir.path().join("runners.yaml")).unwrap();
    assert_eq!(config.bin_dir.as_deref(), Some(std::path::Path::new("/opt/step/bin")));

    let settings = config.pool.settings();
    assert_eq!(settings.idle_timeout, Duration::from_secs(120));
    assert_eq!(settings.cleanup_interval, Duration::from_secs(15));
    assert_eq!(settings.connect_timeout, Duration::from_secs(3));
    assert_eq!(settings.dial_retry.max_attempts, 4);
    assert_eq!(settings.dial_retry.initial_delay, Duration::from_millis(250));

    let build = config.backend("build").unwrap();
    assert_eq!(build.backend_type().unwrap(), BackendType::Docker);
    let docker = build.config.docker.as_ref().unwrap();
    assert_eq!(docker.image, "rust:1.80");
    assert!(docker.persistent);
    assert_eq!(docker.env.get("CARGO_TERM_COLOR").map(String::as_str), Some("always"));
    assert_eq!(docker.volumes, vec!["/srv/cache:/cache".to_string()]);
    assert_eq!(docker.network.as_deref(), Some("host"));

    let deploy = config.backend("deploy").unwrap();
    let ssh = deploy.config.ssh.as_ref().unwrap();
    assert_eq!(ssh.port(), 22);
    assert_eq!(ssh.key_file.as_deref(), Some("~/.ssh/id_ed25519"));
    assert!(ssh.password.is_none());
}

#[test]
fn test_unknown_backend_type_fails_on_use() {
    let dir = create_test_dir();
    write_runner_config(
        dir.path(),
        r#"
backends:
  odd:
    type: podman
"#,
    );
    let config = RunnerConfig::load(dir.path().join("runners.yaml")).unwrap();
    assert!(config.backend("odd").unwrap().backend_type().is_err());
    assert!(config.backend("missing").is_none());
}

#[test]
fn test_load_missing_file() {
    let dir = create_test_dir();
    let err = RunnerConfig::load(dir.path().join("nope.yaml")).unwrap_err();
    assert!(matches!(err, LoadError::Io(_)));
}

#[test]
fn test_load_invalid_yaml_names_file() {
    let dir = create_test_dir();
    write_runner_config(dir.path(), "backends: [not, a, map");

    let err = RunnerConfig::load(dir.path().join("runners.yaml")).unwrap_err();
    match err {
        LoadError::Yaml { file, .. } => assert!(file.ends_with("runners.yaml")),
        other => panic!("expected yaml error, got {:?}", other),
    }
}
