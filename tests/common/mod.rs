#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use step_runners::SshConfig;
use tempfile::TempDir;

pub fn create_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

pub fn write_runner_config(dir: &Path, content: &str) {
    fs::write(dir.join("runners.yaml"), content).expect("Failed to write runners.yaml");
}

pub fn write_file(dir: &Path, filename: &str, content: &str) {
    fs::write(dir.join(filename), content).expect("Failed to write file");
}

/// A reachable Docker daemon. Docker tests are skipped without one.
pub fn docker_available() -> bool {
    Command::new("docker")
        .args(["info", "--format", "{{.ServerVersion}}"])
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

pub const TEST_IMAGE: &str = "alpine:3.20";

pub const FAKE_CONTAINER_ID: &str = "fakecontainer0123";

/// A stand-in docker CLI, run as `sh <script>`. It logs every invocation,
/// prints [`FAKE_CONTAINER_ID`] for `run`, and fails `stop` while
/// [`FakeDocker::fail_stop`] is set.
pub struct FakeDocker {
    dir: TempDir,
}

impl FakeDocker {
    pub fn new() -> Self {
        let dir = create_test_dir();
        let root = dir.path().display().to_string();
        let script = format!(
            r#"echo "$*" >> "{root}/calls.log"
case "$1" in
  run) echo {id} ;;
  stop)
    if [ -f "{root}/stop-fails" ]; then
      echo "Error response from daemon: cannot stop container" >&2
      exit 1
    fi
    ;;
esac
"#,
            root = root,
            id = FAKE_CONTAINER_ID,
        );
        write_file(dir.path(), "docker.sh", &script);
        Self { dir }
    }

    pub fn script(&self) -> PathBuf {
        self.dir.path().join("docker.sh")
    }

    /// Arguments of every invocation so far, one line per call.
    pub fn calls(&self) -> Vec<String> {
        fs::read_to_string(self.dir.path().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn count(&self, subcommand: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.split_whitespace().next() == Some(subcommand))
            .count()
    }

    pub fn fail_stop(&self, fail: bool) {
        let marker = self.dir.path().join("stop-fails");
        if fail {
            fs::write(marker, "").expect("Failed to write marker");
        } else {
            let _ = fs::remove_file(marker);
        }
    }
}

/// SSH target from `STEP_RUNNERS_SSH_HOST`, `_USER`, `_PORT`, `_KEY` and
/// `_PASSWORD`. SSH tests are skipped when the host is unset.
pub fn ssh_config_from_env() -> Option<SshConfig> {
    let host = std::env::var("STEP_RUNNERS_SSH_HOST").ok()?;
    let user = std::env::var("STEP_RUNNERS_SSH_USER").unwrap_or_else(|_| "root".to_string());
    let mut config = SshConfig::new(host, user);
    config.port = std::env::var("STEP_RUNNERS_SSH_PORT")
        .ok()
        .and_then(|p| p.parse().ok());
    config.key_file = std::env::var("STEP_RUNNERS_SSH_KEY").ok();
    config.password = std::env::var("STEP_RUNNERS_SSH_PASSWORD").ok();
    Some(config)
}

/// Whether `pid` is gone or a zombie awaiting its reaper.
#[cfg(target_os = "linux")]
pub fn process_gone(pid: u32) -> bool {
    match fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .map(|state| state == "Z" || state == "X")
            .unwrap_or(true),
    }
}
