//! Shared fixtures for broker integration tests.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use claw_notify::{BrokerConfig, PluginConfig, ProfileBinding, RunAs};
use claw_notify_proto::{Alert, ProfileAlert};
use nix::unistd::{geteuid, Group, User};
use tempfile::TempDir;

pub const TICK: Duration = Duration::from_millis(50);
pub const PLUGIN_NAME: &str = "file_default";

const HELLO: &str = r#"printf '{"type":"hello","protocol_version":1,"cookie":"%s","capabilities":["notify"]}\n' "$CLAW_NOTIFY_PLUGIN_COOKIE""#;

/// `notification-crash`: acks configure, then exits on the first notify.
const CRASH_PLUGIN: &str = r#"
read -r line
echo '{"type":"ack","id":1}'
read -r line
exit 3
"#;

/// `notification-slow`: takes a second over every notify.
const SLOW_PLUGIN: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"type":"shutdown"'*) exit 0 ;;
    *'"type":"notify"'*) sleep 1 ;;
  esac
  id=$(printf '%s' "$line" | sed -n 's/^{"type":"[a-z]*","id":\([0-9]*\).*/\1/p')
  printf '{"type":"ack","id":%s}\n' "$id"
done
"#;

/// The identity plugins run as in tests.
///
/// A root broker refuses to let plugins inherit its identity, so tests
/// running as root use `nobody` and its primary group.
pub fn test_run_as() -> RunAs {
    if !geteuid().is_root() {
        return RunAs::default();
    }
    let user = User::from_name("nobody")
        .expect("lookup nobody")
        .expect("nobody user exists");
    let group = Group::from_gid(user.gid)
        .expect("lookup nobody's group")
        .expect("nobody's group exists");
    RunAs::new(user.name, group.name)
}

/// Directories plugins must reach when they run as `nobody`.
fn open_up(dir: &Path, mode: u32) {
    if geteuid().is_root() {
        fs::set_permissions(dir, fs::Permissions::from_mode(mode)).expect("chmod dir");
    }
}

fn install_script(dir: &Path, plugin_type: &str, body: &str) {
    let path = dir.join(format!("notification-{plugin_type}"));
    fs::write(&path, format!("#!/bin/sh\n{HELLO}\n{body}")).expect("write plugin script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod plugin script");
}

/// Installs `notification-file` under `dir` with the given mode.
pub fn install_plugin(dir: &Path, mode: u32) -> PathBuf {
    fs::create_dir_all(dir).expect("create plugin dir");
    let path = dir.join("notification-file");
    fs::copy(env!("CARGO_BIN_EXE_notification-file"), &path).expect("copy plugin binary");
    fs::set_permissions(&path, fs::Permissions::from_mode(mode)).expect("chmod plugin binary");
    path
}

/// A plugin directory shared by every test in the binary.
///
/// Installed once so no test writes a binary while another is spawning it.
/// Holds `notification-file` plus the `crash` and `slow` script plugins.
pub fn shared_plugin_dir() -> &'static Path {
    static DIR: OnceLock<TempDir> = OnceLock::new();
    DIR.get_or_init(|| {
        let dir = TempDir::new().expect("tempdir");
        install_plugin(dir.path(), 0o755);
        install_script(dir.path(), "crash", CRASH_PLUGIN);
        install_script(dir.path(), "slow", SLOW_PLUGIN);
        open_up(dir.path(), 0o755);
        dir
    })
    .path()
}

/// One broker's worth of fixtures: the plugin's output file lives in a
/// private directory.
pub struct Harness {
    dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        open_up(dir.path(), 0o777);
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn output(&self) -> PathBuf {
        self.dir.path().join("alerts.json")
    }

    pub fn plugin(&self) -> PluginConfig {
        PluginConfig::new(PLUGIN_NAME, "file")
            .with_param("output_file", self.output().to_string_lossy().into_owned())
    }

    /// A config binding profile 1 to `plugin` in the shared plugin dir.
    pub fn config(&self, plugin: PluginConfig) -> BrokerConfig {
        let binding = ProfileBinding::new(1, "default").with_notification(plugin.name.clone());
        BrokerConfig::new(shared_plugin_dir())
            .with_tick_interval(TICK)
            .with_run_as(test_run_as())
            .with_plugin(plugin)
            .with_profile(binding)
    }

    /// Batches written so far, ignoring a line still being written.
    pub fn batches(&self) -> Vec<Vec<Alert>> {
        let Ok(content) = fs::read_to_string(self.output()) else {
            return Vec::new();
        };
        let complete = match content.rfind('\n') {
            Some(end) => &content[..=end],
            None => return Vec::new(),
        };
        serde_json::Deserializer::from_str(complete)
            .into_iter::<Vec<Alert>>()
            .collect::<Result<_, _>>()
            .expect("plugin output is a stream of JSON arrays")
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches().iter().map(Vec::len).collect()
    }

    /// Polls until at least `count` batches were written or `timeout` passes.
    pub async fn wait_for_batches(&self, count: usize, timeout: Duration) -> Vec<usize> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let sizes = self.batch_sizes();
            if sizes.len() >= count || tokio::time::Instant::now() >= deadline {
                return sizes;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub fn alert(n: usize) -> ProfileAlert {
    ProfileAlert::new(1, Alert::new(format!("test/scenario-{n}")))
}
