//! Shared fixtures for the CLI integration tests

#![allow(dead_code)]

use kforward_cli::daemon::Daemon;
use kforward_cli::store::ConfigStore;
use kforward_core::{ForwardProcess, Launcher, Supervisor, TunnelDefinition, TunnelError};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

struct FakeProcess {
    pid: u32,
    kills: Arc<AtomicUsize>,
}

impl ForwardProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn kill(&mut self) -> io::Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Launcher that never spawns anything and records what it was asked to do
#[derive(Default)]
pub struct FakeLauncher {
    launches: AtomicUsize,
    kills: Arc<AtomicUsize>,
    ports: Mutex<Vec<u16>>,
    failing_ports: Mutex<HashSet<u16>>,
}

impl FakeLauncher {
    pub fn fail_port(&self, port: u16) {
        self.failing_ports.lock().unwrap().insert(port);
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    /// Local ports of every launch, in order
    pub fn ports(&self) -> Vec<u16> {
        self.ports.lock().unwrap().clone()
    }
}

impl Launcher for FakeLauncher {
    fn launch(
        &self,
        definition: &TunnelDefinition,
    ) -> Result<Box<dyn ForwardProcess>, TunnelError> {
        if self.failing_ports.lock().unwrap().contains(&definition.port_local) {
            return Err(TunnelError::PortInUse {
                port: definition.port_local,
            });
        }

        let n = self.launches.fetch_add(1, Ordering::SeqCst);
        self.ports.lock().unwrap().push(definition.port_local);
        Ok(Box::new(FakeProcess {
            pid: 2000 + n as u32,
            kills: Arc::clone(&self.kills),
        }))
    }
}

pub const BASE_CONFIG: &str = r#"
port_forwards:
  - id: api
    context: dev
    namespace: apps
    service: api
    port_remote: 80
    port_local: 18080
  - id: db
    context: dev
    namespace: data
    service: postgres
    port_remote: 5432
    port_local: 15432
  - id: web
    namespace: apps
    service: web
    port_remote: 3000
    port_local: 13000
projects:
  - name: backend
    forwards: [api, db]
"#;

pub fn write_config(path: &Path, content: &str) {
    std::fs::write(path, content).unwrap();
}

/// A daemon over a temporary config file and a fake launcher
pub struct TestDaemon {
    pub dir: TempDir,
    pub config_path: PathBuf,
    pub launcher: Arc<FakeLauncher>,
    pub daemon: Daemon,
}

pub fn test_daemon(content: &str) -> TestDaemon {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("config.yaml");
    write_config(&config_path, content);

    let store = ConfigStore::open(&config_path).unwrap();
    let launcher = Arc::new(FakeLauncher::default());
    let supervisor = Arc::new(Supervisor::new(launcher.clone()));

    TestDaemon {
        dir,
        config_path,
        launcher,
        daemon: Daemon::new(store, supervisor),
    }
}
