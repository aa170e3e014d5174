//! Shared helpers for the end-to-end server tests.

#![allow(dead_code)]

use std::thread;
use std::time::{Duration, Instant};

use slm_daq::config::{ServerConfig, ServerRole};
use slm_daq::servers;
use slm_daq::ServerHandle;

/// Loopback config on an ephemeral port with small virtual devices.
pub fn config(role: ServerRole) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.url = Some("tcp://127.0.0.1:*".to_string());
    config.role = role;
    config.name = format!("{role:?}").to_lowercase();
    config.worker.poll_timeout_ms = 50;
    config.slm.width = 16;
    config.slm.height = 16;
    config.alg.computational_space = [32, 32];
    config.alg.n_iterations = 5;
    config
}

/// Launch a server from `config`.
pub fn launch(config: &ServerConfig) -> ServerHandle {
    servers::launch(config).expect("server should start")
}

/// Spin until `condition` holds, panicking after `timeout`.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let started = Instant::now();
    while !condition() {
        assert!(
            started.elapsed() < timeout,
            "condition not met within {timeout:?}"
        );
        thread::sleep(Duration::from_millis(5));
    }
}
