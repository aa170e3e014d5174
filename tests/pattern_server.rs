//! Pattern server driven through [`PatternClient`].

mod common;

use std::path::Path;
use std::time::{Duration, Instant};

use serde_json::Value;
use slm_daq::protocol::Frame;
use slm_daq::client::{PatternClient, RequestClient, Timeout};
use slm_daq::config::ServerRole;
use tempfile::TempDir;

#[test]
fn test_calculate_save_and_use_pattern() {
    let dir = TempDir::new().unwrap();
    let mut config = common::config(ServerRole::Pattern);
    config.pattern_path = dir.path().to_path_buf();
    let server = common::launch(&config);
    let mut client = PatternClient::connect(server.endpoint()).unwrap();

    assert_eq!(client.get_slm_shape(), (16, 16));
    assert_eq!(
        client.calculate(&[3.0, -5.0, 2.0, 0.0], &[1.0, 1.0], 0),
        "ok"
    );
    assert_eq!(
        client.get_current_phase_info(),
        "slm 16x16; base: calculation of 2 spots; additional: none"
    );

    let (config_path, pattern_path) = client.save_calculation("", "twospot");
    assert!(Path::new(&pattern_path).is_file());
    let record: Value =
        serde_json::from_str(&std::fs::read_to_string(&config_path).unwrap()).unwrap();
    assert_eq!(record["name"], "twospot");
    assert_eq!(record["n_iterations"], 5);
    assert_eq!(record["slm_shape"], serde_json::json!([16, 16]));

    assert_eq!(client.reset_pattern(), "ok");
    assert_eq!(client.use_pattern("twospot_pattern.bin"), "ok");
    assert_eq!(
        client.get_current_phase_info(),
        "slm 16x16; base: twospot_pattern.bin; additional: none"
    );
}

#[test]
fn test_corrections_and_projection() {
    let server = common::launch(&common::config(ServerRole::Pattern));
    let mut client = PatternClient::connect(server.endpoint()).unwrap();

    assert_eq!(client.add_fresnel_lens(250.0), "ok");
    assert_eq!(client.add_zernike_poly(&[(2, 2, 0.3), (3, 1, -0.1)]), "ok");
    assert_eq!(client.project(), "ok");
    assert_eq!(
        client.get_current_phase_info(),
        "slm 16x16; base: none; additional: fresnel_lens(250 mm) + zernike[(2, 2, 0.3), (3, 1, -0.1)]"
    );
    assert_eq!(client.reset_additional_phase(), "ok");
    assert_eq!(
        client.get_current_phase_info(),
        "slm 16x16; base: none; additional: none"
    );
}

#[test]
fn test_calculation_errors_are_reported() {
    let server = common::launch(&common::config(ServerRole::Pattern));
    let mut client = PatternClient::connect(server.endpoint()).unwrap();

    assert_eq!(
        client.calculate(&[1.0, 2.0, 3.0], &[], 1),
        "error: not integer number of targets"
    );
    // Outside the 32x32 far field.
    assert!(client.calculate(&[40.0, 0.0], &[], 1).starts_with("error: "));
    let (config_path, _) = client.save_calculation("", "nothing");
    assert_eq!(config_path, "error: no calculation to save");
    assert!(client.is_connected());
}

#[test]
fn test_camera_passthrough() {
    let server = common::launch(&common::config(ServerRole::Pattern));
    let mut client = PatternClient::connect(server.endpoint()).unwrap();

    assert_eq!(client.get_width(), 1024);
    assert_eq!(client.get_height(), 1024);
    assert_eq!(client.get_depth(), 8);
    assert_eq!(client.set_exposure(0.05), "ok");
    assert_eq!(client.get_exposure(), 0.05);
    assert_eq!(client.get_image().len(), 1024 * 1024);
}

#[test]
fn test_oversized_zernike_order_is_refused_promptly() {
    let server = common::launch(&common::config(ServerRole::Pattern));
    let mut raw = RequestClient::connect(server.endpoint()).unwrap();

    let started = Instant::now();
    let reply = raw.call_text(
        &[
            Frame::text("add_zernike_poly"),
            Frame::f64_array(&[1e10, 1.0, 1.0]),
        ],
        "",
        Timeout::Millis(5000),
    );
    assert!(reply.starts_with("error: "), "{reply}");
    assert!(reply.contains("exceeds the maximum"), "{reply}");
    assert!(started.elapsed() < Duration::from_secs(2));

    let mut client = PatternClient::connect(server.endpoint()).unwrap();
    assert_eq!(
        client.get_current_phase_info(),
        "slm 16x16; base: none; additional: none"
    );
}

#[test]
fn test_calculate_save_and_project_helpers() {
    let dir = TempDir::new().unwrap();
    let mut config = common::config(ServerRole::Pattern);
    config.pattern_path = dir.path().to_path_buf();
    let server = common::launch(&config);
    let mut client = PatternClient::connect(server.endpoint()).unwrap();

    let (config_path, pattern_path) = client
        .calculate_save_and_project(&[3.0, -5.0, 2.0, 0.0], &[1.0, 1.0], 0, "", "helper")
        .unwrap();
    assert!(config_path.ends_with("helper_config.json"));
    assert!(Path::new(&pattern_path).is_file());
    assert!(client
        .get_current_phase_info()
        .contains("helper_pattern.bin"));

    assert_eq!(client.reset_pattern(), "ok");
    client.load_and_project("helper_pattern.bin").unwrap();
    assert!(client.load_and_project("missing.bin").unwrap_err().starts_with("error: "));
    assert_eq!(
        client.calculate_save_and_project(&[1.0, 2.0, 3.0], &[], 1, "", "bad"),
        Err("error: not integer number of targets".to_string())
    );
}
