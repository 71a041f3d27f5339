//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, tempfile::tempdir};

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("xbflash");
    cmd.env_remove("XBFLASH_PORT")
        .env_remove("XBFLASH_KIND")
        .env_remove("XBFLASH_NON_INTERACTIVE");
    cmd
}

/// Checksummed `.oem` image with one block pair.
fn oem_image() -> Vec<u8> {
    let mut img = vec![0x93, 0xFD, 0, 0, 0, 0, 0, 0, 0, 16, 0x18, 0x02];
    img.extend_from_slice(b"8075");
    img.extend_from_slice(&[0, 4]);
    img.extend_from_slice(b"DATA");
    img.extend_from_slice(&[0, 2]);
    img.extend_from_slice(b"OK");
    img.extend_from_slice(&[0, 0]);
    img.resize(32, 0);
    img[7] = 32;
    let sum = img
        .chunks_exact(2)
        .fold(0u16, |acc, w| acc.wrapping_add(u16::from_be_bytes([w[0], w[1]])));
    img[2..4].copy_from_slice(&0u16.wrapping_sub(sum).to_be_bytes());
    img
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("xbflash"))
        .stdout(predicate::str::contains("install"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("xbflash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn list_ports_json_returns_envelope() {
    let mut cmd = cli_cmd();
    let output = cmd
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let parsed: serde_json::Value = serde_json::from_str(&stdout).expect("stdout should be JSON");
    assert_eq!(parsed["ok"], true);
    assert!(parsed["data"]["ports"].is_array());
}

#[test]
fn info_reports_oem_header() {
    let dir = tempdir().expect("tempdir should be created");
    let fw = dir.path().join("xt09.oem");
    fs::write(&fw, oem_image()).expect("write image");

    let mut cmd = cli_cmd();
    let output = cmd
        .arg("info")
        .arg("--json")
        .arg(&fw)
        .output()
        .expect("command should execute");

    assert!(output.status.success());
    let parsed: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(parsed["data"]["format"], "oem");
    assert_eq!(parsed["data"]["version"], "8075");
    assert_eq!(parsed["data"]["valid"], true);
}

#[test]
fn info_flags_corrupt_image() {
    let dir = tempdir().expect("tempdir should be created");
    let fw = dir.path().join("xt09.oem");
    let mut image = oem_image();
    image[18] ^= 0xFF;
    fs::write(&fw, image).expect("write image");

    let mut cmd = cli_cmd();
    cmd.arg("info")
        .arg(&fw)
        .assert()
        .success()
        .stderr(predicate::str::contains("checksum"));
}

#[test]
fn info_json_error_keeps_stdout_clean() {
    let dir = tempdir().expect("tempdir should be created");
    let nonexistent = dir.path().join("not_exists.oem");

    let mut cmd = cli_cmd();
    cmd.arg("info")
        .arg("--json")
        .arg(nonexistent.as_os_str())
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn completions_bash_names_the_binary() {
    let mut cmd = cli_cmd();
    cmd.args(["completions", "bash"])
        .assert()
        .success()
        .code(0)
        .stdout(predicate::str::contains("_xbflash()"));
}

#[test]
fn exit_code_two_for_unknown_command() {
    let mut cmd = cli_cmd();
    cmd.arg("unknown-command-xyz")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_two_for_invalid_flag() {
    let mut cmd = cli_cmd();
    cmd.arg("--invalid-flag-xyz")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn install_without_firmware_is_usage_error() {
    let mut cmd = cli_cmd();
    cmd.arg("install")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("FIRMWARE"));
}

#[test]
fn install_unrecognised_image_is_usage_error() {
    let dir = tempdir().expect("tempdir should be created");
    let fw = dir.path().join("notes.txt");
    fs::write(&fw, b"not a firmware image").expect("write file");

    let mut cmd = cli_cmd();
    cmd.arg("-p")
        .arg("INVALID_PORT_NAME_XYZ")
        .arg("install")
        .arg(&fw)
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--kind"));
}

#[test]
fn install_on_missing_port_fails() {
    let dir = tempdir().expect("tempdir should be created");
    let fw = dir.path().join("xt09.oem");
    fs::write(&fw, oem_image()).expect("write image");

    let mut cmd = cli_cmd();
    cmd.arg("-p")
        .arg("INVALID_PORT_NAME_XYZ")
        .arg("install")
        .arg(&fw)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("INVALID_PORT_NAME_XYZ"));
}

#[test]
fn port_from_environment_is_used() {
    let dir = tempdir().expect("tempdir should be created");
    let fw = dir.path().join("xt09.oem");
    fs::write(&fw, oem_image()).expect("write image");

    let mut cmd = cli_cmd();
    cmd.env("XBFLASH_PORT", "ENV_PORT_NAME_XYZ")
        .arg("install")
        .arg(&fw)
        .assert()
        .failure()
        .stderr(predicate::str::contains("ENV_PORT_NAME_XYZ"));
}

#[test]
fn invalid_config_warns_and_continues() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("xbflash.toml"), "invalid toml [[[").expect("write invalid config");

    let mut cmd = cli_cmd();
    let output = cmd
        .current_dir(dir.path())
        .arg("list-ports")
        .output()
        .expect("command should execute");

    assert!(output.status.success(), "command should succeed despite config warning");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TOML"), "should warn about invalid TOML");
}

#[test]
fn config_file_supplies_port() {
    let dir = tempdir().expect("tempdir should be created");
    let fw = dir.path().join("xt09.oem");
    fs::write(&fw, oem_image()).expect("write image");
    let config = dir.path().join("custom.toml");
    fs::write(&config, "[connection]\nport = \"CONFIG_PORT_XYZ\"\n").expect("write config");

    let mut cmd = cli_cmd();
    cmd.arg("--config")
        .arg(&config)
        .arg("install")
        .arg(&fw)
        .assert()
        .failure()
        .stderr(predicate::str::contains("CONFIG_PORT_XYZ"));
}

#[test]
fn double_dash_terminates_options() {
    let dir = tempdir().expect("tempdir should be created");
    let fw = dir.path().join("--weird.oem");
    fs::write(&fw, oem_image()).expect("write image");

    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .args(["info", "--", "--weird.oem"])
        .assert()
        .success();
}
