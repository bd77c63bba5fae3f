//! Process-level tests for the `nvmc` binary's argument validation paths.
//! Drives the compiled binary with `assert_cmd` rather than calling the
//! validation functions directly, so these exercise the actual exit-code
//! contract a user sees at the command line.

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn nvmc() -> Command {
    Command::cargo_bin("nvmc").unwrap()
}

#[test]
fn provision_then_extract_round_trip_through_hex_file() {
    let dir = tempdir().unwrap();
    let out_path = dir.path().join("provisioned.hex");

    nvmc()
        .args([
            "provision",
            "-u",
            "12345678-1234-1234-1234-123456789abc",
            "-m",
            "aGVsbG8gd29ybGQ=", // base64("hello world")
            "-e",
            "NRF52840",
            "-o",
        ])
        .arg(&out_path)
        .assert()
        .success();

    assert!(out_path.exists());

    nvmc()
        .args(["extract", "-e", "NRF52840", "-i"])
        .arg(&out_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("12345678-1234-1234-1234-123456789abc"))
        .stdout(predicate::str::contains("aGVsbG8gd29ybGQ="));
}

#[test]
fn provision_rejects_malformed_uuid() {
    let dir = tempdir().unwrap();
    let out_path = dir.path().join("out.hex");

    nvmc()
        .args(["provision", "-u", "not-a-uuid", "-m", "aGVsbG8=", "-e", "NRF52840", "-o"])
        .arg(&out_path)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("malformed formatting"));

    assert!(!out_path.exists());
}

#[test]
fn provision_rejects_oversized_token() {
    let dir = tempdir().unwrap();
    let out_path = dir.path().join("out.hex");
    let oversized = "A".repeat(1400);

    nvmc()
        .args([
            "provision",
            "-u",
            "12345678-1234-1234-1234-123456789abc",
            "-m",
        ])
        .arg(oversized)
        .args(["-e", "NRF52840", "-o"])
        .arg(&out_path)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("exceeded maximum length"));
}

#[test]
fn provision_rejects_unknown_device() {
    let dir = tempdir().unwrap();
    let out_path = dir.path().join("out.hex");

    nvmc()
        .args([
            "provision",
            "-u",
            "12345678-1234-1234-1234-123456789abc",
            "-m",
            "aGVsbG8=",
            "-e",
            "NRF00000",
            "-o",
        ])
        .arg(&out_path)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("unknown device"));
}

#[test]
fn provision_rejects_misaligned_settings_base_override() {
    let dir = tempdir().unwrap();
    let out_path = dir.path().join("out.hex");

    nvmc()
        .args([
            "provision",
            "-u",
            "12345678-1234-1234-1234-123456789abc",
            "-m",
            "aGVsbG8=",
            "-e",
            "NRF52840",
            "-f",
            "0xfe001",
            "-o",
        ])
        .arg(&out_path)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("page aligned"));
}

#[test]
fn extract_rejects_settings_size_without_base() {
    let dir = tempdir().unwrap();
    let input_path = dir.path().join("dump.bin");
    fs::write(&input_path, vec![0xffu8; 0x2000]).unwrap();

    nvmc()
        .args(["extract", "-e", "NRF52840", "-s", "0x2000", "-i"])
        .arg(&input_path)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("requires -f/--settings-base"));
}

#[test]
fn extract_rejects_unsupported_file_extension() {
    let dir = tempdir().unwrap();
    let input_path = dir.path().join("dump.txt");
    fs::write(&input_path, vec![0xffu8; 0x2000]).unwrap();

    nvmc()
        .args(["extract", "-e", "NRF52840", "-i"])
        .arg(&input_path)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Not supported file type"));
}

#[test]
fn extract_on_all_erased_dump_reports_no_records() {
    let dir = tempdir().unwrap();
    let input_path = dir.path().join("dump.bin");
    fs::write(&input_path, vec![0xffu8; 0x2000]).unwrap();

    nvmc()
        .args(["extract", "-e", "NRF52840", "-i"])
        .arg(&input_path)
        .assert()
        .failure()
        .code(1);
}

#[test]
fn zms_device_provision_then_extract_round_trip() {
    let dir = tempdir().unwrap();
    let out_path = dir.path().join("provisioned.hex");

    nvmc()
        .args([
            "provision",
            "-u",
            "abcdef12-3456-789a-bcde-f123456789ab",
            "-m",
            "AQIDBA==", // base64([1, 2, 3, 4])
            "-s",
            "30313233343536373839414243444546",
            "-e",
            "NRF54L15",
            "-o",
        ])
        .arg(&out_path)
        .assert()
        .success();

    nvmc()
        .args(["extract", "-e", "NRF54L15", "-i"])
        .arg(&out_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("abcdef12-3456-789a-bcde-f123456789ab"))
        .stdout(predicate::str::contains("Serial Number: 30313233343536373839414243444546"));
}
