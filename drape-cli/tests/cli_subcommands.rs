use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use image::{Rgb, RgbImage};

fn unique_temp_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir =
        std::env::temp_dir().join(format!("drape_cli_{label}_{}_{}", std::process::id(), nanos));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn write_png(path: &PathBuf, width: u32, height: u32, color: Rgb<u8>) {
    RgbImage::from_pixel(width, height, color)
        .save(path)
        .expect("write png");
}

fn assert_schema_version(value: &serde_json::Value) {
    assert_eq!(
        value.get("schema_version").and_then(|v| v.as_u64()),
        Some(1),
        "missing schema_version=1 field"
    );
}

#[test]
fn help_lists_subcommands() {
    let output = Command::new(env!("CARGO_BIN_EXE_drape"))
        .arg("help")
        .output()
        .expect("run drape help");

    assert!(
        output.status.success(),
        "drape help failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    for subcommand in ["tryon", "backends", "devices"] {
        assert!(stdout.contains(subcommand), "help missing '{subcommand}'");
    }
}

#[test]
fn devices_json_reports_inventory() {
    let output = Command::new(env!("CARGO_BIN_EXE_drape"))
        .args(["devices", "--json"])
        .output()
        .expect("run drape devices");

    assert!(output.status.success());
    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("devices --json emits JSON");
    assert_schema_version(&value);
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(true));
    assert!(value.get("cuda").is_some());
    assert!(value.get("pinned_default").is_some());
}

#[test]
fn backends_json_lists_cascade_unloaded() {
    let output = Command::new(env!("CARGO_BIN_EXE_drape"))
        .args(["backends", "--json"])
        .output()
        .expect("run drape backends");

    assert!(output.status.success());
    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("backends --json emits JSON");
    assert_schema_version(&value);

    let backends = value
        .get("backends")
        .and_then(|v| v.as_array())
        .expect("backends array");
    let names: Vec<&str> = backends
        .iter()
        .filter_map(|b| b.get("name").and_then(|n| n.as_str()))
        .collect();
    assert_eq!(names, vec!["garment-fusion", "latent-inpaint", "overlay"]);
    assert!(
        backends
            .iter()
            .all(|b| b.get("load_state").and_then(|s| s.as_str()) == Some("unloaded"))
    );
}

#[test]
fn tryon_without_weights_lands_on_overlay_tier() {
    let dir = unique_temp_dir("tryon");
    let person = dir.join("person.png");
    let garment = dir.join("garment.png");
    let out = dir.join("out.png");
    let mask_out = dir.join("mask.png");
    write_png(&person, 120, 180, Rgb([40, 60, 80]));
    write_png(&garment, 64, 64, Rgb([210, 16, 16]));

    let output = Command::new(env!("CARGO_BIN_EXE_drape"))
        .args([
            "tryon",
            "--person",
            person.to_str().expect("utf8 path"),
            "--garment",
            garment.to_str().expect("utf8 path"),
            "--output",
            out.to_str().expect("utf8 path"),
            "--mask-out",
            mask_out.to_str().expect("utf8 path"),
            "--json",
        ])
        .output()
        .expect("run drape tryon");

    assert!(
        output.status.success(),
        "drape tryon failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("tryon --json emits JSON");
    assert_schema_version(&value);
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(true));
    // Generative tiers cannot load without weights; the cascade degrades
    // to the compositing fallback.
    assert_eq!(
        value.get("backend").and_then(|v| v.as_str()),
        Some("overlay")
    );
    let degraded: Vec<&str> = value
        .get("degraded_stages")
        .and_then(|v| v.as_array())
        .expect("degraded_stages array")
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert!(degraded.contains(&"pose-estimation"));
    assert!(degraded.contains(&"body-parsing"));

    // Output preserves the person image's exact dimensions.
    let result = image::open(&out).expect("open output").to_rgb8();
    assert_eq!(result.dimensions(), (120, 180));
    assert!(mask_out.exists(), "diagnostic mask written");

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn tryon_rejects_missing_person_image() {
    let dir = unique_temp_dir("missing");
    let garment = dir.join("garment.png");
    write_png(&garment, 32, 32, Rgb([1, 1, 1]));

    let output = Command::new(env!("CARGO_BIN_EXE_drape"))
        .args([
            "tryon",
            "--person",
            dir.join("nope.png").to_str().expect("utf8 path"),
            "--garment",
            garment.to_str().expect("utf8 path"),
            "--output",
            dir.join("out.png").to_str().expect("utf8 path"),
        ])
        .output()
        .expect("run drape tryon");

    assert!(!output.status.success(), "missing input must fail");
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn tryon_rejects_unknown_region() {
    let dir = unique_temp_dir("region");
    let person = dir.join("person.png");
    let garment = dir.join("garment.png");
    write_png(&person, 32, 48, Rgb([9, 9, 9]));
    write_png(&garment, 16, 16, Rgb([1, 1, 1]));

    let output = Command::new(env!("CARGO_BIN_EXE_drape"))
        .args([
            "tryon",
            "--person",
            person.to_str().expect("utf8 path"),
            "--garment",
            garment.to_str().expect("utf8 path"),
            "--output",
            dir.join("out.png").to_str().expect("utf8 path"),
            "--region",
            "sleeves",
        ])
        .output()
        .expect("run drape tryon");

    assert!(!output.status.success(), "unknown region must fail");
    fs::remove_dir_all(&dir).ok();
}
