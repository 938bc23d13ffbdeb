use assert_cmd::prelude::*;
use std::process::Command;

#[test]
fn help_exits_zero() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("uniflash")?;
    cmd.arg("--help");
    cmd.assert().success();

    // legacy spelling
    let mut cmd = Command::cargo_bin("uniflash")?;
    cmd.arg("-help");
    cmd.assert().success();

    Ok(())
}

#[test]
fn unknown_chip_exits_one() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("uniflash")?;
    cmd.args(["fread", "--chip", "BK9999", "--port", "COM99"]);
    cmd.assert().failure().code(1);

    Ok(())
}

#[test]
fn missing_file_exits_one() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("uniflash")?;
    cmd.args([
        "fwrite",
        "definitely-not-here.bin",
        "--chip",
        "ESP32",
        "--port",
        "COM99",
    ]);
    cmd.assert().failure().code(1);

    Ok(())
}

#[test]
fn invalid_arguments_exit_one() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("uniflash")?;
    cmd.arg("frobnicate");
    cmd.assert().failure().code(1);

    Ok(())
}
