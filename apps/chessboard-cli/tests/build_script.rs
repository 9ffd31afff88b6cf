#![cfg(unix)]

use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn find_on_path(tool: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(tool))
        .find(|candidate| candidate.is_file())
}

/// Copy of the packaging script and manifest, plus a `bin` directory that
/// exposes only the given tools.
fn workspace(tools: &[&str]) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    for file in ["build.sh", "meta.json"] {
        fs::copy(repo_root().join(file), dir.path().join(file)).unwrap();
    }
    let bin = dir.path().join("bin");
    fs::create_dir(&bin).unwrap();
    for tool in tools {
        let real = find_on_path(tool).unwrap_or_else(|| panic!("{tool} is not on PATH"));
        symlink(real, bin.join(tool)).unwrap();
    }
    (dir, bin)
}

fn write_executable(path: &Path, body: &str) {
    fs::write(path, body).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

fn run_build(dir: &Path, bin: &Path) -> assert_cmd::assert::Assert {
    let bash = find_on_path("bash").unwrap();
    Command::new(bash)
        .arg(dir.join("build.sh"))
        .current_dir(dir)
        .env("PATH", bin)
        .assert()
}

#[test]
fn missing_cargo_is_reported() {
    let (dir, bin) = workspace(&["dirname"]);
    run_build(dir.path(), &bin)
        .code(1)
        .stderr(predicate::str::contains("cargo not found"));
    assert!(!dir.path().join("module.tar.gz").exists());
}

#[test]
fn failed_build_stops_packaging() {
    let (dir, bin) = workspace(&["dirname"]);
    write_executable(&bin.join("cargo"), "#!/bin/sh\nexit 101\n");
    run_build(dir.path(), &bin)
        .code(1)
        .stderr(predicate::str::contains("Failed to build release binaries"));
    assert!(!dir.path().join("module.tar.gz").exists());
}

#[test]
fn archive_holds_manifest_and_executable() {
    let (dir, bin) = workspace(&["dirname", "mkdir", "chmod", "cp", "tar", "gzip"]);
    write_executable(
        &bin.join("cargo"),
        "#!/bin/sh\nmkdir -p target/release\nprintf '#!/bin/sh\\necho ok\\n' > target/release/chessboard\nchmod +x target/release/chessboard\n",
    );
    run_build(dir.path(), &bin)
        .success()
        .stdout(predicate::str::contains("Created module.tar.gz"));

    let listing = StdCommand::new("tar")
        .arg("tzf")
        .arg(dir.path().join("module.tar.gz"))
        .output()
        .unwrap();
    assert!(listing.status.success());
    let names: Vec<String> = String::from_utf8(listing.stdout)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    assert_eq!(names, vec!["meta.json", "chessboard"]);
    assert!(dir.path().join("chessboard").is_file());
}
