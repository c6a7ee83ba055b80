use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::io::Write;

fn mockmox() -> assert_cmd::Command {
    cargo_bin_cmd!("mockmox").into()
}

/// Config rooted in `dir`, so nothing touches /opt or /usr/local.
fn write_test_config(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let config_path = dir.path().join("config.yaml");
    let mut f = std::fs::File::create(&config_path).unwrap();
    write!(
        f,
        r#"
libvirtd: test:///default
directories:
  base_dir: {base}
  script_location: {script}
defaults:
  vm_disk_size: 4
  vm_cpus: 1
  vm_memory: 512
"#,
        base = dir.path().join("base").display(),
        script = dir.path().join("bin-mockmox").display(),
    )
    .unwrap();
    config_path
}

fn installed(dir: &tempfile::TempDir) -> String {
    let config_path = write_test_config(dir);
    let config = config_path.to_str().unwrap().to_string();
    mockmox().args(["--config", &config, "install"]).assert().success();
    config
}

#[test]
fn help_works() {
    mockmox()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Templated KVM virtual machines"));
}

#[test]
fn missing_config_shows_error() {
    mockmox()
        .args(["--config", "/nonexistent/mockmox.yaml", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

#[test]
fn validation_rejects_relative_base_dir() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.yaml");
    std::fs::write(&config_path, "directories:\n  base_dir: relative/dir\n").unwrap();

    mockmox()
        .args(["--config", config_path.to_str().unwrap(), "install"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("base_dir"));
}

#[test]
fn install_creates_layout() {
    let dir = tempfile::tempdir().unwrap();
    let config = installed(&dir);
    let base = dir.path().join("base");

    for sub in ["templates", "active", "suspended", "instances", "groups", "logs"] {
        assert!(base.join(sub).is_dir(), "{sub} missing");
    }
    assert!(dir.path().join("bin-mockmox").symlink_metadata().is_ok());

    // Running it again is harmless.
    mockmox()
        .args(["--config", &config, "install"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Installed"));
}

#[test]
fn commands_require_install() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir);

    mockmox()
        .args(["--config", config_path.to_str().unwrap(), "template", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("mockmox install"));
}

#[test]
fn blank_template_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let config = installed(&dir);

    mockmox()
        .args(["--config", &config, "template", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No templates."));

    mockmox()
        .args([
            "--config", &config, "template", "create", "scratch", "--disk", "2G", "--os",
            "debian",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("scratch"));
    assert!(
        dir.path()
            .join("base/templates/scratch/scratch.qcow2")
            .is_file()
    );

    mockmox()
        .args(["--config", &config, "list", "templates"])
        .assert()
        .success()
        .stdout(predicate::str::contains("scratch").and(predicate::str::contains("debian")));

    mockmox()
        .args(["--config", &config, "template", "create", "scratch", "--disk", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    mockmox()
        .args(["--config", &config, "template", "delete", "scratch"])
        .assert()
        .success()
        .stdout(predicate::str::contains("deleted"));
    assert!(!dir.path().join("base/templates/scratch").exists());
}

#[test]
fn template_list_json() {
    let dir = tempfile::tempdir().unwrap();
    let config = installed(&dir);

    mockmox()
        .args(["--config", &config, "template", "create", "tiny", "--disk", "1"])
        .assert()
        .success();

    mockmox()
        .args(["--config", &config, "--json", "list", "templates"])
        .assert()
        .success()
        .stdout(
            predicate::str::starts_with("[")
                .and(predicate::str::contains("\"name\""))
                .and(predicate::str::contains("tiny"))
                .and(predicate::str::contains("qcow2")),
        );
}

#[test]
fn deleting_unknown_template_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = installed(&dir);

    mockmox()
        .args(["--config", &config, "template", "delete", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("template 'ghost' not found"));
}

#[test]
fn bad_disk_size_is_rejected_by_the_parser() {
    mockmox()
        .args(["template", "create", "x", "--disk", "lots"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--disk"));
}

#[test]
fn template_files_and_groups() {
    let dir = tempfile::tempdir().unwrap();
    let config = installed(&dir);
    let script = dir.path().join("setup.sh");
    std::fs::write(&script, "#!/bin/sh\necho hi\n").unwrap();

    mockmox()
        .args(["--config", &config, "template", "create", "web", "--disk", "1"])
        .assert()
        .success();
    mockmox()
        .args(["--config", &config, "template", "add-file", "web"])
        .arg(&script)
        .args(["--user", "root", "--type", "executable"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Added executable"));
    mockmox()
        .args([
            "--config", &config, "template", "list-files", "web", "-u", "root", "-t",
            "executable",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("root_executables/setup.sh"));

    mockmox()
        .args(["--config", &config, "group", "create", "frontend"])
        .assert()
        .success();
    mockmox()
        .args(["--config", &config, "group", "add", "web", "frontend"])
        .assert()
        .success()
        .stdout(predicate::str::contains("web"));
    assert!(
        dir.path()
            .join("base/groups/frontend/templates/web/root_executables/setup.sh")
            .is_file()
    );
    mockmox()
        .args(["--config", &config, "list", "groups"])
        .assert()
        .success()
        .stdout(predicate::str::contains("frontend").and(predicate::str::contains("web")));

    mockmox()
        .args(["--config", &config, "template", "delete", "web"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("frontend"));

    mockmox()
        .args(["--config", &config, "group", "delete", "frontend"])
        .assert()
        .success();
    mockmox()
        .args(["--config", &config, "template", "delete", "web"])
        .assert()
        .success();
}
