use std::fs;
use std::process::Command;

use tempfile::tempdir;

#[test]
fn config_subcommand_writes_loadable_toml() {
    let tmp = tempdir().expect("temporary directory");
    let config_path = tmp.path().join("study.toml");

    let exe = env!("CARGO_BIN_EXE_gxesim");
    let status = Command::new(exe)
        .args(["config", "--out", config_path.to_str().expect("path str")])
        .status()
        .expect("run gxesim cli");
    assert!(status.success(), "CLI exited with status {status:?}");

    let config = gxesim::config::StudyConfig::load(config_path.to_str().expect("path str"))
        .expect("load written config");
    assert_eq!(config.n_individuals, 1000);
    assert_eq!(config.n_snps, 10);
}

#[test]
fn run_subcommand_prints_table_and_writes_tsv() {
    let tmp = tempdir().expect("temporary directory");
    let tsv_path = tmp.path().join("metrics.tsv");

    let exe = env!("CARGO_BIN_EXE_gxesim");
    let output = Command::new(exe)
        .args([
            "run",
            "--n-individuals",
            "500",
            "--n-snps",
            "4",
            "--realizations",
            "2",
            "--folds",
            "4",
            "--out",
            tsv_path.to_str().expect("path str"),
        ])
        .output()
        .expect("run gxesim cli");
    assert!(
        output.status.success(),
        "CLI failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("lr/interaction"));
    assert!(stdout.contains("lasso/no_interaction"));

    let tsv = fs::read_to_string(&tsv_path).expect("read metrics");
    assert_eq!(tsv.lines().count(), 5);
}

#[test]
fn invalid_arguments_fail() {
    let exe = env!("CARGO_BIN_EXE_gxesim");
    let output = Command::new(exe)
        .args(["run", "--alpha", "1.5"])
        .output()
        .expect("run gxesim cli");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("alpha"));
}
