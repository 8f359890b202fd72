use std::fs;
use std::process::Command;

use tempfile::tempdir;

fn run_cli(args: &[&str]) -> String {
    let output = Command::new(env!("CARGO_BIN_EXE_st-tta-cli"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).unwrap()
}

#[test]
fn run_writes_report_and_checkpoint() {
    let dir = tempdir().unwrap();
    let report_path = dir.path().join("report.json");
    let checkpoint_path = dir.path().join("pretrained.json");
    let common = [
        "--seed",
        "3",
        "--classes",
        "4",
        "--features",
        "6",
        "--train-per-class",
        "30",
        "--test-per-class",
        "20",
        "--batch-size",
        "40",
        "--nepoch",
        "2",
        "--stopepoch",
        "0",
        "--log",
        "error",
        "--checkpoint",
        checkpoint_path.to_str().unwrap(),
    ];

    let mut args = common.to_vec();
    args.extend(["--report", report_path.to_str().unwrap()]);
    let stdout = run_cli(&args);
    assert!(stdout.contains("Epoch 0/2:"));
    assert!(stdout.contains("Epoch 2/2"));
    assert!(checkpoint_path.exists());

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(report["corruption"], "shift");
    assert_eq!(report["epochs"].as_array().unwrap().len(), 2);
    assert_eq!(report["adapt"]["objective"], "batch_nuclear_norm");

    // The second run reloads the checkpoint written by the first one.
    let mut args = common.to_vec();
    args.extend(["--episodic", "--objective", "entropy", "--optimizer", "sgd"]);
    let stdout = run_cli(&args);
    assert!(stdout.contains("softmax_entropy"));
}

#[test]
fn invalid_level_fails() {
    let status = Command::new(env!("CARGO_BIN_EXE_st-tta-cli"))
        .args(["--level", "9", "--nepoch", "1", "--log", "error"])
        .status()
        .unwrap();
    assert!(!status.success());
}
