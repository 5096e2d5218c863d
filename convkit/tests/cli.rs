use std::fs;
use std::process::Command;

use convkit::dump::{TensorData, TensorDump};
use tempfile::tempdir;

fn convkit(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_convkit"))
        .args(args)
        .output()
        .unwrap()
}

#[test]
fn run_passes_and_writes_dumps() {
    let dir = tempdir().unwrap();
    let dumps = dir.path().join("dumps");
    let out = convkit(&[
        "run",
        "-c",
        "4",
        "-k",
        "6",
        "--hi",
        "7",
        "--wi",
        "5",
        "--stride",
        "2,1",
        "--pad",
        "1",
        "-g",
        "2",
        "--direction",
        "backward-data",
        "--dtype",
        "bf16",
        "--dump-dir",
        dumps.to_str().unwrap(),
        "--json",
    ]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let report: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(report["direction"], "backward_data");
    assert_eq!(report["data_type"], "bf16");
    assert_eq!(report["verification"]["passed"], true);
    assert_eq!(report["reference_fingerprint"], report["result_fingerprint"]);

    let files: Vec<_> = fs::read_dir(&dumps).unwrap().map(|e| e.unwrap().path()).collect();
    assert_eq!(files.len(), 2);
    let naive = files.iter().find(|p| p.to_string_lossy().ends_with("-naive.ckt")).unwrap();
    let implicit = files.iter().find(|p| p.to_string_lossy().ends_with("-implicit.ckt")).unwrap();
    let out = convkit(&["compare", naive.to_str().unwrap(), implicit.to_str().unwrap()]);
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).starts_with("PASSED"));
}

#[test]
fn compare_rejects_divergent_dumps() {
    let dir = tempdir().unwrap();
    let a = dir.path().join("a.ckt");
    let b = dir.path().join("b.ckt");
    TensorDump::new(&[4], TensorData::Fp32(vec![1.0, 2.0, 3.0, 4.0]))
        .unwrap()
        .write(&a)
        .unwrap();
    TensorDump::new(&[4], TensorData::Fp32(vec![1.0, 2.0, 3.0, 5.0]))
        .unwrap()
        .write(&b)
        .unwrap();

    let out = convkit(&["compare", a.to_str().unwrap(), b.to_str().unwrap()]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).starts_with("FAILED"));

    let out = convkit(&["compare", a.to_str().unwrap(), b.to_str().unwrap(), "--tolerance", "0.5"]);
    assert!(out.status.success());
}

#[test]
fn sweep_writes_reports() {
    let dir = tempdir().unwrap();
    let sweep = dir.path().join("sweep.json");
    let reports = dir.path().join("reports.json");
    fs::write(
        &sweep,
        r#"{
            "config": { "data_type": "fp16" },
            "problems": [
                { "n": 2, "c": 3, "k": 2, "input": [6], "filter": [3], "dilation": [2] },
                { "n": 1, "c": 2, "k": 2, "input": [4, 4, 4], "filter": [2, 2, 2], "stride": [2], "pad": [1] }
            ]
        }"#,
    )
    .unwrap();

    let out = convkit(&["sweep", sweep.to_str().unwrap(), "--report", reports.to_str().unwrap()]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let banner = "Running 2 problems x 3 directions (fp16, implicit backend)";
    assert!(String::from_utf8_lossy(&out.stderr).contains(banner));
    let parsed: Vec<serde_json::Value> = serde_json::from_str(&fs::read_to_string(&reports).unwrap()).unwrap();
    assert_eq!(parsed.len(), 6);
    assert!(parsed.iter().all(|r| r["verification"]["passed"] == true));
}

#[test]
fn invalid_problem_fails_cleanly() {
    let out = convkit(&["run", "-c", "3", "-k", "2", "-g", "2", "--hi", "4", "--wi", "4"]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("group"));
}

#[test]
fn activ_checks_gradients() {
    let out = convkit(&["activ", "--mode", "elu", "--alpha", "0.7", "--len", "1024", "--json"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(report["layer"], "activation elu");
    assert_eq!(report["checks"][0]["name"], "backward");
    assert_eq!(report["checks"][0]["verification"]["len"], 1024);
    assert_eq!(report["checks"][0]["verification"]["passed"], true);
}

#[test]
fn bnorm_runs_all_checks() {
    let out = convkit(&["bnorm", "--mode", "per-activation", "-n", "4", "-c", "3", "--hi", "2", "--wi", "3"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.starts_with("batch_norm per_activation n=4 c=3 h=2 w=3"));
    for check in ["inference", "saved_stats", "backward"] {
        assert!(stdout.contains(check), "{stdout}");
    }
    assert!(!stdout.contains("FAILED"));

    let out = convkit(&["bnorm", "-c", "3", "--hi", "2", "--wi", "2", "--epsilon", "0"]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("epsilon"));
}
