use std::process::Command;

fn run(args: &[&str]) -> (String, String, bool) {
    let args: Vec<String> = args.iter().map(|a| format!("tests/fixtures/{a}")).collect();
    let output = Command::new(env!("CARGO_BIN_EXE_deal-escrow"))
        .args(&args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run binary");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn valid_ledger() {
    let (stdout, stderr, success) = run(&["valid.csv"]);

    assert!(success);
    assert!(stderr.is_empty());

    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(
        lines,
        [
            "user,balance,frozen,total",
            "alice,265,0,265",
            "bob,85,100,185",
            "carol,690,0,690",
        ]
    );
}

#[test]
fn errors_warn_but_do_not_block() {
    let (stdout, stderr, success) = run(&["with_errors.csv"]);

    assert!(success);
    assert!(stderr.contains("unrecognized command type"));
    assert!(stderr.contains("freeze missing deal"));
    // rejected by the wallet, not by the reader
    assert!(!stderr.contains("insufficient balance"));

    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines, ["user,balance,frozen,total", "alice,485,500,985"]);
}

#[test]
fn config_overrides_policy() {
    let (stdout, _, success) = run(&["valid.csv", "policy.toml"]);

    assert!(success);
    let lines: Vec<&str> = stdout.lines().collect();
    // no selection fee; a penalty of 100 on d3
    assert_eq!(lines[1], "alice,400,0,400");
    assert_eq!(lines[2], "bob,100,100,200");
    assert_eq!(lines[3], "carol,600,0,600");
}

#[test]
fn missing_ledger_fails() {
    let (stdout, stderr, success) = run(&["absent.csv"]);

    assert!(!success);
    assert!(stdout.is_empty());
    assert!(stderr.contains("cannot open"));
}
