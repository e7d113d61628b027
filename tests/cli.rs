use serde_json::Value;
use std::process::Command;

const DEAD_LETTER_ARN: &str = "arn:aws:sqs:eu-west-2:123456789012:uploads-dlq";

fn cleanser(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_document-cleanser"))
        .args(args)
        .env_clear()
        .env("RUST_LOG", "info")
        .output()
        .unwrap()
}

#[test]
fn policy_output_is_pipeable_json() {
    for format in ["text", "json"] {
        let output = cleanser(&["policy", "--dead-letter-arn", DEAD_LETTER_ARN, "--log-format", format]);
        assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

        let document: Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(document["function"]["Timeout"], 300);
        assert!(
            document["queue"]["RedrivePolicy"]
                .as_str()
                .unwrap()
                .contains(DEAD_LETTER_ARN)
        );

        let logs = String::from_utf8_lossy(&output.stderr);
        assert!(logs.contains("Starting document-cleanser"), "{logs}");
    }
}

#[test]
fn policy_without_an_arn_fails() {
    let output = cleanser(&["policy"]);
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}
