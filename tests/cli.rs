use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn kyassist_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_kyassist"))
}

/// Config with embeddings and the language model disabled, so nothing
/// touches the network or downloads a model.
fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("guide.md"),
        "# 用户指南\n\n在设置中心配置网络代理。",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/knowledge.sqlite"

[embedding]
provider = "disabled"

[llm]
provider = "disabled"

[system_info]
enabled = false
"#,
        root.display()
    );

    let config_path = config_dir.join("kyassist.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_kyassist(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = kyassist_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run kyassist binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_check_reports_degraded_features() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_kyassist(&config_path, &["check"]);
    assert!(success, "check failed: {}", stderr);
    assert!(stdout.contains("embedding provider: disabled"));
    assert!(stdout.contains("retrieval-only"));
}

#[test]
fn test_missing_config_uses_defaults() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope.toml");

    let (stdout, stderr, success) = run_kyassist(&missing, &["check"]);
    assert!(success, "check failed: {}", stderr);
    assert!(stdout.contains("not found, using defaults"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("bad.toml");
    fs::write(&config_path, "[chunking]\nchunk_size = 100\noverlap = 200\n").unwrap();

    let (_stdout, stderr, success) = run_kyassist(&config_path, &["check"]);
    assert!(!success);
    assert!(stderr.contains("overlap"), "stderr: {}", stderr);
}

#[test]
fn test_stats_on_empty_store() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_kyassist(&config_path, &["stats"]);
    assert!(success, "stats failed: {}", stderr);
    assert!(stdout.contains("Documents:   0"));
    assert!(stdout.contains("Chunks:      0"));
    assert!(tmp.path().join("data/knowledge.sqlite").exists());
}

#[test]
fn test_add_reports_per_file_failures() {
    let (tmp, config_path) = setup_test_env();
    let files = tmp.path().join("files");
    let unsupported = tmp.path().join("files/data.xyz");
    fs::write(&unsupported, "x").unwrap();

    let (stdout, stderr, success) = run_kyassist(
        &config_path,
        &[
            "add",
            files.to_str().unwrap(),
            unsupported.to_str().unwrap(),
        ],
    );
    assert!(success, "add failed: {}", stderr);
    // the embedder is disabled, so even the supported file fails
    assert!(stdout.contains("ModelUnavailable"));
    assert!(stdout.contains("UnsupportedFormat"));
    assert!(stdout.contains("succeeded: 0  failed: 2"));
}

#[test]
fn test_ask_degrades_without_models() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_kyassist(&config_path, &["ask", "如何配置代理？"]);
    assert!(success, "ask failed: {}", stderr);
    assert!(stdout.contains("抱歉"));
}

#[test]
fn test_ask_json_carries_failure_kind() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) =
        run_kyassist(&config_path, &["ask", "如何配置代理？", "--json"]);
    assert!(success, "ask failed: {}", stderr);
    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(value["question"], "如何配置代理？");
    assert_eq!(value["failure"]["kind"], "model_unavailable");
    assert!(value["relevant_docs"].as_array().unwrap().is_empty());
}

#[test]
fn test_ask_empty_question() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _stderr, success) = run_kyassist(&config_path, &["ask", "  "]);
    assert!(success);
    assert!(stdout.contains("请输入问题"));
}

#[test]
fn test_remove_unknown_document() {
    let (tmp, config_path) = setup_test_env();
    let guide = tmp.path().join("files/guide.md");

    let (stdout, stderr, success) =
        run_kyassist(&config_path, &["remove", guide.to_str().unwrap()]);
    assert!(success, "remove failed: {}", stderr);
    assert!(stdout.contains("Not in knowledge base"));
}

#[test]
fn test_clear_requires_confirmation() {
    let (_tmp, config_path) = setup_test_env();

    let (_stdout, stderr, success) = run_kyassist(&config_path, &["clear"]);
    assert!(!success);
    assert!(stderr.contains("--yes"));

    let (stdout, stderr, success) = run_kyassist(&config_path, &["clear", "--yes"]);
    assert!(success, "clear failed: {}", stderr);
    assert!(stdout.contains("cleared"));
}

#[test]
fn test_sysinfo_json() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_kyassist(&config_path, &["sysinfo", "--json"]);
    assert!(success, "sysinfo failed: {}", stderr);
    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert!(value["collected_at"].is_string());
    assert!(value["is_kylin"].is_boolean());
}
