use std::fs;
use std::path::Path;

use anyhow::Result;
use assert_cmd::Command;
use predicates::str::contains;
use pretty_assertions::assert_eq;
use serde_json::Value as JsonValue;
use tempfile::TempDir;

fn pipelines(home: &Path) -> Result<Command> {
    let mut cmd = Command::cargo_bin("pipelines")?;
    cmd.env("HOME", home);
    cmd.env_remove("RUST_LOG");
    for var in [
        "PIPELINES_STATE_PATH",
        "PIPELINES_OUTPUT_DIR",
        "PIPELINES_GCS_BUCKET",
        "PIPELINES_MODE",
    ] {
        cmd.env_remove(var);
    }
    Ok(cmd)
}

#[test]
fn list_shows_every_flow() -> Result<()> {
    let home = TempDir::new()?;
    pipelines(home.path())?
        .arg("list")
        .assert()
        .success()
        .stdout(contains("tables-bindings"))
        .stdout(contains("audit-log"))
        .stdout(contains("flooding-detection"))
        .stdout(contains("on demand"));
    Ok(())
}

#[test]
fn list_as_json() -> Result<()> {
    let home = TempDir::new()?;
    let output = pipelines(home.path())?
        .args(["list", "--format", "json"])
        .output()?;
    assert!(output.status.success());

    let value: JsonValue = serde_json::from_slice(&output.stdout)?;
    let flows = value["flows"].as_array().cloned().unwrap_or_default();
    assert_eq!(flows.len(), 6);
    assert_eq!(flows[0]["kind"], "tables-bindings");
    assert_eq!(flows[1]["schedule"], JsonValue::Null);
    assert_eq!(flows[4]["schedule"]["interval"], 300);
    assert_eq!(flows[5]["kind"], "mapa-realizacoes");
    assert_eq!(flows[5]["schedule"]["interval"], 86400);
    Ok(())
}

#[test]
fn schedule_prints_next_runs() -> Result<()> {
    let home = TempDir::new()?;
    let output = pipelines(home.path())?
        .args([
            "schedule",
            "healthcheck",
            "-n",
            "3",
            "--after",
            "2024-05-10T12:01:00Z",
        ])
        .output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;
    let runs: Vec<&str> = stdout.lines().collect();
    assert_eq!(
        runs,
        vec![
            "2024-05-10T09:05:00-03:00",
            "2024-05-10T09:10:00-03:00",
            "2024-05-10T09:15:00-03:00",
        ]
    );
    Ok(())
}

#[test]
fn schedule_of_an_on_demand_flow() -> Result<()> {
    let home = TempDir::new()?;
    pipelines(home.path())?
        .args(["schedule", "audit-log"])
        .assert()
        .success()
        .stdout(contains("has no schedule"));
    Ok(())
}

#[test]
fn unknown_flow_is_rejected() -> Result<()> {
    let home = TempDir::new()?;
    pipelines(home.path())?
        .args(["run", "radar", "--dry-run"])
        .assert()
        .failure()
        .stderr(contains("unknown flow `radar`"));
    Ok(())
}

#[test]
fn init_writes_a_config_that_checks_clean() -> Result<()> {
    let home = TempDir::new()?;
    let config = home.path().join("pipelines").join("config.yaml");
    let config_arg = config.to_string_lossy().to_string();

    pipelines(home.path())?
        .args(["init", "--config", &config_arg])
        .assert()
        .success()
        .stdout(contains("Wrote"));
    let written = fs::read_to_string(&config)?;
    assert!(written.contains("tables_bindings:"));
    assert!(written.contains("dataset_id: datalake_gestao"));

    pipelines(home.path())?
        .args(["init", "--config", &config_arg])
        .assert()
        .failure()
        .stderr(contains("--force"));

    pipelines(home.path())?
        .args(["check", "--config", &config_arg])
        .assert()
        .success()
        .stdout(contains("configuration is valid"));
    Ok(())
}

#[test]
fn check_reports_invalid_settings() -> Result<()> {
    let home = TempDir::new()?;
    let config = home.path().join("config.yaml");
    let config_arg = config.to_string_lossy().to_string();
    pipelines(home.path())?
        .args(["init", "--config", &config_arg])
        .assert()
        .success();

    let contents = fs::read_to_string(&config)?.replace("environment: prod", "environment: dev");
    fs::write(&config, contents)?;

    pipelines(home.path())?
        .args(["check", "--config", &config_arg])
        .assert()
        .failure()
        .stderr(contains("healthcheck.environment"));
    Ok(())
}
