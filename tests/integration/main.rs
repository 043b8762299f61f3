//! Integration tests for flowbox

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    fn flowbox() -> Command {
        cargo_bin_cmd!("flowbox")
    }

    /// Command with an empty config file isolated in `dir`
    fn flowbox_in(dir: &TempDir) -> Command {
        let config = dir.path().join("config.toml");
        if !config.exists() {
            std::fs::write(&config, "[general]\naudit_log = false\n").unwrap();
        }
        let mut cmd = flowbox();
        cmd.env("FLOWBOX_CONFIG", config);
        cmd
    }

    #[test]
    fn help_displays() {
        flowbox()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("flow-step execution"));
    }

    #[test]
    fn version_displays() {
        flowbox()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("flowbox"));
    }

    #[test]
    fn config_path_honors_flag() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        flowbox()
            .arg("--config")
            .arg(&path)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("custom.toml"));
    }

    #[test]
    fn config_show() {
        let dir = TempDir::new().unwrap();
        flowbox_in(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[pool]"))
            .stdout(predicate::str::contains("audit_log = false"));
    }

    #[test]
    fn invalid_config_reports_path() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.toml"), "[pool\nsize = ").unwrap();
        flowbox_in(&dir)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("config.toml"));
    }

    #[test]
    fn cache_list_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            format!(
                "[general]\naudit_log = false\n[cache]\nroot = {:?}\n",
                dir.path().join("cache")
            ),
        )
        .unwrap();
        flowbox_in(&dir)
            .args(["cache", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No cache entries found"));
    }

    #[test]
    fn run_rejects_bad_piece() {
        let dir = TempDir::new().unwrap();
        let op = dir.path().join("op.json");
        std::fs::write(&op, "{}").unwrap();
        flowbox_in(&dir)
            .arg("run")
            .arg(&op)
            .args(["--piece", "no-version"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("expected name@version"));
    }
}

#[cfg(unix)]
mod run_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use flowbox::config::Config;
    use predicates::prelude::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// A workspace whose engine is `/bin/sh -c <script>` and whose package
    /// manager is `true`
    struct Workspace {
        _dir: TempDir,
        config: PathBuf,
        operation: PathBuf,
    }

    impl Workspace {
        fn new(script: &str) -> Self {
            let dir = TempDir::new().unwrap();

            let mut config = Config::default();
            config.general.audit_log = false;
            config.pool.size = 1;
            config.sandbox.root = Some(dir.path().join("slots"));
            config.sandbox.engine_command =
                vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()];
            config.cache.root = Some(dir.path().join("cache"));
            config.cache.archive_dir = Some(dir.path().join("archives"));
            config.installer.package_manager = "true".to_string();
            config.installer.blob_dir = Some(dir.path().join("blobs"));

            let config_path = dir.path().join("config.toml");
            std::fs::write(&config_path, toml::to_string_pretty(&config).unwrap()).unwrap();

            let operation = dir.path().join("op.json");
            std::fs::write(&operation, r#"{"flowVersionId":"fv_1","steps":["trigger"]}"#)
                .unwrap();

            Self {
                _dir: dir,
                config: config_path,
                operation,
            }
        }

        fn cmd(&self) -> Command {
            let mut cmd = cargo_bin_cmd!("flowbox");
            cmd.arg("--config").arg(&self.config);
            cmd
        }

        fn run(&self) -> Command {
            let mut cmd = self.cmd();
            cmd.arg("run").arg(&self.operation);
            cmd
        }
    }

    const ECHO: &str = r#"cp "$FLOWBOX_INPUT" "$FLOWBOX_OUTPUT""#;

    #[test]
    fn run_echoes_operation_back() {
        let ws = Workspace::new(ECHO);
        ws.run()
            .args(["--type", "execute-step"])
            .assert()
            .success()
            .stdout(predicate::str::contains(r#""verdict":"success""#))
            .stdout(predicate::str::contains(r#""operationType":"EXECUTE_STEP""#))
            .stdout(predicate::str::contains(r#""flowVersionId":"fv_1""#));
    }

    #[test]
    fn run_reads_operation_from_stdin() {
        let ws = Workspace::new(ECHO);
        ws.cmd()
            .args(["run", "-"])
            .write_stdin(r#"{"stepName":"from_stdin"}"#)
            .assert()
            .success()
            .stdout(predicate::str::contains("from_stdin"));
    }

    #[test]
    fn run_times_out() {
        let ws = Workspace::new("sleep 2");
        ws.run()
            .args(["--timeout-ms", "100"])
            .assert()
            .failure()
            .stdout(predicate::str::contains(r#""verdict":"timeout""#))
            .stderr(predicate::str::contains("timed out after 100ms"));
    }

    #[test]
    fn run_reports_runtime_error() {
        let ws = Workspace::new("echo boom >&2; exit 3");
        ws.run()
            .assert()
            .failure()
            .stdout(predicate::str::contains(r#""verdict":"runtimeError""#))
            .stdout(predicate::str::contains("boom"));
    }

    #[test]
    fn run_builds_cache_listed_afterwards() {
        let ws = Workspace::new(ECHO);
        ws.run()
            .args(["--piece", "@flowbox/piece-http@0.3.0", "--code-step", "step_1"])
            .assert()
            .success();

        ws.cmd()
            .args(["cache", "list", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains(r#""state": "ready""#))
            .stdout(predicate::str::contains("@flowbox/piece-http@0.3.0"));
    }

    #[test]
    fn cache_clear_removes_entries() {
        let ws = Workspace::new(ECHO);
        ws.run()
            .args(["--piece", "@flowbox/piece-http@0.3.0"])
            .assert()
            .success();

        ws.cmd().args(["cache", "clear", "--yes"]).assert().success();

        ws.cmd()
            .args(["cache", "list", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::is_empty());
    }

    #[test]
    fn status_reports_json() {
        let ws = Workspace::new(ECHO);
        ws.cmd()
            .args(["status", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains(r#""backend": "process""#))
            .stdout(predicate::str::contains(r#""poolSize": 1"#));
    }
}
