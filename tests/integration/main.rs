//! Integration tests for keel

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    /// keel with a config path that does not exist, so user config is ignored
    fn keel(home: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("keel");
        cmd.env("KEEL_CONFIG", home.path().join("config.toml"))
            .env_remove("KEEL_IMAGES_REPO")
            .env_remove("KEEL_STAGES_STORAGE")
            .env_remove("KEEL_IMAGES_CLEANUP_POLICIES");
        cmd
    }

    fn cleanup(home: &TempDir, project: &TempDir) -> Command {
        let mut cmd = keel(home);
        cmd.arg("--dir").arg(project.path()).args([
            "cleanup",
            "--stages-storage",
            ":local",
            "--images-repo",
            "registry.example.com/shop",
            "--without-kube",
            "--dry-run",
        ]);
        cmd
    }

    #[test]
    fn help_displays() {
        let home = TempDir::new().unwrap();
        keel(&home)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("policy-driven cleanup"));
    }

    #[test]
    fn version_displays() {
        let home = TempDir::new().unwrap();
        keel(&home)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("keel"));
    }

    #[test]
    fn cleanup_help_lists_flags() {
        let home = TempDir::new().unwrap();
        keel(&home)
            .args(["cleanup", "--help"])
            .assert()
            .success()
            .stdout(predicate::str::contains("--images-repo"))
            .stdout(predicate::str::contains("--without-kube"))
            .stdout(predicate::str::contains("--images-cleanup-policies"));
    }

    #[test]
    fn cleanup_requires_repo() {
        let home = TempDir::new().unwrap();
        keel(&home)
            .args(["cleanup", "--stages-storage", ":local"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--images-repo"));
    }

    #[test]
    fn missing_project_config_fails() {
        let home = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        cleanup(&home, &project)
            .assert()
            .failure()
            .stderr(predicate::str::contains(".keel.toml"));
    }

    #[test]
    fn invalid_policy_spec_fails() {
        let home = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        cleanup(&home, &project)
            .args(["--images-cleanup-policies", "branch:*,keep=lots"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid cleanup policy"));
    }

    #[test]
    fn invalid_project_config_fails() {
        let home = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        std::fs::write(project.path().join(".keel.toml"), "[project]\nname = \"\"\n").unwrap();

        cleanup(&home, &project)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }
}
