//! Capture of pinned environment facts and comparison against a saved pin.
//!
//! Replay never corrects a mismatch: it reports every divergent pinned field
//! so the caller can diagnose non-determinism.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::model::PinnedEnvironment;
use crate::process::ChildExt;

const LOCK_CANDIDATES: &[&str] = &["Cargo.lock", "Cargo.toml"];

fn file_sha256(path: &Path) -> Option<String> {
    let data = std::fs::read(path).ok()?;
    Some(hex::encode(Sha256::digest(&data)))
}

fn detect_git_commit(cwd: &Path) -> Option<String> {
    let mut child = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;
    match child.wait_timeout(Duration::from_secs(2)) {
        Ok(Some(status)) if status.success() => {
            use std::io::Read;
            let mut out = String::new();
            child.stdout.take()?.read_to_string(&mut out).ok()?;
            let commit = out.trim().to_string();
            (!commit.is_empty()).then_some(commit)
        }
        _ => {
            let _ = child.kill();
            let _ = child.wait();
            None
        }
    }
}

/// Capture the facts of the current environment worth pinning on a run.
pub fn capture_environment(project_root: Option<&Path>) -> PinnedEnvironment {
    let root: PathBuf = project_root
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    let dependency_lock_hash = LOCK_CANDIDATES
        .iter()
        .find_map(|candidate| file_sha256(&root.join(candidate)));

    PinnedEnvironment {
        harness_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        platform: Some(std::env::consts::OS.to_string()),
        machine: Some(std::env::consts::ARCH.to_string()),
        git_commit: detect_git_commit(&root),
        dependency_lock_hash,
        container_image: None,
        prompt_hash: None,
        policy_hash: None,
        extra: Default::default(),
    }
}

/// One pinned field whose current value diverges from the pin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvMismatch {
    pub key: String,
    pub pinned: String,
    pub current: Option<String>,
}

fn check(
    mismatches: &mut Vec<EnvMismatch>,
    key: &str,
    pinned: &Option<String>,
    current: &Option<String>,
) {
    // A field that was never pinned (absent or empty) is not compared.
    let Some(pinned) = pinned.as_deref().filter(|v| !v.is_empty()) else {
        return;
    };
    if current.as_deref() != Some(pinned) {
        mismatches.push(EnvMismatch {
            key: key.to_string(),
            pinned: pinned.to_string(),
            current: current.clone(),
        });
    }
}

/// Compare a saved pin against the environment captured now, skipping
/// fields that were never pinned.
pub fn compare_pins(pinned: &PinnedEnvironment, current: &PinnedEnvironment) -> Vec<EnvMismatch> {
    let mut mismatches = Vec::new();
    check(
        &mut mismatches,
        "harness_version",
        &pinned.harness_version,
        &current.harness_version,
    );
    check(&mut mismatches, "platform", &pinned.platform, &current.platform);
    check(&mut mismatches, "machine", &pinned.machine, &current.machine);
    check(&mut mismatches, "git_commit", &pinned.git_commit, &current.git_commit);
    check(
        &mut mismatches,
        "dependency_lock_hash",
        &pinned.dependency_lock_hash,
        &current.dependency_lock_hash,
    );
    check(
        &mut mismatches,
        "container_image",
        &pinned.container_image,
        &current.container_image,
    );
    check(&mut mismatches, "prompt_hash", &pinned.prompt_hash, &current.prompt_hash);
    check(&mut mismatches, "policy_hash", &pinned.policy_hash, &current.policy_hash);
    mismatches
}
