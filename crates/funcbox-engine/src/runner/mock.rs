// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runtime for testing.
//!
//! A runtime implementation that simulates image builds and container runs
//! without a container engine. Builds fingerprint the build context so that
//! runs of the same image produce the same output, and every operation is
//! counted for assertions.

use async_trait::async_trait;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use super::traits::*;

/// How mock containers behave when run.
#[derive(Debug, Clone)]
pub enum MockRunBehavior {
    /// Print a JSON document describing the image and the request it received.
    Echo,
    /// Like `Echo`, after sleeping.
    Delay(Duration),
    /// Print raw text to stdout and exit cleanly.
    Raw(String),
    /// Exit with a non-zero code.
    Fail {
        /// Exit code to report.
        exit_code: i32,
        /// Stderr to report.
        stderr: String,
    },
    /// Never exit on its own.
    Hang,
    /// Fail to start, as when the runtime CLI cannot be spawned.
    Unavailable,
}

/// Mock runtime for testing.
pub struct MockRuntime {
    /// Built images: tag -> fingerprint of the build context
    images: Arc<Mutex<HashMap<String, String>>>,
    /// Containers currently running
    running: Arc<std::sync::Mutex<HashSet<String>>>,
    run_behavior: std::sync::Mutex<MockRunBehavior>,
    last_run: std::sync::Mutex<Option<RunSpec>>,
    /// Number of upcoming builds that exit non-zero
    failing_builds: AtomicUsize,
    /// If true, builds never complete
    hang_builds: AtomicBool,
    /// If true, kills never complete
    hang_kills: AtomicBool,
    build_calls: AtomicUsize,
    run_calls: AtomicUsize,
    kill_calls: AtomicUsize,
    removed_images: AtomicUsize,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    /// Create a mock runtime whose builds succeed and whose containers echo.
    pub fn new() -> Self {
        Self {
            images: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(std::sync::Mutex::new(HashSet::new())),
            run_behavior: std::sync::Mutex::new(MockRunBehavior::Echo),
            last_run: std::sync::Mutex::new(None),
            failing_builds: AtomicUsize::new(0),
            hang_builds: AtomicBool::new(false),
            hang_kills: AtomicBool::new(false),
            build_calls: AtomicUsize::new(0),
            run_calls: AtomicUsize::new(0),
            kill_calls: AtomicUsize::new(0),
            removed_images: AtomicUsize::new(0),
        }
    }

    /// Create a mock runtime with a specific run behavior.
    pub fn with_behavior(behavior: MockRunBehavior) -> Self {
        let runtime = Self::new();
        runtime.set_run_behavior(behavior);
        runtime
    }

    /// Change how subsequent runs behave.
    pub fn set_run_behavior(&self, behavior: MockRunBehavior) {
        *self.run_behavior.lock().unwrap_or_else(|e| e.into_inner()) = behavior;
    }

    /// Make the next `count` builds exit with code 1.
    pub fn fail_next_builds(&self, count: usize) {
        self.failing_builds.store(count, Ordering::SeqCst);
    }

    /// Make builds hang until the caller gives up on them.
    pub fn hang_builds(&self, hang: bool) {
        self.hang_builds.store(hang, Ordering::SeqCst);
    }

    /// Make kills hang, as with a wedged runtime CLI.
    pub fn hang_kills(&self, hang: bool) {
        self.hang_kills.store(hang, Ordering::SeqCst);
    }

    /// Forget every built image, as if the host had been pruned.
    pub async fn prune_images(&self) {
        self.images.lock().await.clear();
    }

    /// Number of `build` calls so far.
    pub fn build_calls(&self) -> usize {
        self.build_calls.load(Ordering::SeqCst)
    }

    /// Number of `run` calls so far.
    pub fn run_calls(&self) -> usize {
        self.run_calls.load(Ordering::SeqCst)
    }

    /// Number of `kill` calls so far.
    pub fn kill_calls(&self) -> usize {
        self.kill_calls.load(Ordering::SeqCst)
    }

    /// Number of images removed through `remove_image`.
    pub fn removed_images(&self) -> usize {
        self.removed_images.load(Ordering::SeqCst)
    }

    /// The most recent run specification.
    pub fn last_run(&self) -> Option<RunSpec> {
        self.last_run
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Tags of all images currently present.
    pub async fn image_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.images.lock().await.keys().cloned().collect();
        tags.sort();
        tags
    }

    /// Map a path inside the container back to the host through the mounts.
    fn host_path(spec: &RunSpec, container_path: &str) -> Option<PathBuf> {
        spec.mounts.iter().find_map(|m| {
            container_path
                .strip_prefix(&m.destination)
                .map(|rest| m.source.join(rest.trim_start_matches('/')))
        })
    }

    /// Echo output: the image identity plus whatever request the engine mounted.
    async fn echo_output(&self, spec: &RunSpec, fingerprint: &str) -> String {
        let request = match spec
            .env
            .get("FUNCBOX_REQUEST_PATH")
            .and_then(|p| Self::host_path(spec, p))
        {
            Some(path) => tokio::fs::read_to_string(&path)
                .await
                .ok()
                .and_then(|s| serde_json::from_str::<Value>(&s).ok())
                .unwrap_or(Value::Null),
            None => Value::Null,
        };

        json!({
            "image": spec.image_tag,
            "fingerprint": fingerprint,
            "request": request,
            "database_url": spec.env.get("DATABASE_URL"),
        })
        .to_string()
    }
}

/// Removes a container from the running set when the run ends or is dropped.
struct RunningGuard {
    running: Arc<std::sync::Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.name);
    }
}

/// Hash every file of a build context in path order.
fn fingerprint_context(dir: &Path) -> std::io::Result<String> {
    fn collect(dir: &Path, base: &Path, out: &mut Vec<(String, Vec<u8>)>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                collect(&path, base, out)?;
            } else {
                let rel = path
                    .strip_prefix(base)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .to_string();
                // Build logs are written next to the sources and are not part of the image.
                if rel == "build.log" {
                    continue;
                }
                out.push((rel, std::fs::read(&path)?));
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    collect(dir, dir, &mut files)?;
    files.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (name, content) in files {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(&content);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn runtime_type(&self) -> &'static str {
        "mock"
    }

    async fn build(&self, spec: &BuildSpec) -> Result<BuildOutput> {
        self.build_calls.fetch_add(1, Ordering::SeqCst);

        if !spec.context_dir.is_dir() {
            return Err(RuntimeError::ContextNotFound(
                spec.context_dir.display().to_string(),
            ));
        }

        if self.hang_builds.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let should_fail = self
            .failing_builds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Ok(BuildOutput {
                exit_code: 1,
                logs: format!("STEP 1/2: FROM base\nError: mock build failure for {}", spec.tag),
            });
        }

        let fingerprint = fingerprint_context(&spec.context_dir)?;
        self.images
            .lock()
            .await
            .insert(spec.tag.clone(), fingerprint.clone());

        Ok(BuildOutput {
            exit_code: 0,
            logs: format!(
                "STEP 1/2: FROM base\nSTEP 2/2: COPY . /app\nCOMMIT {}\n{}",
                spec.tag, fingerprint
            ),
        })
    }

    async fn run(&self, spec: &RunSpec) -> Result<RunOutput> {
        self.run_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_run.lock().unwrap_or_else(|e| e.into_inner()) = Some(spec.clone());

        let Some(fingerprint) = self.images.lock().await.get(&spec.image_tag).cloned() else {
            return Ok(RunOutput {
                exit_code: 125,
                stdout: String::new(),
                stderr: format!("Error: {}: image not known", spec.image_tag),
            });
        };

        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(spec.container_name.clone());
        let _guard = RunningGuard {
            running: self.running.clone(),
            name: spec.container_name.clone(),
        };

        let behavior = self
            .run_behavior
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        match behavior {
            MockRunBehavior::Echo => Ok(RunOutput {
                exit_code: 0,
                stdout: self.echo_output(spec, &fingerprint).await,
                stderr: String::new(),
            }),
            MockRunBehavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(RunOutput {
                    exit_code: 0,
                    stdout: self.echo_output(spec, &fingerprint).await,
                    stderr: String::new(),
                })
            }
            MockRunBehavior::Raw(text) => Ok(RunOutput {
                exit_code: 0,
                stdout: text,
                stderr: String::new(),
            }),
            MockRunBehavior::Fail { exit_code, stderr } => Ok(RunOutput {
                exit_code,
                stdout: String::new(),
                stderr,
            }),
            MockRunBehavior::Hang => std::future::pending::<Result<RunOutput>>().await,
            MockRunBehavior::Unavailable => Err(RuntimeError::Other(
                "mock runtime unavailable".to_string(),
            )),
        }
    }

    async fn kill(&self, container_name: &str) -> Result<()> {
        self.kill_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_kills.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(container_name);
        Ok(())
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        if self.images.lock().await.remove(tag).is_some() {
            self.removed_images.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn image_exists(&self, tag: &str) -> bool {
        self.images.lock().await.contains_key(tag)
    }

    async fn container_exists(&self, container_name: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(container_name)
    }
}
