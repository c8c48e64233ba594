//! Test support utilities for autolxc-core
//!
//! Provides a scripted [`MockRunner`], a [`MockFetcher`] and tarball helpers so
//! the bucket and containers can be exercised without LXC installed.

use crate::{LifecycleEvent, Observer, RuntimeContext};
use async_trait::async_trait;
use autolxc_config::GlobalConfig;
use autolxc_runtime::{display_command, CommandOutput, CommandRunner, Fetcher, RuntimeError};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What a mocked command does
#[derive(Debug, Clone)]
pub enum MockResponse {
    Output(CommandOutput),
    /// The binary cannot be found
    Unavailable,
    /// The command exceeds its timeout
    Timeout,
}

#[derive(Debug, Clone)]
struct MockRule {
    program: String,
    arg: Option<String>,
    response: MockResponse,
}

impl MockRule {
    fn matches(&self, argv: &[String]) -> bool {
        argv.first().map(String::as_str) == Some(self.program.as_str())
            && self
                .arg
                .as_ref()
                .map_or(true, |arg| argv.iter().any(|a| a == arg))
    }
}

/// Command runner that records every call and answers from a rule list.
///
/// Rules are checked newest first; unmatched commands succeed with no output.
#[derive(Default)]
pub struct MockRunner {
    calls: Mutex<Vec<Vec<String>>>,
    rules: Mutex<Vec<MockRule>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every call to `program` with `response`
    pub fn respond(&self, program: &str, response: MockResponse) {
        self.push_rule(program, None, response);
    }

    /// Answer calls to `program` that carry `arg` as one of their arguments
    pub fn respond_matching(&self, program: &str, arg: &str, response: MockResponse) {
        self.push_rule(program, Some(arg.to_string()), response);
    }

    fn push_rule(&self, program: &str, arg: Option<String>, response: MockResponse) {
        self.rules.lock().unwrap().push(MockRule {
            program: program.to_string(),
            arg,
            response,
        });
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|c| c.first().map(String::as_str) == Some(program))
            .collect()
    }

    pub fn count(&self, program: &str) -> usize {
        self.calls_to(program).len()
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(
        &self,
        argv: &[String],
        _cwd: Option<&Path>,
        timeout: Option<Duration>,
    ) -> autolxc_runtime::Result<CommandOutput> {
        self.calls.lock().unwrap().push(argv.to_vec());
        let response = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.matches(argv))
            .map(|r| r.response.clone());

        match response {
            None => Ok(CommandOutput::default()),
            Some(MockResponse::Output(output)) => Ok(output),
            Some(MockResponse::Unavailable) => Err(RuntimeError::Unavailable(format!(
                "{}: not found",
                argv.first().cloned().unwrap_or_default()
            ))),
            Some(MockResponse::Timeout) => Err(RuntimeError::Timeout {
                command: display_command(argv),
                timeout: timeout.unwrap_or_default(),
            }),
        }
    }
}

/// Fetcher that writes a fixed payload, or fails when it has none
#[derive(Default)]
pub struct MockFetcher {
    payload: Option<Vec<u8>>,
    delay: Duration,
    fetches: AtomicUsize,
}

impl MockFetcher {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload: Some(payload),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self::default()
    }

    /// Sleep before writing, to widen race windows
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> autolxc_runtime::Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.payload {
            Some(bytes) => {
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(dest, bytes)?;
                Ok(())
            }
            None => Err(RuntimeError::Download {
                url: url.to_string(),
                reason: "404 Not Found".to_string(),
            }),
        }
    }
}

/// Observer that records events, optionally tagging them so several tagged
/// observers can share one log
#[derive(Clone, Default)]
pub struct RecordingObserver {
    tag: String,
    log: Arc<Mutex<Vec<(String, LifecycleEvent)>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Another observer writing to the same log under `tag`
    pub fn tagged(&self, tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            log: Arc::clone(&self.log),
        }
    }

    pub fn tags(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.log.lock().unwrap().iter().map(|(_, e)| e.clone()).collect()
    }
}

impl Observer for RecordingObserver {
    fn notify(&self, event: &LifecycleEvent) {
        self.log.lock().unwrap().push((self.tag.clone(), event.clone()));
    }
}

/// Build a tarball from `(path, content)` pairs
pub fn tarball(files: &[(&str, &str)], gzip: bool) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, content.as_bytes())
            .unwrap();
    }
    let tar = builder.into_inner().unwrap();
    if !gzip {
        return tar;
    }

    use std::io::Write;
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(&tar).unwrap();
    encoder.finish().unwrap()
}

/// A packaged base container the way the image server ships it
pub fn base_image_tarball(name: &str) -> Vec<u8> {
    let config = format!(
        "lxc.rootfs.path = dir:container_dir/{name}/rootfs\nlxc.uts.name = {name}\n"
    );
    let config_path = format!("{name}/config");
    let hostname_path = format!("{name}/rootfs/etc/hostname");
    tarball(
        &[
            (config_path.as_str(), config.as_str()),
            (hostname_path.as_str(), name),
        ],
        true,
    )
}

/// Runtime context backed by `runner` with short timeouts
pub fn test_context(lxc_path: &Path, runner: Arc<MockRunner>) -> RuntimeContext {
    RuntimeContext::new(lxc_path, runner)
        .with_timeouts(Some(Duration::from_secs(5)), Duration::from_secs(1))
}

/// Config rooted at `lxc_path` with an image URL set
pub fn test_config(lxc_path: &Path) -> GlobalConfig {
    let mut config = GlobalConfig::default();
    config.container.lxc_path = lxc_path.to_string_lossy().to_string();
    config.container.image_url = Some("https://storage.example.com/base_09.tar.gz".to_string());
    config.runtime.download_timeout_secs = 5;
    config.runtime.stop_timeout_secs = 1;
    config
}

/// `lxc-ls --fancy` output for the given rows
pub fn listing(rows: &[(&str, &str)]) -> CommandOutput {
    let mut out = String::from("NAME STATE\n");
    for (name, state) in rows {
        out.push_str(&format!("{name} {state}\n"));
    }
    CommandOutput::ok(out)
}
