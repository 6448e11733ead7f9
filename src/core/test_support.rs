//! Doubles and helpers shared by the async tests.

use crate::core::config::EngineConfig;
use crate::core::error::MergeError;
use crate::core::pool::{PoolConfig, Unit, UnitContext, UnitObserver, UnitOwner};
use crate::core::retry::RetryPolicy;
use crate::core::sync_lock;
use crate::plugins::hls::merge::MergeTool;
use crate::plugins::hls::HlsSettings;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Polls `cond` until it holds, failing the test after five seconds.
pub async fn wait_until(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Default)]
pub struct CountingObserver {
    pub panics: AtomicUsize,
}

#[async_trait]
impl UnitObserver for CountingObserver {
    async fn unit_panicked(&self, _owner: UnitOwner, _detail: String) {
        self.panics.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct ProbeUnit {
    done: Arc<AtomicUsize>,
    delay: Duration,
    panics: bool,
    abandoned: Option<Arc<AtomicUsize>>,
}

impl ProbeUnit {
    pub fn boxed(done: Arc<AtomicUsize>, delay: Duration) -> Box<dyn Unit> {
        Box::new(Self { done, delay, panics: false, abandoned: None })
    }

    pub fn panicking() -> Box<dyn Unit> {
        Box::new(Self { done: Arc::default(), delay: Duration::ZERO, panics: true, abandoned: None })
    }

    pub fn tracked(done: Arc<AtomicUsize>, abandoned: Arc<AtomicUsize>) -> Box<dyn Unit> {
        Box::new(Self { done, delay: Duration::ZERO, panics: false, abandoned: Some(abandoned) })
    }
}

#[async_trait]
impl Unit for ProbeUnit {
    fn describe(&self) -> String {
        "probe".to_string()
    }

    async fn run(self: Box<Self>, _ctx: UnitContext) {
        if self.panics {
            panic!("probe unit blew up");
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.done.fetch_add(1, Ordering::SeqCst);
    }

    async fn abandon(self: Box<Self>) {
        if let Some(a) = &self.abandoned {
            a.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Concatenates its inputs in the order given and remembers every call.
#[derive(Default)]
pub struct RecordingMerger {
    pub calls: Mutex<Vec<Vec<PathBuf>>>,
    pub fail: bool,
}

impl RecordingMerger {
    pub fn failing() -> Self {
        Self { calls: Mutex::default(), fail: true }
    }

    pub fn calls(&self) -> Vec<Vec<PathBuf>> {
        sync_lock(&self.calls).clone()
    }
}

#[async_trait]
impl MergeTool for RecordingMerger {
    fn name(&self) -> String {
        "recording".to_string()
    }

    fn preflight(&self) -> Result<PathBuf, MergeError> {
        Ok(PathBuf::from("recording"))
    }

    async fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MergeError> {
        sync_lock(&self.calls).push(inputs.to_vec());
        if self.fail {
            return Err(MergeError::Failed { code: Some(1), stderr: "refused".to_string() });
        }
        let mut joined = Vec::new();
        for p in inputs {
            joined.extend(tokio::fs::read(p).await?);
        }
        tokio::fs::write(output, joined).await?;
        Ok(())
    }
}

/// Defaults with delays small enough for tests.
pub fn test_config() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.pool = PoolConfig {
        reap_interval: Duration::from_millis(20),
        stale_unit_after: Duration::from_secs(5),
        ..PoolConfig::default()
    };
    cfg.retry = RetryPolicy {
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        ..RetryPolicy::default()
    };
    cfg.hls = HlsSettings { stall_interval: Duration::from_millis(50), ..HlsSettings::default() };
    cfg.driver.timeout_secs = 5;
    cfg
}
