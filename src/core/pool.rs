//! One generation of the worker pool: a shared queue drained by a
//! self-sizing set of tokio executor tasks.

use crate::core::control::Control;
use crate::core::model::{JobId, ResourceId};
use crate::core::sync_lock;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

pub type GenerationId = u64;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub floor: usize,
    pub ceiling: usize,
    pub reap_interval: Duration,
    /// Draining units older than this are reported, never killed.
    pub stale_unit_after: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            floor: 1,
            ceiling: 20,
            reap_interval: Duration::from_secs(2),
            stale_unit_after: Duration::from_secs(120),
        }
    }
}

impl PoolConfig {
    pub fn target_size(&self, queue_depth: usize) -> usize {
        let floor = self.floor.max(1);
        queue_depth.clamp(floor, self.ceiling.max(floor))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Active,
    Draining,
    Retired,
}

impl GenerationState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => GenerationState::Active,
            1 => GenerationState::Draining,
            _ => GenerationState::Retired,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            GenerationState::Active => 0,
            GenerationState::Draining => 1,
            GenerationState::Retired => 2,
        }
    }
}

/// Who a unit works for; used to attribute a panic to a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UnitOwner {
    Resource(ResourceId),
    Analysis(JobId),
    Detached,
}

pub struct UnitContext {
    pub generation: Generation,
}

impl UnitContext {
    pub fn control(&self) -> &Control {
        self.generation.control()
    }
}

#[async_trait]
pub trait Unit: Send + 'static {
    fn describe(&self) -> String;

    fn owner(&self) -> UnitOwner {
        UnitOwner::Detached
    }

    async fn run(self: Box<Self>, ctx: UnitContext);

    /// Called instead of `run` when the unit is dropped unexecuted because
    /// its generation was cancelled.
    async fn abandon(self: Box<Self>) {}
}

#[async_trait]
pub trait UnitObserver: Send + Sync {
    async fn unit_panicked(&self, owner: UnitOwner, detail: String);
}

struct RunningUnit {
    describe: String,
    started: Instant,
}

struct GenerationInner {
    id: GenerationId,
    config: PoolConfig,
    state: AtomicU8,
    control: Control,
    queue: Mutex<VecDeque<Box<dyn Unit>>>,
    wake: Notify,
    stopping: AtomicBool,
    executors: AtomicUsize,
    in_flight: AtomicUsize,
    running: Mutex<HashMap<u64, RunningUnit>>,
    next_slot: AtomicU64,
    observer: Arc<dyn UnitObserver>,
    exited: Arc<Notify>,
}

/// Cheap handle onto one pool incarnation. In-flight units hold a clone, so
/// the generation outlives its replacement until they are done with it.
#[derive(Clone)]
pub struct Generation {
    inner: Arc<GenerationInner>,
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("executors", &self.current_size())
            .field("in_flight", &self.in_flight())
            .field("pending", &self.pending())
            .finish()
    }
}

impl Generation {
    pub fn new(
        id: GenerationId,
        config: PoolConfig,
        control: Control,
        observer: Arc<dyn UnitObserver>,
        exited: Arc<Notify>,
    ) -> Self {
        let generation = Self {
            inner: Arc::new(GenerationInner {
                id,
                config,
                state: AtomicU8::new(GenerationState::Active.as_u8()),
                control,
                queue: Mutex::new(VecDeque::new()),
                wake: Notify::new(),
                stopping: AtomicBool::new(false),
                executors: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                running: Mutex::new(HashMap::new()),
                next_slot: AtomicU64::new(0),
                observer,
                exited,
            }),
        };
        generation.rebalance();
        generation
    }

    pub fn id(&self) -> GenerationId {
        self.inner.id
    }

    pub fn state(&self) -> GenerationState {
        GenerationState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: GenerationState) {
        self.inner.state.store(state.as_u8(), Ordering::SeqCst);
    }

    pub fn control(&self) -> &Control {
        &self.inner.control
    }

    pub fn current_size(&self) -> usize {
        self.inner.executors.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        sync_lock(&self.inner.queue).len()
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    /// Enqueues without blocking. A stopping generation hands the unit back.
    pub fn submit(&self, unit: Box<dyn Unit>) -> Result<(), Box<dyn Unit>> {
        {
            let mut q = sync_lock(&self.inner.queue);
            if self.is_stopping() {
                return Err(unit);
            }
            q.push_back(unit);
        }
        self.inner.wake.notify_one();
        self.rebalance();
        Ok(())
    }

    /// Spawns executors up to the target for the current queue depth.
    /// Shrinking happens inside the executors once they are between units.
    pub fn rebalance(&self) {
        let inner = &self.inner;
        loop {
            if self.is_stopping() {
                return;
            }
            let target = inner.config.target_size(self.pending());
            let n = inner.executors.load(Ordering::SeqCst);
            if n >= target {
                return;
            }
            if inner
                .executors
                .compare_exchange(n, n + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                tokio::spawn(executor_loop(inner.clone()));
            }
        }
    }

    /// Cooperative: queued units still run, idle executors exit.
    pub fn request_stop(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        if self.state() == GenerationState::Active {
            self.set_state(GenerationState::Draining);
        }
        self.inner.wake.notify_waiters();
    }

    /// Flags cancellation; anything popped afterwards is abandoned.
    pub fn cancel(&self) {
        self.inner.control.cancel();
        self.inner.wake.notify_waiters();
    }

    pub fn take_pending(&self) -> Vec<Box<dyn Unit>> {
        sync_lock(&self.inner.queue).drain(..).collect()
    }

    pub fn is_drained(&self) -> bool {
        self.is_stopping() && self.in_flight() == 0 && self.current_size() == 0 && self.pending() == 0
    }

    pub fn stale_units(&self, older_than: Duration) -> Vec<(String, Duration)> {
        sync_lock(&self.inner.running)
            .values()
            .filter_map(|r| {
                let age = r.started.elapsed();
                (age >= older_than).then(|| (r.describe.clone(), age))
            })
            .collect()
    }
}

impl GenerationInner {
    fn pop(&self) -> Option<Box<dyn Unit>> {
        sync_lock(&self.queue).pop_front()
    }

    /// Gives up this executor's slot if the pool is above target.
    fn try_retire_executor(&self) -> bool {
        loop {
            let n = self.executors.load(Ordering::SeqCst);
            let target = self.config.target_size(sync_lock(&self.queue).len());
            if n <= target {
                return false;
            }
            if self
                .executors
                .compare_exchange(n, n - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Blocks until a unit is available. `None` means this executor's slot
    /// has already been released.
    async fn next_unit(&self) -> Option<Box<dyn Unit>> {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(unit) = self.pop() {
                return Some(unit);
            }
            if self.stopping.load(Ordering::SeqCst) {
                self.executors.fetch_sub(1, Ordering::SeqCst);
                return None;
            }
            if self.try_retire_executor() {
                return None;
            }
            notified.await;
        }
    }

    async fn execute(&self, unit: Box<dyn Unit>, generation: Generation) {
        let owner = unit.owner();
        let slot = self.next_slot.fetch_add(1, Ordering::SeqCst);
        sync_lock(&self.running).insert(slot, RunningUnit { describe: unit.describe(), started: Instant::now() });
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let outcome = AssertUnwindSafe(unit.run(UnitContext { generation })).catch_unwind().await;
        if let Err(panic) = outcome {
            let detail = panic_message(panic.as_ref());
            tracing::error!(generation = self.id, ?owner, %detail, "unit panicked");
            let observed = AssertUnwindSafe(self.observer.unit_panicked(owner, detail)).catch_unwind().await;
            if observed.is_err() {
                tracing::error!(generation = self.id, "panic observer panicked");
            }
        }

        sync_lock(&self.running).remove(&slot);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn executor_loop(inner: Arc<GenerationInner>) {
    let generation = Generation { inner: inner.clone() };
    tracing::debug!(generation = inner.id, "executor started");
    while let Some(unit) = inner.next_unit().await {
        if inner.control.is_cancelled() {
            tracing::debug!(generation = inner.id, unit = %unit.describe(), "abandoning unit");
            unit.abandon().await;
        } else {
            inner.execute(unit, generation.clone()).await;
        }
        if inner.try_retire_executor() {
            break;
        }
    }
    // Pass the wakeup on so a unit queued during our exit is not stranded.
    if !sync_lock(&inner.queue).is_empty() {
        inner.wake.notify_one();
        generation.rebalance();
    }
    tracing::debug!(generation = inner.id, "executor exited");
    inner.exited.notify_one();
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::{wait_until, CountingObserver, ProbeUnit};
    use std::sync::atomic::AtomicUsize;

    fn generation(config: PoolConfig, observer: Arc<CountingObserver>) -> Generation {
        Generation::new(1, config, Control::default(), observer, Arc::new(Notify::new()))
    }

    #[test]
    fn target_size_is_clamped() {
        let c = PoolConfig::default();
        assert_eq!(c.target_size(0), 1);
        assert_eq!(c.target_size(7), 7);
        assert_eq!(c.target_size(500), 20);
    }

    #[tokio::test]
    async fn runs_every_submitted_unit() {
        let done = Arc::new(AtomicUsize::new(0));
        let g = generation(PoolConfig::default(), Arc::new(CountingObserver::default()));
        for _ in 0..25 {
            g.submit(ProbeUnit::boxed(done.clone(), Duration::from_millis(10))).map_err(|_| ()).unwrap();
        }
        assert!(g.current_size() <= 20);
        wait_until(|| done.load(Ordering::SeqCst) == 25).await;
        wait_until(|| g.in_flight() == 0).await;
    }

    #[tokio::test]
    async fn scales_up_then_back_to_floor() {
        let done = Arc::new(AtomicUsize::new(0));
        let g = generation(PoolConfig { ceiling: 4, ..PoolConfig::default() }, Arc::new(CountingObserver::default()));
        for _ in 0..8 {
            g.submit(ProbeUnit::boxed(done.clone(), Duration::from_millis(40))).map_err(|_| ()).unwrap();
        }
        assert_eq!(g.current_size(), 4);
        wait_until(|| done.load(Ordering::SeqCst) == 8).await;
        wait_until(|| g.current_size() == 1).await;
    }

    #[tokio::test]
    async fn panic_is_contained_and_reported() {
        let observer = Arc::new(CountingObserver::default());
        let done = Arc::new(AtomicUsize::new(0));
        let g = generation(PoolConfig { ceiling: 1, ..PoolConfig::default() }, observer.clone());
        g.submit(ProbeUnit::panicking()).map_err(|_| ()).unwrap();
        g.submit(ProbeUnit::boxed(done.clone(), Duration::ZERO)).map_err(|_| ()).unwrap();
        wait_until(|| done.load(Ordering::SeqCst) == 1).await;
        assert_eq!(observer.panics.load(Ordering::SeqCst), 1);
        assert_eq!(g.in_flight(), 0);
        assert!(g.current_size() >= 1);
    }

    #[tokio::test]
    async fn stopped_generation_rejects_and_drains() {
        let done = Arc::new(AtomicUsize::new(0));
        let g = generation(PoolConfig::default(), Arc::new(CountingObserver::default()));
        g.submit(ProbeUnit::boxed(done.clone(), Duration::from_millis(50))).map_err(|_| ()).unwrap();
        g.request_stop();
        assert_eq!(g.state(), GenerationState::Draining);
        assert!(g.submit(ProbeUnit::boxed(done.clone(), Duration::ZERO)).is_err());
        wait_until(|| g.is_drained()).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_generation_abandons_queued_units() {
        let done = Arc::new(AtomicUsize::new(0));
        let abandoned = Arc::new(AtomicUsize::new(0));
        let g = generation(PoolConfig { ceiling: 1, ..PoolConfig::default() }, Arc::new(CountingObserver::default()));
        g.submit(ProbeUnit::boxed(done.clone(), Duration::from_millis(80))).map_err(|_| ()).unwrap();
        for _ in 0..3 {
            g.submit(ProbeUnit::tracked(done.clone(), abandoned.clone())).map_err(|_| ()).unwrap();
        }
        wait_until(|| g.in_flight() == 1).await;
        g.cancel();
        g.request_stop();
        wait_until(|| g.is_drained()).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(abandoned.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn long_running_units_show_up_as_stale() {
        let done = Arc::new(AtomicUsize::new(0));
        let g = generation(PoolConfig::default(), Arc::new(CountingObserver::default()));
        g.submit(ProbeUnit::boxed(done.clone(), Duration::from_millis(200))).map_err(|_| ()).unwrap();
        wait_until(|| g.in_flight() == 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(g.stale_units(Duration::from_millis(10)).len(), 1);
        assert!(g.stale_units(Duration::from_secs(60)).is_empty());
    }
}
