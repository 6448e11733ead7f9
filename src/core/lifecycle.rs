use crate::core::control::Control;
use crate::core::pool::{Generation, GenerationId, GenerationState, PoolConfig, Unit, UnitObserver};
use crate::core::sync_lock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Owns the active generation and the zombies that are still draining.
pub struct PoolManager {
    config: PoolConfig,
    observer: Arc<dyn UnitObserver>,
    next_id: AtomicU64,
    active: Mutex<Generation>,
    zombies: Mutex<Vec<Generation>>,
    paused: Mutex<bool>,
    exited: Arc<Notify>,
}

impl PoolManager {
    pub fn new(config: PoolConfig, observer: Arc<dyn UnitObserver>) -> Arc<Self> {
        let exited = Arc::new(Notify::new());
        let first = Generation::new(1, config.clone(), Control::default(), observer.clone(), exited.clone());
        Arc::new(Self {
            config,
            observer,
            next_id: AtomicU64::new(2),
            active: Mutex::new(first),
            zombies: Mutex::new(Vec::new()),
            paused: Mutex::new(false),
            exited,
        })
    }

    pub fn active_generation(&self) -> Generation {
        sync_lock(&self.active).clone()
    }

    /// Swaps in a fresh generation without waiting for the old one.
    /// Units still queued on the old generation move over unless it was
    /// cancelled, in which case they are abandoned.
    pub fn restart(&self) -> Generation {
        let paused = *sync_lock(&self.paused);
        let (old, fresh) = {
            let mut active = sync_lock(&self.active);
            active.request_stop();
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let fresh = Generation::new(
                id,
                self.config.clone(),
                Control::new(paused),
                self.observer.clone(),
                self.exited.clone(),
            );
            let old = std::mem::replace(&mut *active, fresh.clone());
            (old, fresh)
        };

        let leftovers = old.take_pending();
        if old.control().is_cancelled() {
            if !leftovers.is_empty() {
                tracing::info!(generation = old.id(), count = leftovers.len(), "abandoning queued units");
                tokio::spawn(async move {
                    for unit in leftovers {
                        unit.abandon().await;
                    }
                });
            }
        } else {
            for unit in leftovers {
                self.submit(unit);
            }
        }

        tracing::info!(
            retired = old.id(),
            active = fresh.id(),
            in_flight = old.in_flight(),
            "pool restarted"
        );
        sync_lock(&self.zombies).push(old);
        self.exited.notify_one();
        fresh
    }

    /// Cancels everything still running, on the active generation and on
    /// every draining one, then replaces the active generation.
    pub fn cancel_active(&self) -> Generation {
        self.active_generation().cancel();
        for z in sync_lock(&self.zombies).iter() {
            z.cancel();
        }
        self.restart()
    }

    pub fn set_paused(&self, paused: bool) {
        *sync_lock(&self.paused) = paused;
        sync_lock(&self.active).control().set_paused(paused);
        for z in sync_lock(&self.zombies).iter() {
            z.control().set_paused(paused);
        }
    }

    pub fn is_paused(&self) -> bool {
        *sync_lock(&self.paused)
    }

    pub fn submit(&self, unit: Box<dyn Unit>) {
        let mut unit = unit;
        loop {
            let generation = self.active_generation();
            match generation.submit(unit) {
                Ok(()) => return,
                // Lost a race with restart; the replacement is already installed.
                Err(back) => unit = back,
            }
        }
    }

    /// Retires zombies that have drained and reports ones that look stuck.
    pub fn reap_zombies(&self) -> Vec<GenerationId> {
        let mut zombies = sync_lock(&self.zombies);
        let mut retired = Vec::new();
        zombies.retain(|g| {
            if g.is_drained() {
                g.set_state(GenerationState::Retired);
                retired.push(g.id());
                return false;
            }
            for (unit, age) in g.stale_units(self.config.stale_unit_after) {
                tracing::warn!(
                    generation = g.id(),
                    %unit,
                    age_secs = age.as_secs(),
                    "draining generation still has a long-running unit"
                );
            }
            true
        });
        for id in &retired {
            tracing::debug!(generation = id, "generation retired");
        }
        retired
    }

    pub fn zombie_count(&self) -> usize {
        sync_lock(&self.zombies).len()
    }

    pub fn zombies(&self) -> Vec<Generation> {
        sync_lock(&self.zombies).clone()
    }

    /// Reaps on every executor exit and on a fixed tick. Stops once the
    /// manager is dropped.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let exited = self.exited.clone();
        let period = self.config.reap_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = exited.notified() => {}
                }
                match weak.upgrade() {
                    Some(manager) => {
                        manager.reap_zombies();
                    }
                    None => break,
                }
            }
        })
    }
}
