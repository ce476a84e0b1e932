use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use sysinfo::System;

use crate::queue::EngineHandle;

/// Fraction of physical memory shared between all sessions.
const SYSTEM_MEMORY_SHARE: f64 = 0.5;

/// Fallback total when physical memory cannot be determined.
const FALLBACK_TOTAL_BYTES: u64 = 2 * 1024 * 1024 * 1024;

static SHARED: OnceLock<MemoryBudget> = OnceLock::new();

struct BudgetInner {
    total_bytes: u64,
    members: BTreeMap<u64, EngineHandle>,
}

/// Divides a fixed memory total equally among open sessions.
///
/// Every change in membership dispatches a `SET memory_limit` job onto each
/// member's engine queue, so the new limit takes effect behind whatever the
/// queue is already running.
#[derive(Clone)]
pub struct MemoryBudget {
    inner: Arc<Mutex<BudgetInner>>,
}

impl MemoryBudget {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BudgetInner {
                total_bytes,
                members: BTreeMap::new(),
            })),
        }
    }

    /// Half of physical memory, as reported by `sysinfo`.
    pub fn from_system() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        // `sysinfo` reports memory in bytes.
        let physical = system.total_memory();
        let total = if physical == 0 {
            log::warn!("physical memory unknown; using fallback engine budget");
            FALLBACK_TOTAL_BYTES
        } else {
            (physical as f64 * SYSTEM_MEMORY_SHARE) as u64
        };
        Self::new(total)
    }

    /// Process-wide budget used by sessions that are not given one.
    pub fn shared() -> Self {
        SHARED.get_or_init(Self::from_system).clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BudgetInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn total_bytes(&self) -> u64 {
        self.lock().total_bytes
    }

    pub fn members(&self) -> usize {
        self.lock().members.len()
    }

    /// Current per-session share (the whole total when nobody is a member).
    pub fn share(&self) -> u64 {
        let inner = self.lock();
        share_of(&inner)
    }

    /// The share each member would get after one more session joins.
    pub fn share_with_one_more(&self) -> u64 {
        let inner = self.lock();
        inner.total_bytes / (inner.members.len() as u64 + 1)
    }

    /// Join the budget; every member's limit is recomputed.
    pub fn acquire(&self, session_id: u64, engine: EngineHandle) {
        let mut inner = self.lock();
        inner.members.insert(session_id, engine);
        rebalance(&inner);
    }

    /// Leave the budget; remaining members grow into the freed share.
    pub fn release(&self, session_id: u64) {
        let mut inner = self.lock();
        if inner.members.remove(&session_id).is_some() {
            rebalance(&inner);
        }
    }
}

fn share_of(inner: &BudgetInner) -> u64 {
    let members = inner.members.len().max(1) as u64;
    inner.total_bytes / members
}

fn rebalance(inner: &BudgetInner) {
    let share = share_of(inner);
    log::debug!(
        "memory budget: {} session(s), {share} bytes each",
        inner.members.len()
    );
    for (session_id, engine) in &inner.members {
        let session_id = *session_id;
        engine.dispatch(move |gateway| {
            if let Err(err) = gateway.set_memory_limit(share) {
                log::warn!("session {session_id}: failed to apply memory limit: {err}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::EngineGateway;

    fn engine() -> EngineHandle {
        let gateway = EngineGateway::open(&EngineConfig {
            threads: Some(1),
            ..EngineConfig::default()
        })
        .unwrap();
        EngineHandle::spawn(gateway).unwrap()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn shares_split_evenly_and_apply_to_engines() {
        let budget = MemoryBudget::new(1_000_000_000);
        let first = engine();
        let second = engine();

        assert_eq!(budget.share_with_one_more(), 1_000_000_000);
        budget.acquire(1, first.clone());
        assert_eq!(budget.share(), 1_000_000_000);
        assert_eq!(budget.share_with_one_more(), 500_000_000);
        budget.acquire(2, second.clone());
        assert_eq!(budget.share(), 500_000_000);

        let limit = second
            .submit(|e| e.query("SELECT current_setting('memory_limit')"))
            .await
            .unwrap();
        let text = limit.value(0, 0).and_then(|v| v.as_str()).unwrap().to_string();
        assert!(text.contains("MB") || text.contains("MiB"), "{text}");

        budget.release(1);
        assert_eq!(budget.members(), 1);
        assert_eq!(budget.share(), 1_000_000_000);
        budget.release(1);
        assert_eq!(budget.members(), 1);
    }
}
