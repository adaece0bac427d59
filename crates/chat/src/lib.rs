//! Debounces per-chat-dataset cognify calls so a burst of messages
//! triggers one projection, not one per message (spec §4.G).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use coachkb_engine::UserContext;
use coachkb_storage::alias_for;
use tokio::time::Instant;
use tracing::{debug, warn};

/// The knowledge base facade's single entry point for "reindex this
/// dataset now" (spec §9 Design Notes: capability trait, not a
/// back-pointer into the facade).
#[async_trait]
pub trait DatasetProcessor: Send + Sync {
    async fn process_dataset(&self, alias: &str, user: Option<&UserContext>) -> anyhow::Result<()>;
}

#[derive(Default)]
struct ChatState {
    pending: u64,
    last_project_ts: Option<Instant>,
    task_running: bool,
}

pub struct ChatProjectionScheduler<P: DatasetProcessor + 'static> {
    processor: Arc<P>,
    system_user: Option<UserContext>,
    debounce: Duration,
    state: Mutex<HashMap<String, ChatState>>,
}

impl<P: DatasetProcessor + 'static> ChatProjectionScheduler<P> {
    pub fn new(processor: Arc<P>, system_user: Option<UserContext>, debounce: Duration) -> Arc<Self> {
        Arc::new(Self { processor, system_user, debounce, state: Mutex::new(HashMap::new()) })
    }

    /// Increments the dirty counter for `alias` and returns the new count.
    pub fn queue(&self, alias: &str) -> u64 {
        let canonical = alias_for(alias);
        let mut state = self.state.lock().unwrap();
        let entry = state.entry(canonical).or_default();
        entry.pending += 1;
        entry.pending
    }

    fn projection_delay(&self, state: &ChatState) -> Duration {
        if self.debounce.is_zero() {
            return Duration::ZERO;
        }
        match state.last_project_ts {
            None => Duration::ZERO,
            Some(last) => {
                let target = last + self.debounce;
                let now = Instant::now();
                if target > now {
                    target - now
                } else {
                    Duration::ZERO
                }
            }
        }
    }

    /// Starts the debounce timer for `alias` if there is pending work and
    /// no task already in flight for it. Single-flight per alias.
    pub fn ensure_task(self: &Arc<Self>, alias: &str) {
        let canonical = alias_for(alias);
        let delay = {
            let mut state = self.state.lock().unwrap();
            let entry = state.entry(canonical.clone()).or_default();
            if entry.pending == 0 || entry.task_running {
                return;
            }
            entry.task_running = true;
            self.projection_delay(entry)
        };

        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run(canonical, delay).await;
        });
    }

    async fn run(self: Arc<Self>, alias: String, delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let queued = {
            let state = self.state.lock().unwrap();
            state.get(&alias).map(|s| s.pending).unwrap_or(0)
        };
        if queued == 0 {
            self.state.lock().unwrap().entry(alias).or_default().task_running = false;
            return;
        }

        debug!(dataset = %alias, queued, "kb_chat_project start");
        let started = Instant::now();
        let result = self.processor.process_dataset(&alias, self.system_user.as_ref()).await;
        match result {
            Ok(()) => {
                let took_ms = started.elapsed().as_millis();
                debug!(dataset = %alias, queued, took_ms, "kb_chat_project end");
                let mut state = self.state.lock().unwrap();
                let entry = state.entry(alias).or_default();
                entry.pending = 0;
                entry.last_project_ts = Some(Instant::now());
                entry.task_running = false;
            }
            Err(err) => {
                warn!(dataset = %alias, queued, detail = %err, "kb_chat_project failed");
                {
                    let mut state = self.state.lock().unwrap();
                    let entry = state.entry(alias.clone()).or_default();
                    entry.last_project_ts = Some(Instant::now());
                    entry.task_running = false;
                }
                self.ensure_task(&alias);
            }
        }
    }

    pub fn pending(&self, alias: &str) -> u64 {
        self.state.lock().unwrap().get(&alias_for(alias)).map(|s| s.pending).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProcessor {
        calls: AtomicUsize,
        fail_first: AtomicUsize,
    }

    #[async_trait]
    impl DatasetProcessor for CountingProcessor {
        async fn process_dataset(&self, _alias: &str, _user: Option<&UserContext>) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("transient failure");
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queue_then_ensure_task_runs_once_for_a_burst() {
        let processor = Arc::new(CountingProcessor { calls: AtomicUsize::new(0), fail_first: AtomicUsize::new(0) });
        let scheduler = ChatProjectionScheduler::new(processor.clone(), None, Duration::from_millis(0));

        scheduler.queue("kb_chat_1");
        scheduler.queue("kb_chat_1");
        scheduler.queue("kb_chat_1");
        scheduler.ensure_task("kb_chat_1");
        scheduler.ensure_task("kb_chat_1");

        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;

        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending("kb_chat_1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_reschedules_and_eventually_succeeds() {
        let processor = Arc::new(CountingProcessor { calls: AtomicUsize::new(0), fail_first: AtomicUsize::new(1) });
        let scheduler = ChatProjectionScheduler::new(processor.clone(), None, Duration::from_millis(0));

        scheduler.queue("kb_chat_2");
        scheduler.ensure_task("kb_chat_2");

        for _ in 0..5 {
            tokio::time::advance(Duration::from_millis(10)).await;
            tokio::task::yield_now().await;
        }

        assert!(processor.calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(scheduler.pending("kb_chat_2"), 0);
    }
}
