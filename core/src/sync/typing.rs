/// Per-peer typing expiry timers
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// At most one live timer per peer. Arming a peer aborts its previous
/// timer, and every expiry carries the generation it was armed with so a
/// late firing can be recognised and ignored.
#[derive(Default)]
pub struct TypingTimers {
    timers: HashMap<String, Timer>,
    next_generation: u64,
}

impl TypingTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the timer for `peer_id`; `on_expire` runs after `after`
    /// with the generation returned here.
    pub fn arm<F>(&mut self, peer_id: &str, after: Duration, on_expire: F) -> u64
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.cancel(peer_id);
        self.next_generation += 1;
        let generation = self.next_generation;
        let handle = tokio::spawn(async move {
            sleep(after).await;
            on_expire(generation);
        });
        self.timers
            .insert(peer_id.to_string(), Timer { generation, handle });
        generation
    }

    pub fn cancel(&mut self, peer_id: &str) {
        if let Some(timer) = self.timers.remove(peer_id) {
            timer.handle.abort();
        }
    }

    /// Consume an expiry. True only if `generation` is the live timer.
    pub fn expire(&mut self, peer_id: &str, generation: u64) -> bool {
        match self.timers.get(peer_id) {
            Some(timer) if timer.generation == generation => {
                self.timers.remove(peer_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self, peer_id: &str) -> bool {
        self.timers.contains_key(peer_id)
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
    }
}

impl Drop for TypingTimers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
