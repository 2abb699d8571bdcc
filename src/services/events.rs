//! Event bus for committed ledger changes
//!
//! Events are emitted only after the owning write transaction commits.
//! Useful for:
//! - Audit logging
//! - Triggering achievement evaluation
//! - Real-time balance notifications

use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use crate::db::models::Phase;

/// Ledger events emitted by services
#[derive(Debug, Clone)]
pub enum LedgerEvent {
    PhaseAwarded {
        record_id: String,
        phase: Phase,
        user_id: String,
        actor_id: String,
        amount: i64,
        new_balance: i64,
    },
    PhaseAlreadyAwarded {
        record_id: String,
        phase: Phase,
        actor_id: String,
    },
    AchievementUnlocked {
        user_id: String,
        achievement_id: String,
        reward: i64,
        new_balance: i64,
    },
    BalanceAdjusted {
        user_id: String,
        transaction_id: String,
        amount: i64,
        new_balance: i64,
    },
}

impl LedgerEvent {
    /// User whose history changed, if any
    pub fn credited_user(&self) -> Option<&str> {
        match self {
            LedgerEvent::PhaseAwarded { user_id, .. }
            | LedgerEvent::AchievementUnlocked { user_id, .. }
            | LedgerEvent::BalanceAdjusted { user_id, .. } => Some(user_id.as_str()),
            LedgerEvent::PhaseAlreadyAwarded { .. } => None,
        }
    }
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &LedgerEvent);
}

/// Event bus for broadcasting ledger events
pub struct EventBus {
    sender: broadcast::Sender<LedgerEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: LedgerEvent) {
        trace!(event = ?event, "Emitting ledger event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logging event listener for audit trails
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &LedgerEvent) {
        match event {
            LedgerEvent::PhaseAwarded {
                record_id,
                phase,
                user_id,
                amount,
                ..
            } => {
                info!(record_id = %record_id, phase = %phase, user_id = %user_id, amount, "Phase bonus paid");
            }
            LedgerEvent::AchievementUnlocked {
                user_id,
                achievement_id,
                reward,
                ..
            } => {
                info!(user_id = %user_id, achievement = %achievement_id, reward, "Achievement unlocked");
            }
            LedgerEvent::PhaseAlreadyAwarded { record_id, phase, .. } => {
                debug!(record_id = %record_id, phase = %phase, "Repeat phase submission");
            }
            _ => {
                trace!(event = ?event, "Ledger event");
            }
        }
    }
}

/// Run `listener` on every event until the bus is dropped.
///
/// Events already queued when the last sender goes away are still
/// delivered before the task ends.
pub fn spawn_listener<L>(event_bus: &EventBus, listener: L) -> tokio::task::JoinHandle<()>
where
    L: EventListener + 'static,
{
    let mut receiver = event_bus.subscribe();

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: &EventBus) -> tokio::task::JoinHandle<()> {
    spawn_listener(event_bus, LoggingEventListener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_event_bus_emit_receive() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.emit(LedgerEvent::PhaseAwarded {
            record_id: "r1".into(),
            phase: Phase::Preparation,
            user_id: "u1".into(),
            actor_id: "u1".into(),
            amount: 25,
            new_balance: 25,
        });

        let event = timeout(Duration::from_millis(100), receiver.recv())
            .await
            .expect("timeout")
            .expect("receive error");

        match event {
            LedgerEvent::PhaseAwarded { record_id, amount, .. } => {
                assert_eq!(record_id, "r1");
                assert_eq!(amount, 25);
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_event_bus_no_subscribers() {
        let bus = EventBus::new();
        bus.emit(LedgerEvent::PhaseAlreadyAwarded {
            record_id: "r1".into(),
            phase: Phase::Reflection,
            actor_id: "v1".into(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    struct CountingListener(Arc<AtomicUsize>);

    impl EventListener for CountingListener {
        fn on_event(&self, _event: &LedgerEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn unlock_event(user_id: &str) -> LedgerEvent {
        LedgerEvent::AchievementUnlocked {
            user_id: user_id.into(),
            achievement_id: "first_steps".into(),
            reward: 10,
            new_balance: 10,
        }
    }

    #[tokio::test]
    async fn test_listener_drains_queue_before_close() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let handle = spawn_listener(&bus, CountingListener(seen.clone()));

        bus.emit(unlock_event("u1"));
        bus.emit(unlock_event("u2"));
        bus.emit(LedgerEvent::PhaseAlreadyAwarded {
            record_id: "r1".into(),
            phase: Phase::Preparation,
            actor_id: "u1".into(),
        });
        drop(bus);

        timeout(Duration::from_secs(1), handle)
            .await
            .expect("listener did not stop")
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_logging_listener_consumes_events() {
        let bus = EventBus::new();
        let handle = spawn_logging_listener(&bus);
        assert_eq!(bus.subscriber_count(), 1);

        bus.emit(unlock_event("u1"));
        drop(bus);

        timeout(Duration::from_secs(1), handle)
            .await
            .expect("logging listener did not stop")
            .unwrap();
    }

    #[test]
    fn test_credited_user() {
        let repeat = LedgerEvent::PhaseAlreadyAwarded {
            record_id: "r1".into(),
            phase: Phase::Reflection,
            actor_id: "v1".into(),
        };
        assert_eq!(repeat.credited_user(), None);

        let unlock = LedgerEvent::AchievementUnlocked {
            user_id: "u1".into(),
            achievement_id: "first_steps".into(),
            reward: 10,
            new_balance: 35,
        };
        assert_eq!(unlock.credited_user(), Some("u1"));
    }
}
