//! End-to-end ledger behaviour against an on-disk database shared by
//! several threads.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use kindness_ledger::services::{spawn_achievement_listener, ApproveAll, Services, REASON_ALREADY_AWARDED};
use kindness_ledger::{Actor, Config, LedgerDb, LedgerError, Phase, TransactionKind};
use rusqlite::Connection;
use tempfile::TempDir;

const REFLECTION: &str = "Sharing lunch made both of us feel less alone today.";

struct Harness {
    services: Services,
    db: Arc<LedgerDb>,
    _dir: TempDir,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let config = Config {
        storage_dir: dir.path().to_path_buf(),
        lock_timeout_ms: 10_000,
        ..Config::default()
    };
    let db = Arc::new(LedgerDb::open_at(config.database_path(), config.lock_timeout()).unwrap());
    let services = Services::new(db.clone(), &config, Arc::new(ApproveAll)).unwrap();
    Harness { services, db, _dir: dir }
}

fn raw_conn(h: &Harness) -> Connection {
    Connection::open(h.db.path()).unwrap()
}

/// Eight callers race on one phase; exactly one is paid
#[test]
fn test_concurrent_duplicate_awards_pay_once() {
    let h = harness();
    h.services.awards.create_record("u1", Some("r1")).unwrap();

    let callers = 8;
    let barrier = Arc::new(Barrier::new(callers));
    let handles: Vec<_> = (0..callers)
        .map(|_| {
            let awards = h.services.awards.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                awards.award_preparation("r1", &Actor::owner("u1"), None)
            })
        })
        .collect();

    let outcomes: Vec<_> = handles.into_iter().map(|t| t.join().unwrap().unwrap()).collect();

    let winners: Vec<_> = outcomes.iter().filter(|o| o.awarded).collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].amount, 25);
    for loser in outcomes.iter().filter(|o| !o.awarded) {
        assert_eq!(loser.amount, 0);
        assert_eq!(loser.reason.as_deref(), Some(REASON_ALREADY_AWARDED));
    }

    let balance = h.services.ledger.get_balance("u1").unwrap();
    assert_eq!(balance.current_balance, 25);
    assert_eq!(balance.total_earned, 25);

    let history = h.services.ledger.history("u1").unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].kind, TransactionKind::PhaseBonus);
    assert_eq!(history[0].source_id, "r1");
    assert_eq!(h.services.awards.phase_events("r1").unwrap().len(), 1);
}

/// Owner and admin submit preparation for r1 at the same time
#[test]
fn test_two_callers_same_record() {
    let h = harness();
    h.services.awards.create_record("u1", Some("r1")).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = ["u1", "admin-1"]
        .into_iter()
        .map(|caller| {
            let awards = h.services.awards.clone();
            let barrier = barrier.clone();
            let actor = if caller == "u1" {
                Actor::owner(caller)
            } else {
                Actor::admin(caller)
            };
            thread::spawn(move || {
                barrier.wait();
                awards.award_preparation("r1", &actor, Some("lesson plan"))
            })
        })
        .collect();

    let mut outcomes: Vec<_> = handles.into_iter().map(|t| t.join().unwrap().unwrap()).collect();
    outcomes.sort_by_key(|o| !o.awarded);

    assert!(outcomes[0].awarded);
    assert_eq!(outcomes[0].new_balance, 25);
    assert!(!outcomes[1].awarded);
    assert_eq!(outcomes[1].new_balance, 25);

    let record = h.services.awards.get_record("r1").unwrap().unwrap();
    assert!(record.preparation.completed);
    assert_eq!(record.preparation.bonus_awarded, 25);
    assert_eq!(h.services.ledger.get_balance("u1").unwrap().current_balance, 25);
    assert_eq!(h.services.ledger.history("u1").unwrap().len(), 1);
}

#[test]
fn test_every_phase_order_sums_to_150() {
    let h = harness();
    let orders = [
        [Phase::Preparation, Phase::Reflection, Phase::Demonstration],
        [Phase::Preparation, Phase::Demonstration, Phase::Reflection],
        [Phase::Reflection, Phase::Preparation, Phase::Demonstration],
        [Phase::Reflection, Phase::Demonstration, Phase::Preparation],
        [Phase::Demonstration, Phase::Preparation, Phase::Reflection],
        [Phase::Demonstration, Phase::Reflection, Phase::Preparation],
    ];

    for (i, order) in orders.iter().enumerate() {
        let owner = format!("student-{}", i);
        let record = h.services.awards.create_record(&owner, None).unwrap();

        for phase in order {
            let outcome = match phase {
                Phase::Preparation => h
                    .services
                    .awards
                    .award_preparation(&record.id, &Actor::owner(owner.as_str()), None),
                Phase::Reflection => h
                    .services
                    .awards
                    .award_reflection(&record.id, &Actor::verifier("mentor"), REFLECTION),
                Phase::Demonstration => h.services.awards.award_demonstration(
                    &record.id,
                    &Actor::owner(owner.as_str()),
                    "photo://kindness/1",
                    None,
                ),
            }
            .unwrap();
            assert!(outcome.awarded);
        }

        let record = h.services.awards.get_record(&record.id).unwrap().unwrap();
        assert!(record.is_complete());
        assert_eq!(record.bonus_total, 150);
        assert_eq!(h.services.ledger.get_balance(&owner).unwrap().total_earned, 150);
    }
}

#[test]
fn test_rejected_submissions_change_nothing() {
    let h = harness();
    h.services.awards.create_record("u1", Some("r1")).unwrap();

    let short = h
        .services
        .awards
        .award_reflection("r1", &Actor::verifier("mentor"), "   too short      ")
        .unwrap_err();
    assert!(matches!(short, LedgerError::Validation(_)));

    let self_approved = h
        .services
        .awards
        .award_reflection("r1", &Actor::owner("u1"), REFLECTION)
        .unwrap_err();
    assert!(matches!(self_approved, LedgerError::Authorization(_)));

    let no_role = h
        .services
        .awards
        .award_reflection("r1", &Actor::owner("classmate"), REFLECTION)
        .unwrap_err();
    assert!(matches!(no_role, LedgerError::Authorization(_)));

    let no_evidence = h
        .services
        .awards
        .award_demonstration("r1", &Actor::owner("u1"), "", None)
        .unwrap_err();
    assert!(matches!(no_evidence, LedgerError::Validation(_)));

    let record = h.services.awards.get_record("r1").unwrap().unwrap();
    assert_eq!(record.bonus_total, 0);
    assert!(!record.reflection.completed);
    assert!(!record.demonstration.completed);
    assert!(h.services.ledger.history("u1").unwrap().is_empty());
    assert!(h.services.awards.phase_events("r1").unwrap().is_empty());
    assert_eq!(h.services.ledger.get_balance("u1").unwrap().current_balance, 0);
}

/// A failing final insert undoes every earlier write of the award
#[test]
fn test_storage_failure_mid_award_rolls_back() {
    let h = harness();
    h.services.awards.create_record("u1", Some("r1")).unwrap();

    // Fail the last write of the award unit
    raw_conn(&h)
        .execute_batch(
            "CREATE TRIGGER fail_phase_events BEFORE INSERT ON phase_events
             BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
        )
        .unwrap();

    let err = h
        .services
        .awards
        .award_preparation("r1", &Actor::owner("u1"), None)
        .unwrap_err();
    assert!(matches!(err, LedgerError::Persistence(_)));
    assert!(!err.is_retryable());

    let record = h.services.awards.get_record("r1").unwrap().unwrap();
    assert!(!record.preparation.completed);
    assert_eq!(record.bonus_total, 0);
    assert!(h.services.ledger.history("u1").unwrap().is_empty());
    assert_eq!(h.services.ledger.stats().unwrap().user_count, 0);

    raw_conn(&h)
        .execute_batch("DROP TRIGGER fail_phase_events;")
        .unwrap();

    let retry = h
        .services
        .awards
        .award_preparation("r1", &Actor::owner("u1"), None)
        .unwrap();
    assert!(retry.awarded);
    assert_eq!(retry.new_balance, 25);
}

#[test]
fn test_history_cannot_be_rewritten() {
    let h = harness();
    h.services.awards.create_record("u1", Some("r1")).unwrap();
    h.services
        .awards
        .award_preparation("r1", &Actor::owner("u1"), None)
        .unwrap();

    let conn = raw_conn(&h);
    assert!(conn.execute("UPDATE transactions SET amount = 1000", []).is_err());
    assert!(conn.execute("DELETE FROM transactions", []).is_err());
    assert!(conn.execute("DELETE FROM phase_events", []).is_err());
    assert!(conn.execute("DELETE FROM balances", []).is_err());
    assert!(conn
        .execute("UPDATE phase_records SET preparation_completed = 0", [])
        .is_err());

    assert_eq!(h.services.ledger.get_balance("u1").unwrap().current_balance, 25);
    assert!(h.services.ledger.reconcile("u1").unwrap().consistent);
}

#[test]
fn test_replay_matches_cached_balances() {
    let h = harness();
    let awards = &h.services.awards;
    let ledger = &h.services.ledger;

    for (user, record) in [("u1", "r1"), ("u2", "r2")] {
        awards.create_record(user, Some(record)).unwrap();
        awards.award_preparation(record, &Actor::owner(user), None).unwrap();
        awards
            .award_reflection(record, &Actor::verifier("mentor"), REFLECTION)
            .unwrap();
    }
    awards
        .award_demonstration("r1", &Actor::owner("u1"), "video://42", None)
        .unwrap();
    h.services.achievements.evaluate("u1").unwrap();
    h.services.achievements.evaluate("u2").unwrap();

    ledger
        .record_adjustment(kindness_ledger::services::NewAdjustment {
            user_id: "u2".into(),
            kind: TransactionKind::RedemptionDebit,
            amount: -40,
            source_id: "sticker-pack".into(),
            source_type: "redemption".into(),
            actor_id: "u2".into(),
            idempotency_key: Some("redeem:1".into()),
            note: None,
        })
        .unwrap();

    let overdraw = ledger.record_adjustment(kindness_ledger::services::NewAdjustment {
        user_id: "u2".into(),
        kind: TransactionKind::RedemptionDebit,
        amount: -10_000,
        source_id: "bike".into(),
        source_type: "redemption".into(),
        actor_id: "u2".into(),
        idempotency_key: Some("redeem:2".into()),
        note: None,
    });
    assert!(matches!(overdraw, Err(LedgerError::InsufficientBalance { .. })));

    // u1: 150 in phases + first_steps 10 + kindness_in_action 20 + full_circle 50
    assert_eq!(ledger.get_balance("u1").unwrap().current_balance, 230);
    // u2: 75 in phases + first_steps 10 - 40
    assert_eq!(ledger.get_balance("u2").unwrap().current_balance, 45);

    let reports = ledger.reconcile_all().unwrap();
    assert_eq!(reports.len(), 2);
    for report in reports {
        assert!(report.consistent, "{:?}", report);
        assert!(report.broken_links.is_empty());
    }

    let replay = ledger.reconstruct_balance("u2").unwrap();
    assert_eq!(replay.balance.current, 45);
    assert_eq!(replay.balance.spent, 40);
}

/// A caller key in the phase namespace cannot pre-empt the bonus
#[test]
fn test_caller_cannot_claim_phase_key() {
    let h = harness();
    h.services.awards.create_record("u1", Some("r1")).unwrap();

    let squat = h.services.ledger.record_adjustment(kindness_ledger::services::NewAdjustment {
        user_id: "u2".into(),
        kind: TransactionKind::ChallengeReward,
        amount: 5,
        source_id: "c1".into(),
        source_type: "challenge".into(),
        actor_id: "admin".into(),
        idempotency_key: Some("phase:r1:preparation".into()),
        note: None,
    });
    assert!(matches!(squat, Err(LedgerError::InvalidInput(_))));
    assert!(h.services.ledger.history("u2").unwrap().is_empty());

    let outcome = h
        .services
        .awards
        .award_preparation("r1", &Actor::owner("u1"), None)
        .unwrap();
    assert!(outcome.awarded);
    assert_eq!(h.services.ledger.get_balance("u1").unwrap().current_balance, 25);
}

#[test]
fn test_concurrent_evaluations_unlock_once() {
    let h = harness();
    h.services.awards.create_record("u1", Some("r1")).unwrap();
    h.services
        .awards
        .award_preparation("r1", &Actor::owner("u1"), None)
        .unwrap();

    let workers = 6;
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let evaluator = h.services.achievements.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                evaluator.evaluate("u1")
            })
        })
        .collect();

    let unlocked: usize = handles
        .into_iter()
        .map(|t| t.join().unwrap().unwrap())
        .map(|results| results.iter().filter(|r| r.unlocked).count())
        .sum();
    assert_eq!(unlocked, 1);

    let unlocks = h.services.ledger.unlocks("u1").unwrap();
    assert_eq!(unlocks.len(), 1);
    assert_eq!(unlocks[0].achievement_id, "first_steps");
    assert_eq!(h.services.ledger.get_balance("u1").unwrap().current_balance, 35);

    let rewards = h
        .services
        .ledger
        .history("u1")
        .unwrap()
        .into_iter()
        .filter(|t| t.kind == TransactionKind::AchievementUnlock)
        .count();
    assert_eq!(rewards, 1);
}

/// Fire-and-forget trigger path through the event bus
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_listener_unlocks_after_award() {
    let h = harness();
    let listener = spawn_achievement_listener(h.services.events.clone(), h.services.achievements.clone());

    h.services.awards.create_record("u1", Some("r1")).unwrap();
    h.services
        .awards
        .award_preparation("r1", &Actor::owner("u1"), None)
        .unwrap();

    let mut unlocked = false;
    for _ in 0..100 {
        if !h.services.ledger.unlocks("u1").unwrap().is_empty() {
            unlocked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(unlocked, "listener never unlocked first_steps");
    assert_eq!(h.services.ledger.get_balance("u1").unwrap().current_balance, 35);

    listener.abort();
}
