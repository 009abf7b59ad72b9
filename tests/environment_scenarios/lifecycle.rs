//! Open/close, checkpoints, archival and concurrent use

use std::sync::Arc;
use std::thread;

use crate::common::*;

#[test]
fn archive_waits_for_pending_prepared_transaction() {
    let mut t = TestEnv::new();
    let env = t.env();
    assert!(env.archivable_segments().unwrap().is_empty());

    let tx = env.begin().unwrap();
    env.write(tx, RecordType::Update, b"held").unwrap();
    env.prepare(tx, gid(1)).unwrap();
    let payload = vec![0x5A; 8 * 1024];
    for _ in 0..20 {
        committed_txn(env, &[&payload]);
    }
    assert!(env.log().segment_numbers().len() >= 3);

    let ckp = env.checkpoint().unwrap();
    assert_eq!(ckp.lsn, Lsn::new(1, 0));
    assert!(env.archivable_segments().unwrap().is_empty());

    t.reopen();
    let env = t.env();
    assert_eq!(env.recovery_state(), RecoveryState::PreparedPending);
    env.checkpoint().unwrap();
    assert!(env.archive().unwrap().is_empty());

    env.resolve(tx, Resolution::Commit).unwrap();
    env.checkpoint().unwrap();
    let removed = env.archive().unwrap();
    assert!(!removed.is_empty());
    assert!(removed.iter().all(|p| !p.exists()));
    assert!(!segment_file(&t.log_dir(), 1).exists());

    t.reopen();
    let env = t.env();
    assert_eq!(env.recovery_state(), RecoveryState::Done);
    assert!(env.log().first_lsn().file > 1);
}

#[test]
fn live_transaction_bounds_archive() {
    let t = TestEnv::new();
    let env = t.env();
    let payload = vec![1u8; 8 * 1024];
    for _ in 0..10 {
        committed_txn(env, &[&payload]);
    }
    let live = env.begin().unwrap();
    let live_first = env.transactions().get(live).unwrap().first_lsn;
    for _ in 0..10 {
        committed_txn(env, &[&payload]);
    }

    env.checkpoint().unwrap();
    let archivable = env.archivable_segments().unwrap();
    let keep = segment_file(&t.log_dir(), live_first.file);
    assert!(!archivable.contains(&keep));
    assert_eq!(archivable.len(), live_first.file as usize - 1);
}

#[test]
fn live_abort_undoes_through_handler() {
    let t = TestEnv::new();
    let env = t.env();
    let tx = env.begin().unwrap();
    env.write(tx, RecordType::Update, b"a").unwrap();
    env.write(tx, RecordType::Update, b"b").unwrap();
    env.abort(tx).unwrap();

    assert_eq!(t.seen(RecoveryOp::Abort), vec![b"b".to_vec(), b"a".to_vec()]);
    assert_eq!(
        env.transactions().outcome(tx).map(|o| o.state),
        Some(TxnState::Aborted)
    );
}

#[test]
fn unregistered_handler_is_no_longer_dispatched() {
    let t = TestEnv::new();
    let env = t.env();
    assert!(env.dispatch().unregister(RecordType::Update));
    assert!(!env.dispatch().unregister(RecordType::Update));

    let tx = env.begin().unwrap();
    env.write(tx, RecordType::Update, b"unhandled").unwrap();
    env.abort(tx).unwrap();
    assert!(t.seen(RecoveryOp::Abort).is_empty());
}

#[test]
fn closed_environment_rejects_everything() {
    let t = TestEnv::new();
    let env = t.env();
    let tx = env.begin().unwrap();
    env.close().unwrap();

    assert!(matches!(env.begin(), Err(Error::InvalidState(_))));
    assert!(matches!(
        env.write(tx, RecordType::Update, b"x"),
        Err(Error::InvalidState(_))
    ));
    assert!(matches!(env.commit(tx), Err(Error::InvalidState(_))));
    assert!(matches!(env.checkpoint(), Err(Error::InvalidState(_))));
    assert!(matches!(env.prepared(), Err(Error::InvalidState(_))));
}

#[test]
fn directory_lock_is_released_on_drop() {
    let mut t = TestEnv::new();
    let second = Environment::builder()
        .dir(t.dir.path())
        .config(t.config.clone())
        .open();
    assert!(matches!(second, Err(Error::InvalidState(_))));

    t.shutdown();
    let third = Environment::builder()
        .dir(t.dir.path())
        .config(t.config.clone())
        .open();
    assert!(third.is_ok());
}

#[test]
fn checkpoint_forgets_old_outcomes() {
    let t = TestEnv::new();
    let env = t.env();
    let tx = committed_txn(env, &[b"x"]);
    assert!(env.transactions().outcome(tx).is_some());

    env.checkpoint().unwrap();
    assert!(env.transactions().outcome(tx).is_none());
    match env.commit(tx) {
        Err(Error::InvalidTransactionState { actual, .. }) => assert_eq!(actual, "UNKNOWN"),
        other => panic!("expected InvalidTransactionState, got {:?}", other),
    }
}

#[test]
fn concurrent_transactions_all_recover() {
    let mut t = TestEnv::new();
    let env = Arc::new(t.env.take().unwrap());

    let handles: Vec<_> = (0..8u8)
        .map(|thread_id| {
            let env = Arc::clone(&env);
            thread::spawn(move || {
                for i in 0..25u8 {
                    committed_txn(&env, &[&[thread_id, i]]);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = env.stats();
    assert_eq!(stats.txn.committed, 200);
    assert_eq!(stats.txn.active, 0);
    assert_eq!(stats.log.appends, 600);
    assert!(stats.log.sync_calls <= stats.log.flush_requests + stats.log.rotations);
    drop(env);

    t.reopen();
    let report = t.env().recovery_report().unwrap();
    assert_eq!(report.committed, 200);
    assert_eq!(t.seen(RecoveryOp::ForwardRoll).len(), 200);
}

#[test]
fn stats_reflect_recovery_and_checkpoint() {
    let mut t = TestEnv::new();
    committed_txn(t.env(), &[b"x"]);
    t.reopen();

    let env = t.env();
    let stats = env.stats();
    assert_eq!(stats.recovery_state, RecoveryState::Done);
    assert_eq!(stats.last_checkpoint, None);
    assert!(stats.shipper.is_none());

    let ckp = env.checkpoint().unwrap();
    assert_eq!(env.stats().last_checkpoint, Some(ckp.lsn));
}
