//! Crash recovery: replay window, damaged logs, checkpoints

use crate::common::*;
use stratalog_durability::format::CHECKPOINT_FILE_NAME;

#[test]
fn transaction_after_checkpoint_is_replayed_as_committed() {
    let mut t = TestEnv::new();
    let ckp = t.env().checkpoint().unwrap();
    assert_eq!(ckp.lsn, Lsn::new(1, 0));

    let env = t.env();
    let tx = env.begin().unwrap();
    assert_eq!(env.transactions().get(tx).unwrap().first_lsn, Lsn::new(1, 0));
    assert_eq!(
        env.write(tx, RecordType::Update, &[7u8; 16]).unwrap(),
        Lsn::new(1, 40)
    );
    assert_eq!(env.commit(tx).unwrap(), Lsn::new(1, 88));

    t.reopen();
    let env = t.env();
    assert_eq!(env.recovery_state(), RecoveryState::Done);
    assert!(env.prepared().unwrap().is_empty());
    assert_eq!(
        env.transactions().outcome(tx).map(|o| o.state),
        Some(TxnState::Committed)
    );
    assert_eq!(t.seen(RecoveryOp::ForwardRoll), vec![vec![7u8; 16]]);

    match env.commit(tx) {
        Err(Error::InvalidTransactionState { actual, .. }) => assert_eq!(actual, "COMMITTED"),
        other => panic!("expected InvalidTransactionState, got {:?}", other),
    }
}

#[test]
fn committed_transactions_replay_in_log_order() {
    let mut t = TestEnv::new();
    for i in 0..10u8 {
        committed_txn(t.env(), &[&[i], &[i, i]]);
    }

    t.reopen();
    let env = t.env();
    let report = env.recovery_report().unwrap();
    assert_eq!(env.recovery_state(), RecoveryState::Done);
    assert_eq!(report.committed, 10);
    assert_eq!(report.rolled_back, 0);
    assert_eq!(report.records_replayed, 20);
    assert_eq!(report.records_scanned, 40);

    let expected: Vec<Vec<u8>> = (0..10u8).flat_map(|i| vec![vec![i], vec![i, i]]).collect();
    assert_eq!(t.seen(RecoveryOp::ForwardRoll), expected);
}

#[test]
fn unresolved_transaction_is_rolled_back_newest_first() {
    let mut t = TestEnv::new();
    let env = t.env();
    committed_txn(env, &[b"kept"]);
    let loser = env.begin().unwrap();
    env.write(loser, RecordType::Update, b"first").unwrap();
    env.write(loser, RecordType::Update, b"second").unwrap();
    env.flush(env.log().end_lsn()).unwrap();

    t.reopen();
    let env = t.env();
    assert_eq!(env.recovery_report().unwrap().rolled_back, 1);
    assert_eq!(
        t.seen(RecoveryOp::BackwardRoll),
        vec![b"second".to_vec(), b"first".to_vec()]
    );
    assert_eq!(
        env.transactions().outcome(loser).map(|o| o.state),
        Some(TxnState::Aborted)
    );

    // The rollback wrote an ABORT, so the next recovery has nothing to undo
    t.reopen();
    assert_eq!(t.env().recovery_report().unwrap().rolled_back, 0);
    assert!(t.seen(RecoveryOp::BackwardRoll).is_empty());
}

#[test]
fn damaged_tail_after_checkpoint_is_truncated() {
    let mut t = TestEnv::new();
    let env = t.env();
    committed_txn(env, &[b"before"]);
    env.checkpoint().unwrap();
    let tx = env.begin().unwrap();
    env.write(tx, RecordType::Update, b"after").unwrap();
    let commit = env.commit(tx).unwrap();

    t.shutdown();
    // Inside the commit record's timestamp payload
    flip_byte(&t.log_dir(), commit, 26);

    t.reopen();
    let env = t.env();
    let report = env.recovery_report().unwrap();
    assert!(report.bytes_truncated > 0);
    assert_eq!(report.rolled_back, 1);
    assert_eq!(t.seen(RecoveryOp::BackwardRoll), vec![b"after".to_vec()]);
    assert_eq!(
        env.transactions().outcome(tx).map(|o| o.state),
        Some(TxnState::Aborted)
    );

    committed_txn(env, &[b"next"]);
    t.reopen();
    let env = t.env();
    assert_eq!(env.recovery_state(), RecoveryState::Done);
    assert_eq!(env.recovery_report().unwrap().bytes_truncated, 0);
}

#[test]
fn damage_before_checkpoint_fails_recovery() {
    let mut t = TestEnv::new();
    let env = t.env();
    committed_txn(env, &[b"one"]);
    let update = all_records(env)[1].lsn;
    committed_txn(env, &[b"two"]);
    env.checkpoint().unwrap();

    t.shutdown();
    flip_byte(&t.log_dir(), update, 26);

    match t.try_reopen() {
        Err(Error::RecoveryFailed(msg)) => assert!(msg.contains("before checkpoint"), "{}", msg),
        other => panic!("expected RecoveryFailed, got {:?}", other),
    }
}

#[test]
fn damaged_first_segment_header_fails_recovery_and_keeps_log() {
    let mut t = TestEnv::new();
    let env = t.env();
    for payload in [b"one" as &[u8], b"two", b"three"] {
        committed_txn(env, &[payload]);
    }
    let ckp = env.checkpoint().unwrap();
    committed_txn(env, &[b"four"]);
    let env_id = env.info().env_id;

    t.shutdown();
    let segment = segment_file(&t.log_dir(), 1);
    let before = std::fs::read(&segment).unwrap();
    let mut damaged = before.clone();
    damaged[..4].copy_from_slice(b"XXXX");
    std::fs::write(&segment, &damaged).unwrap();

    match t.try_reopen() {
        Err(Error::RecoveryFailed(msg)) => {
            assert!(msg.contains("before checkpoint"), "{}", msg);
        }
        other => panic!("expected RecoveryFailed, got {:?}", other),
    }
    // Nothing was truncated and the id was not replaced
    assert_eq!(std::fs::read(&segment).unwrap(), damaged);

    std::fs::write(&segment, &before).unwrap();
    t.reopen();
    let env = t.env();
    assert_eq!(env.info().env_id, env_id);
    assert_eq!(env.recovery_report().unwrap().checkpoint_lsn, Some(ckp.lsn));
    assert_eq!(all_records(env).len(), 12);
}

#[test]
fn invalid_checkpoint_file_falls_back_to_log_start() {
    let mut t = TestEnv::new();
    committed_txn(t.env(), &[b"a"]);
    t.env().checkpoint().unwrap();
    committed_txn(t.env(), &[b"b"]);

    t.shutdown();
    std::fs::write(t.log_dir().join(CHECKPOINT_FILE_NAME), b"not a checkpoint").unwrap();

    t.reopen();
    let report = t.env().recovery_report().unwrap();
    assert_eq!(report.checkpoint_lsn, None);
    assert_eq!(report.committed, 2);
}

#[test]
fn recovery_spans_rotated_segments() {
    let mut t = TestEnv::new();
    let payload = vec![0xAB; 4096];
    for _ in 0..40 {
        committed_txn(t.env(), &[&payload]);
    }
    assert!(t.env().log().segment_numbers().len() > 1);

    t.reopen();
    let env = t.env();
    assert_eq!(env.recovery_report().unwrap().committed, 40);
    assert_eq!(t.seen(RecoveryOp::ForwardRoll).len(), 40);
}

#[test]
fn transaction_ids_continue_after_reopen() {
    let mut t = TestEnv::new();
    let last = committed_txn(t.env(), &[b"x"]);
    t.env().checkpoint().unwrap();

    t.reopen();
    let next = t.env().begin().unwrap();
    assert!(next > last);
}

#[test]
fn failing_handler_aborts_open() {
    let mut t = TestEnv::new();
    committed_txn(t.env(), &[b"poison"]);
    t.shutdown();

    let result = Environment::builder()
        .dir(t.dir.path())
        .config(t.config.clone())
        .handler(
            RecordType::Update,
            std::sync::Arc::new(|_: &LogRecord, _: RecoveryOp| -> Result<DispatchOutcome> {
                Ok(DispatchOutcome::Error("cannot apply".into()))
            }),
        )
        .open();
    assert!(matches!(result, Err(Error::RecoveryFailed(_))));
}
