//! Two-phase commit: prepared transactions across a crash

use crate::common::*;

fn prepare(env: &Environment, payload: &[u8], n: u8) -> TxnId {
    let tx = env.begin().unwrap();
    env.write(tx, RecordType::Update, payload).unwrap();
    env.prepare(tx, gid(n)).unwrap();
    tx
}

#[test]
fn prepared_transaction_is_returned_exactly_once() {
    let mut t = TestEnv::new();
    committed_txn(t.env(), &[b"committed"]);
    let tx = prepare(t.env(), b"in doubt", 1);

    t.reopen();
    let env = t.env();
    assert_eq!(env.recovery_state(), RecoveryState::PreparedPending);
    assert_eq!(env.recovery_report().unwrap().rolled_back, 0);

    let batch = env.txn_recover(10, RecoverPosition::First).unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].txn_id, tx);
    assert_eq!(batch[0].gid, gid(1));
    assert!(env.txn_recover(10, RecoverPosition::Next).unwrap().is_empty());

    env.resolve(tx, Resolution::Commit).unwrap();
    assert_eq!(env.recovery_state(), RecoveryState::Done);
    assert!(env.prepared().unwrap().is_empty());

    t.reopen();
    let env = t.env();
    assert_eq!(env.recovery_state(), RecoveryState::Done);
    assert!(env.prepared().unwrap().is_empty());
    assert_eq!(
        env.transactions().outcome(tx).map(|o| o.state),
        Some(TxnState::Committed)
    );
}

#[test]
fn unresolved_prepared_transaction_survives_repeated_crashes() {
    let mut t = TestEnv::new();
    let tx = prepare(t.env(), b"p", 3);

    for _ in 0..3 {
        t.reopen();
        let prepared = t.env().prepared().unwrap();
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].txn_id, tx);
        assert_eq!(prepared[0].gid, gid(3));
        assert!(t.seen(RecoveryOp::BackwardRoll).is_empty());
    }
}

#[test]
fn aborting_recovered_transaction_undoes_it() {
    let mut t = TestEnv::new();
    let tx = prepare(t.env(), b"undo me", 1);

    t.reopen();
    let env = t.env();
    env.abort(tx).unwrap();
    assert_eq!(t.seen(RecoveryOp::Abort), vec![b"undo me".to_vec()]);
    assert_eq!(env.recovery_state(), RecoveryState::Done);

    t.reopen();
    assert_eq!(
        t.env().transactions().outcome(tx).map(|o| o.state),
        Some(TxnState::Aborted)
    );
}

#[test]
fn commit_on_recovered_transaction_resolves_it() {
    let mut t = TestEnv::new();
    let a = prepare(t.env(), b"a", 1);
    let b = prepare(t.env(), b"b", 2);

    t.reopen();
    let env = t.env();
    env.commit(a).unwrap();
    assert_eq!(env.recovery_state(), RecoveryState::PreparedPending);
    env.commit(b).unwrap();
    assert_eq!(env.recovery_state(), RecoveryState::Done);

    match env.resolve(a, Resolution::Commit) {
        Err(Error::InvalidTransactionState { txn_id, .. }) => assert_eq!(txn_id, a),
        other => panic!("expected InvalidTransactionState, got {:?}", other),
    }
}

#[test]
fn txn_recover_pages_through_pending_list_oldest_first() {
    let mut t = TestEnv::new();
    let ids: Vec<TxnId> = (1..=5).map(|n| prepare(t.env(), &[n], n)).collect();

    t.reopen();
    let env = t.env();
    let first = env.txn_recover(2, RecoverPosition::First).unwrap();
    let second = env.txn_recover(2, RecoverPosition::Next).unwrap();
    let third = env.txn_recover(2, RecoverPosition::Next).unwrap();
    let done = env.txn_recover(2, RecoverPosition::Next).unwrap();

    let seen: Vec<TxnId> = first
        .iter()
        .chain(&second)
        .chain(&third)
        .map(|p| p.txn_id)
        .collect();
    assert_eq!(seen, ids);
    assert_eq!(third.len(), 1);
    assert!(done.is_empty());

    let restarted = env.txn_recover(10, RecoverPosition::First).unwrap();
    assert_eq!(restarted.len(), 5);
    assert!(matches!(
        env.txn_recover(0, RecoverPosition::First),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn global_id_stays_reserved_until_resolved() {
    let mut t = TestEnv::new();
    let tx = prepare(t.env(), b"p", 9);

    t.reopen();
    let env = t.env();
    let other = env.begin().unwrap();
    assert!(matches!(
        env.prepare(other, gid(9)),
        Err(Error::InvalidArgument(_))
    ));

    env.resolve(tx, Resolution::Abort).unwrap();
    env.prepare(other, gid(9)).unwrap();
}

#[test]
fn new_transactions_run_while_prepared_pending() {
    let mut t = TestEnv::new();
    let tx = prepare(t.env(), b"p", 1);

    t.reopen();
    let env = t.env();
    let fresh = committed_txn(env, &[b"fresh"]);
    assert_ne!(fresh, tx);
    assert_eq!(env.recovery_state(), RecoveryState::PreparedPending);
    assert_eq!(env.prepared().unwrap().len(), 1);
}
