//! Log shipping between two environments

use std::sync::Arc;

use crate::common::*;
use parking_lot::Mutex;
use stratalog::{
    EnvInfo, ReceiveOutcome, ReplicationControl, ReplicationTransport, SendFlags, SiteId,
};

const PRIMARY: SiteId = 1;
const REPLICA: SiteId = 2;

/// Everything handed to the transport: (control, record, flags, site).
type Wire = Arc<Mutex<Vec<(Vec<u8>, Vec<u8>, SendFlags, SiteId)>>>;

fn primary_config() -> EnvConfig {
    let mut config = EnvConfig::for_testing();
    config.replication.site_id = PRIMARY;
    config.replication.sites = vec![REPLICA];
    config
}

fn replica_config() -> EnvConfig {
    let mut config = EnvConfig::for_testing();
    config.replication.site_id = REPLICA;
    config
}

/// Primary whose transport captures every send and answers with `status`.
fn open_primary(dir: &tempfile::TempDir, status: i32) -> (Environment, Wire) {
    open_primary_with(dir, status, primary_config())
}

fn open_primary_with(
    dir: &tempfile::TempDir,
    status: i32,
    config: EnvConfig,
) -> (Environment, Wire) {
    let wire: Wire = Arc::new(Mutex::new(Vec::new()));
    let w = Arc::clone(&wire);
    let transport: Arc<dyn ReplicationTransport> = Arc::new(
        move |_: &EnvInfo, control: &[u8], record: &[u8], flags: SendFlags, site: SiteId| -> i32 {
            w.lock().push((control.to_vec(), record.to_vec(), flags, site));
            status
        },
    );
    let env = Environment::builder()
        .dir(dir.path())
        .config(config)
        .transport(transport)
        .open()
        .unwrap();
    (env, wire)
}

fn deliver(replica: &Environment, wire: &Wire) -> Vec<ReceiveOutcome> {
    wire.lock()
        .iter()
        .map(|(control, record, _, _)| replica.receive(control, record, PRIMARY).unwrap())
        .collect()
}

#[test]
fn committed_transaction_is_shipped_in_order() {
    let dir = tempfile::TempDir::new().unwrap();
    let (primary, wire) = open_primary(&dir, 0);

    let tx = committed_txn(&primary, &[b"one", b"two"]);
    primary.drain_shipping();

    let sent = wire.lock().clone();
    assert_eq!(sent.len(), 4);
    let types: Vec<u16> = sent
        .iter()
        .map(|(control, _, _, _)| ReplicationControl::from_bytes(control).unwrap().record_type)
        .collect();
    assert_eq!(
        types,
        vec![
            RecordType::Begin.tag(),
            RecordType::Update.tag(),
            RecordType::Update.tag(),
            RecordType::Commit.tag()
        ]
    );
    for (control, _, flags, site) in &sent[..3] {
        assert_eq!(*site, REPLICA);
        assert!(!flags.contains(SendFlags::PERMANENT));
        assert_eq!(ReplicationControl::from_bytes(control).unwrap().txn_id, Some(tx));
    }
    let (_, _, last_flags, _) = &sent[3];
    assert!(last_flags.contains(SendFlags::PERMANENT));
    assert!(last_flags.contains(SendFlags::LAST_IN_BATCH));
}

#[test]
fn replica_applies_once_and_drops_redelivery() {
    let dir = tempfile::TempDir::new().unwrap();
    let (primary, wire) = open_primary(&dir, 0);
    let replica = TestEnv::with_config(replica_config());

    committed_txn(&primary, &[b"alpha"]);
    committed_txn(&primary, &[b"beta"]);
    primary.drain_shipping();

    let first = deliver(replica.env(), &wire);
    assert_eq!(
        first.iter().filter(|o| **o == ReceiveOutcome::Applied).count(),
        2
    );
    assert!(first.iter().all(|o| *o != ReceiveOutcome::Duplicate));

    let again = deliver(replica.env(), &wire);
    assert!(again.iter().all(|o| *o == ReceiveOutcome::Duplicate));
    assert_eq!(
        replica.seen(RecoveryOp::Apply),
        vec![b"alpha".to_vec(), b"beta".to_vec()]
    );

    let stats = replica.env().replication().site_stats(PRIMARY);
    assert_eq!(stats.applied, 2);
    assert_eq!(stats.duplicates, 6);
    assert_eq!(stats.received, 12);
}

#[test]
fn interleaved_transactions_reach_replica_in_commit_order() {
    let dir = tempfile::TempDir::new().unwrap();
    let (primary, wire) = open_primary(&dir, 0);
    let replica = TestEnv::with_config(replica_config());

    let a = primary.begin().unwrap();
    primary.write(a, RecordType::Update, b"a-early").unwrap();
    let b = primary.begin().unwrap();
    primary.write(b, RecordType::Update, b"b").unwrap();
    primary.commit(b).unwrap();
    primary.write(a, RecordType::Update, b"a-late").unwrap();
    primary.commit(a).unwrap();
    primary.drain_shipping();

    let outcomes = deliver(replica.env(), &wire);
    assert_eq!(outcomes.len(), 7);
    assert!(outcomes.iter().all(|o| *o != ReceiveOutcome::Duplicate));
    assert_eq!(
        replica.seen(RecoveryOp::Apply),
        vec![b"b".to_vec(), b"a-early".to_vec(), b"a-late".to_vec()]
    );

    // Redelivering the whole stream changes nothing
    let again = deliver(replica.env(), &wire);
    assert!(again.iter().all(|o| *o == ReceiveOutcome::Duplicate));
    assert_eq!(replica.seen(RecoveryOp::Apply).len(), 3);
}

#[test]
fn shipping_resumes_where_it_stopped_after_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    {
        let (primary, wire) = open_primary(&dir, 0);
        committed_txn(&primary, &[b"before"]);
        primary.close().unwrap();
        assert_eq!(wire.lock().len(), 3);
    }

    let (primary, wire) = open_primary(&dir, 0);
    committed_txn(&primary, &[b"after"]);
    primary.drain_shipping();

    let replica = TestEnv::with_config(replica_config());
    deliver(replica.env(), &wire);
    assert_eq!(replica.seen(RecoveryOp::Apply), vec![b"after".to_vec()]);
    assert_eq!(
        primary.stats().shipper.unwrap().shipped_through,
        primary.log().flushed_lsn()
    );
}

#[test]
fn sites_can_be_added_and_removed_after_open() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = primary_config();
    config.replication.sites.clear();
    let (primary, wire) = open_primary_with(&dir, 0, config);

    committed_txn(&primary, &[b"unshipped"]);
    primary.drain_shipping();
    assert!(wire.lock().is_empty());

    primary.add_site(REPLICA).unwrap();
    assert!(matches!(
        primary.add_site(PRIMARY),
        Err(Error::InvalidArgument(_))
    ));
    committed_txn(&primary, &[b"shipped"]);
    primary.drain_shipping();
    assert_eq!(wire.lock().len(), 3);
    assert!(wire.lock().iter().all(|(_, _, _, site)| *site == REPLICA));

    assert!(primary.remove_site(REPLICA).unwrap());
    assert!(!primary.remove_site(REPLICA).unwrap());
    committed_txn(&primary, &[b"dropped"]);
    primary.drain_shipping();
    assert_eq!(wire.lock().len(), 3);
}

#[test]
fn adding_a_site_needs_a_transport() {
    let replica = TestEnv::with_config(replica_config());
    assert!(matches!(
        replica.env().add_site(PRIMARY),
        Err(Error::InvalidState(_))
    ));
}

#[test]
fn replica_progress_survives_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let (primary, wire) = open_primary(&dir, 0);
    let mut replica = TestEnv::with_config(replica_config());

    committed_txn(&primary, &[b"once"]);
    primary.drain_shipping();
    deliver(replica.env(), &wire);
    let last = replica.env().replication().last_applied(PRIMARY);
    assert!(last.is_some());

    replica.reopen();
    assert_eq!(replica.env().replication().last_applied(PRIMARY), last);
    let again = deliver(replica.env(), &wire);
    assert!(again.iter().all(|o| *o == ReceiveOutcome::Duplicate));
    assert!(replica.seen(RecoveryOp::Apply).is_empty());
}

#[test]
fn aborted_and_prepared_transactions_are_not_shipped() {
    let dir = tempfile::TempDir::new().unwrap();
    let (primary, wire) = open_primary(&dir, 0);

    let aborted = primary.begin().unwrap();
    primary.write(aborted, RecordType::Update, b"gone").unwrap();
    primary.abort(aborted).unwrap();

    let prepared = primary.begin().unwrap();
    primary.write(prepared, RecordType::Update, b"waiting").unwrap();
    primary.prepare(prepared, gid(1)).unwrap();
    primary.drain_shipping();
    assert!(wire.lock().is_empty());

    primary.commit(prepared).unwrap();
    primary.drain_shipping();
    assert_eq!(wire.lock().len(), 4);
}

#[test]
fn transport_failure_does_not_fail_commit() {
    let dir = tempfile::TempDir::new().unwrap();
    let (primary, wire) = open_primary(&dir, 5);

    committed_txn(&primary, &[b"x"]);
    primary.drain_shipping();

    // The site stops receiving at the first rejected record
    assert_eq!(wire.lock().len(), 1);
    let stats = primary.replication().site_stats(REPLICA);
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.last_failure_code, 5);
    assert_eq!(primary.stats().shipper.unwrap().shipped, 1);
}

#[test]
fn malformed_input_is_rejected_without_advancing() {
    let dir = tempfile::TempDir::new().unwrap();
    let (primary, wire) = open_primary(&dir, 0);
    let replica = TestEnv::with_config(replica_config());

    committed_txn(&primary, &[b"payload"]);
    primary.drain_shipping();
    let (control, mut record, _, _) = wire.lock()[1].clone();
    record[26] ^= 0xFF;

    assert!(matches!(
        replica.env().receive(&control, &record, PRIMARY),
        Err(Error::CorruptRecord { .. })
    ));
    assert!(matches!(
        replica.env().receive(b"junk", &record, PRIMARY),
        Err(Error::CorruptRecord { .. })
    ));
    assert_eq!(replica.env().replication().last_applied(PRIMARY), None);
}
