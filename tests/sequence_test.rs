mod common;

use feedstore::{Error, LockingSequenceRepository, SequenceRepository, Subspace, Tuple};

fn repo() -> SequenceRepository {
    SequenceRepository::new(common::app_space().subspace(&Tuple::new().push("seq")).unwrap())
}

#[test]
fn allocate_if_online_follows_the_expiry() {
    let store = common::memory_store();
    let repo = repo();
    let user = b"user-1";

    // Never online.
    let r = store
        .transact(|tx| repo.allocate_seq_if_online(tx, user, 100))
        .unwrap();
    assert_eq!(r, None);

    // Online until 200.
    let previous = store.transact(|tx| repo.refresh_online(tx, user, 200)).unwrap();
    assert_eq!(previous, None);
    let r = store
        .transact(|tx| repo.allocate_seq_if_online(tx, user, 150))
        .unwrap();
    assert_eq!(r, Some(1));
    let r = store
        .transact(|tx| repo.allocate_seq_if_online(tx, user, 200))
        .unwrap();
    assert_eq!(r, Some(2));

    // Strictly after the expiry.
    let r = store
        .transact(|tx| repo.allocate_seq_if_online(tx, user, 201))
        .unwrap();
    assert_eq!(r, None);
    assert_eq!(store.transact(|tx| repo.current_seq(tx, user)).unwrap(), 2);
}

#[test]
fn refresh_online_never_decreases() {
    let store = common::memory_store();
    let repo = repo();

    for (expires_at, expected_previous) in [(300, None), (100, Some(300)), (250, Some(300)), (400, Some(300))] {
        let previous = store
            .transact(|tx| repo.refresh_online(tx, b"u", expires_at))
            .unwrap();
        assert_eq!(previous, expected_previous);
    }

    let mut tx = store.begin();
    assert!(repo.is_online(&mut tx, b"u", 400).unwrap());
    assert!(!repo.is_online(&mut tx, b"u", 401).unwrap());
}

#[test]
fn going_offline_mid_transaction_forces_a_retry() {
    let store = common::memory_store();
    let repo = repo();
    store.transact(|tx| repo.refresh_online(tx, b"u", 1_000)).unwrap();

    let mut attempts = 0;
    let allocated = store
        .transact(|tx| {
            attempts += 1;
            let seq = repo.allocate_seq_if_online(tx, b"u", 500)?;
            if attempts == 1 {
                // Someone else marks the user offline before we commit.
                let mut other = store.begin();
                repo.mark_offline(&mut other, b"u")?;
                other.commit()?;
            }
            Ok(seq)
        })
        .unwrap();

    assert_eq!(attempts, 2);
    assert_eq!(allocated, None);
    assert_eq!(store.transact(|tx| repo.current_seq(tx, b"u")).unwrap(), 0);
}

#[test]
fn concurrent_allocations_never_repeat() {
    let store = common::store_with_retries(10_000);
    let repo = repo();

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            let repo = repo.clone();
            std::thread::spawn(move || {
                (0..20)
                    .map(|_| store.transact(|tx| repo.allocate_seq(tx, b"shared")).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut all: Vec<u64> = threads.into_iter().flat_map(|t| t.join().unwrap()).collect();
    all.sort_unstable();
    assert_eq!(all, (1..=80).collect::<Vec<_>>());
}

#[test]
fn snapshot_read_does_not_conflict_with_allocation() {
    let store = common::store_without_retries();
    let repo = repo();

    let mut reader = store.begin();
    assert_eq!(repo.current_seq_snapshot(&mut reader, b"u").unwrap(), 0);
    reader.set(b"unrelated", b"x");

    store.transact(|tx| repo.allocate_seq(tx, b"u")).unwrap();
    reader.commit().unwrap();
}

#[test]
fn blocks_are_contiguous_and_disjoint() {
    let store = common::memory_store();
    let repo = repo();

    let a = store.transact(|tx| repo.allocate_block(tx, b"u", 10)).unwrap();
    let b = store.transact(|tx| repo.allocate_block(tx, b"u", 5)).unwrap();
    let c = store.transact(|tx| repo.allocate_seq(tx, b"u")).unwrap();
    assert_eq!((a, b, c), (0, 10, 16));
}

#[test]
fn locking_allocations_conflict_across_transactions() {
    let store = common::store_without_retries();
    let repo = LockingSequenceRepository::new(
        Subspace::new(&Tuple::new().push("locked")).unwrap(),
    )
    .unwrap();

    let mut a = store.begin();
    let mut b = store.begin();
    assert_eq!(repo.allocate_seq(&mut a, b"u").unwrap(), 1);
    assert_eq!(repo.allocate_seq(&mut b, b"u").unwrap(), 1);
    a.commit().unwrap();
    assert!(matches!(b.commit(), Err(Error::Conflict { .. })));

    let mut tx = store.begin();
    assert_eq!(repo.repository().current_seq(&mut tx, b"u").unwrap(), 1);
}
