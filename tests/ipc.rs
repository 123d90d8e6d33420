// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests of the keyed-segment rendezvous and locking flow.

use std::thread;

use tempfile::NamedTempFile;

use shmlock::{IpcLock, Segment, Semaphore, SharedRegion, SysvKey};

/// The full rendezvous lifecycle: one participant creates and writes under
/// the lock, a second reaches the same segment purely by key and reads, any
/// participant destroys, and a latecomer finds nothing.
#[test]
fn test_keyed_rendezvous_lifecycle() {
    let file = NamedTempFile::new().unwrap();

    // First participant.
    let key = SysvKey::derive(file.path(), 1).unwrap();
    let segment = Segment::get_or_create(key, 4096).unwrap();
    let mut map = segment.attach().unwrap();
    let sem = Semaphore::get_or_create(key).unwrap();

    sem.lock().unwrap();
    map.write_bytes(&[0xAB; 4096]).unwrap();
    sem.unlock().unwrap();

    // Second participant derives the same key independently.
    let peer_key = SysvKey::derive(file.path(), 1).unwrap();
    assert_eq!(peer_key, key);

    let peer_segment = Segment::get_or_create(peer_key, 4096).unwrap();
    assert_eq!(peer_segment.id(), segment.id());
    let peer_map = peer_segment.attach().unwrap();
    let peer_sem = Semaphore::get_or_create(peer_key).unwrap();

    peer_sem.lock().unwrap();
    assert_eq!(peer_map.read_to_vec(4096).unwrap(), vec![0xAB; 4096]);
    peer_sem.unlock().unwrap();

    // Either participant may destroy; the peer's view is dropped first.
    peer_map.detach().unwrap();
    segment.close(Some(map)).unwrap();
    sem.remove().unwrap();

    // A third participant arriving late finds no segment under the key.
    let err = Segment::open(key).unwrap_err();
    assert!(err.is_not_found(), "got {err}");
    let err = Semaphore::open(key).unwrap_err();
    assert!(err.is_not_found(), "got {err}");
}

/// Mutual exclusion over a non-atomic counter in the shared segment: every
/// increment happens inside the lock, so none may be lost. Each worker uses
/// its own semaphore handle and its own attachment, the way separate
/// processes would.
#[test]
fn test_mutual_exclusion_over_shared_counter() {
    const WORKERS: usize = 4;
    const INCREMENTS: usize = 500;

    let file = NamedTempFile::new().unwrap();
    let key = SysvKey::derive(file.path(), 1).unwrap();

    let segment = Segment::create(key, 4096).unwrap();
    let map = segment.attach().unwrap();
    let sem = Semaphore::create(key).unwrap();

    let workers: Vec<_> = (0..WORKERS)
        .map(|_| {
            thread::spawn(move || {
                let segment = Segment::open(key).unwrap();
                let mut map = segment.attach().unwrap();
                let sem = Semaphore::open(key).unwrap();

                for _ in 0..INCREMENTS {
                    let guard = sem.lock_guard().unwrap();
                    // Read-modify-write that is only safe under the lock.
                    let bytes = map.read_to_vec(8).unwrap();
                    let count = u64::from_ne_bytes(bytes.try_into().unwrap());
                    map.write_bytes(&(count + 1).to_ne_bytes()).unwrap();
                    guard.release().unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    let bytes = map.read_to_vec(8).unwrap();
    let count = u64::from_ne_bytes(bytes.try_into().unwrap());
    assert_eq!(count as usize, WORKERS * INCREMENTS);

    sem.remove().unwrap();
    segment.close(Some(map)).unwrap();
}

/// A waiter blocked in lock() only proceeds once the holder unlocks.
#[test]
fn test_lock_blocks_until_unlocked() {
    let file = NamedTempFile::new().unwrap();
    let key = SysvKey::derive(file.path(), 1).unwrap();
    let sem = Semaphore::create(key).unwrap();

    sem.lock().unwrap();

    let waiter = thread::spawn(move || {
        let sem = Semaphore::open(key).unwrap();
        sem.lock().unwrap();
        std::time::Instant::now()
    });

    let hold = std::time::Duration::from_millis(200);
    thread::sleep(hold);
    let released_at = std::time::Instant::now();
    sem.unlock().unwrap();

    let acquired_at = waiter.join().unwrap();
    assert!(
        acquired_at >= released_at,
        "waiter acquired the lock before it was released"
    );
    assert_eq!(sem.value().unwrap(), 1);

    sem.remove().unwrap();
}
