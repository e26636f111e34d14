//! Remote-address cache behavior: one rendezvous per (key, peer,
//! direction), directions kept apart, control messages never cached.

use crate::van::Shared;

#[test]
fn rendezvous_is_idempotent_per_triple() {
    let shared = Shared::new();
    let (key, peer) = (42u64, 9);

    // First push for the key: miss, memoized under cookie 1.
    assert!(shared.has_remote_info(1, key, true, peer).is_none());
    shared.store_remote_info(1, (0x1000, 0xaa, 7));

    // Every later push for the triple hits the cache.
    for cookie in 2..100 {
        assert_eq!(
            shared.has_remote_info(cookie, key, true, peer),
            Some((0x1000, 0xaa, 7))
        );
    }
}

#[test]
fn push_and_pull_directions_are_separate() {
    let shared = Shared::new();
    let (key, peer) = (0u64, 1);

    assert!(shared.has_remote_info(1, key, true, peer).is_none());
    shared.store_remote_info(1, (0x1000, 0xaa, 1));

    // The pull direction still needs its own rendezvous.
    assert!(shared.has_remote_info(2, key, false, peer).is_none());
    shared.store_remote_info(2, (0x2000, 0xbb, 2));

    assert_eq!(
        shared.has_remote_info(3, key, true, peer),
        Some((0x1000, 0xaa, 1))
    );
    assert_eq!(
        shared.has_remote_info(4, key, false, peer),
        Some((0x2000, 0xbb, 2))
    );
}

#[test]
fn peers_do_not_share_entries() {
    let shared = Shared::new();

    assert!(shared.has_remote_info(1, 5, true, 100).is_none());
    shared.store_remote_info(1, (0x1000, 1, 1));

    assert!(shared.has_remote_info(2, 5, true, 200).is_none());
}

#[test]
fn control_replies_stay_uncached() {
    let shared = Shared::new();

    // Control messages never memoize a cookie, so the reply's store is
    // a no-op and nothing ever hits.
    shared.store_remote_info(77, (0x3000, 3, 3));
    assert!(shared.has_remote_info(78, 0, true, 1).is_none());
}
