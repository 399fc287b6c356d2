//! Behaviour checks run against every backend.

use cxo_crypto::{generate_keypair, SecKey};
use cxo_types::{Hash, PubKey, Sig};

use crate::error::IdxError;
use crate::traits::IdxDb;

fn signed(sk: &SecKey, body: &[u8]) -> (Hash, Sig) {
    let hash = Hash::sum(body);
    (hash, sk.sign_hash(&hash))
}

fn seqs_ascending(idx: &dyn IdxDb, pk: &PubKey, nonce: u64) -> Vec<u64> {
    let mut out = Vec::new();
    idx.ascend_roots(pk, nonce, &mut |seq, _| {
        out.push(seq);
        Ok(())
    })
    .unwrap();
    out
}

pub fn seq_ordering(idx: &dyn IdxDb) {
    let (pk, sk) = generate_keypair();
    idx.add_feed(&pk).unwrap();
    idx.add_head(&pk, 7).unwrap();
    for seq in [3u64, 1, 2] {
        let (h, s) = signed(&sk, &seq.to_le_bytes());
        idx.set_root(&pk, 7, seq, &h, &s).unwrap();
    }

    assert_eq!(seqs_ascending(idx, &pk, 7), vec![1, 2, 3]);

    let mut desc = Vec::new();
    idx.descend_roots(&pk, 7, &mut |seq, _| {
        desc.push(seq);
        Ok(())
    })
    .unwrap();
    assert_eq!(desc, vec![3, 2, 1]);

    idx.del_root(&pk, 7, 2).unwrap();
    assert_eq!(seqs_ascending(idx, &pk, 7), vec![1, 3]);
    assert_eq!(idx.roots_len(&pk, 7).unwrap(), 2);

    // numeric, not lexicographic, order
    let (h, s) = signed(&sk, b"big");
    idx.set_root(&pk, 7, 256, &h, &s).unwrap();
    assert_eq!(seqs_ascending(idx, &pk, 7), vec![1, 3, 256]);
    assert_eq!(idx.last_root(&pk, 7).unwrap().map(|(seq, _)| seq), Some(256));

    // early stop
    let mut first = None;
    idx.ascend_roots(&pk, 7, &mut |seq, _| {
        first = Some(seq);
        Err(IdxError::StopIteration)
    })
    .unwrap();
    assert_eq!(first, Some(1));
}

pub fn feed_deletion_cascades(idx: &dyn IdxDb) {
    let (pk, sk) = generate_keypair();
    let (other, _) = generate_keypair();
    idx.add_feed(&pk).unwrap();
    idx.add_feed(&other).unwrap();
    idx.add_head(&pk, 1).unwrap();
    idx.add_head(&pk, 2).unwrap();
    idx.add_head(&other, 1).unwrap();
    let (h, s) = signed(&sk, b"r");
    idx.set_root(&pk, 1, 1, &h, &s).unwrap();

    idx.del_feed(&pk).unwrap();
    assert!(!idx.has_feed(&pk).unwrap());
    assert!(matches!(idx.has_head(&pk, 1), Err(IdxError::NoSuchFeed(f)) if f == pk));
    assert!(matches!(idx.del_feed(&pk), Err(IdxError::NoSuchFeed(_))));

    // the other feed is untouched
    assert!(idx.has_head(&other, 1).unwrap());

    // a re-added feed starts empty
    idx.add_feed(&pk).unwrap();
    assert_eq!(idx.heads_len(&pk).unwrap(), 0);
    idx.add_head(&pk, 1).unwrap();
    assert_eq!(idx.roots_len(&pk, 1).unwrap(), 0);
}

pub fn set_root_semantics(idx: &dyn IdxDb) {
    let (pk, sk) = generate_keypair();
    idx.add_feed(&pk).unwrap();
    idx.add_head(&pk, 0).unwrap();
    let (h1, s1) = signed(&sk, b"one");

    // created: reply access is zero, stored access is now
    let created = idx.set_root(&pk, 0, 1, &h1, &s1).unwrap();
    assert_eq!(created.access_time, 0);
    assert!(created.create_time > 0);
    let stored = idx.get_not_touch_root(&pk, 0, 1).unwrap();
    assert_eq!(stored.access_time, stored.create_time);

    // existing: hash and sig replaced, previous access returned
    let (h2, s2) = signed(&sk, b"two");
    let updated = idx.set_root(&pk, 0, 1, &h2, &s2).unwrap();
    assert_eq!(updated.access_time, stored.access_time);
    assert_eq!(idx.get_not_touch_root(&pk, 0, 1).unwrap().hash, h2);

    // not-touch create leaves access at zero
    idx.set_not_touch_root(&pk, 0, 2, &h1, &s1).unwrap();
    assert_eq!(idx.get_not_touch_root(&pk, 0, 2).unwrap().access_time, 0);
    idx.set_not_touch_root(&pk, 0, 2, &h2, &s2).unwrap();
    assert_eq!(idx.get_not_touch_root(&pk, 0, 2).unwrap().access_time, 0);

    // get touches and returns the previous access
    assert_eq!(idx.get_root(&pk, 0, 2).unwrap().access_time, 0);
    assert!(idx.get_not_touch_root(&pk, 0, 2).unwrap().access_time > 0);

    let taken = idx.take_root(&pk, 0, 2).unwrap();
    assert_eq!(taken.hash, h2);
    assert!(!idx.has_root(&pk, 0, 2).unwrap());
    assert!(matches!(
        idx.get_root(&pk, 0, 2),
        Err(IdxError::NotFound { seq: 2, .. })
    ));
    assert!(matches!(
        idx.set_root(&pk, 9, 1, &h1, &s1),
        Err(IdxError::NoSuchHead { nonce: 9, .. })
    ));
}

pub fn rejects_bad_signature(idx: &dyn IdxDb) {
    let (pk, _) = generate_keypair();
    let (_, other_sk) = generate_keypair();
    idx.add_feed(&pk).unwrap();
    idx.add_head(&pk, 0).unwrap();
    let (h, s) = signed(&other_sk, b"forged");
    assert!(matches!(
        idx.set_root(&pk, 0, 1, &h, &s),
        Err(IdxError::InvalidSignature { .. })
    ));
    assert_eq!(idx.roots_len(&pk, 0).unwrap(), 0);
}

pub fn heads_and_feeds(idx: &dyn IdxDb) {
    let (a, _) = generate_keypair();
    let (b, _) = generate_keypair();
    assert_eq!(idx.feeds_len().unwrap(), 0);
    idx.add_feed(&a).unwrap();
    idx.add_feed(&a).unwrap();
    idx.add_feed(&b).unwrap();
    assert_eq!(idx.feeds_len().unwrap(), 2);

    let mut feeds = Vec::new();
    idx.iterate_feeds(&mut |pk| {
        feeds.push(*pk);
        Ok(())
    })
    .unwrap();
    let mut want = vec![a, b];
    want.sort();
    assert_eq!(feeds, want);

    assert!(matches!(
        idx.add_head(&PubKey::default(), 1),
        Err(IdxError::NoSuchFeed(_))
    ));
    for nonce in [u64::MAX, 5, 0] {
        idx.add_head(&a, nonce).unwrap();
    }
    idx.add_head(&a, 5).unwrap();
    assert_eq!(idx.heads_len(&a).unwrap(), 3);

    let mut nonces = Vec::new();
    idx.iterate_heads(&a, &mut |n| {
        nonces.push(n);
        Ok(())
    })
    .unwrap();
    assert_eq!(nonces, vec![0, 5, u64::MAX]);

    idx.del_head(&a, 5).unwrap();
    assert!(!idx.has_head(&a, 5).unwrap());
    assert!(matches!(
        idx.del_head(&a, 5),
        Err(IdxError::NoSuchHead { nonce: 5, .. })
    ));
    assert!(matches!(
        idx.ascend_roots(&a, 5, &mut |_, _| Ok(())),
        Err(IdxError::NoSuchHead { .. })
    ));
}

pub fn visitors_may_modify(idx: &dyn IdxDb) {
    let (pk, sk) = generate_keypair();
    idx.add_feed(&pk).unwrap();
    idx.add_head(&pk, 0).unwrap();
    for seq in 1..=4u64 {
        let (h, s) = signed(&sk, &seq.to_le_bytes());
        idx.set_root(&pk, 0, seq, &h, &s).unwrap();
    }

    // delete every visited root from inside the visitor
    idx.ascend_roots(&pk, 0, &mut |seq, _| idx.del_root(&pk, 0, seq))
        .unwrap();
    assert_eq!(idx.roots_len(&pk, 0).unwrap(), 0);
}
