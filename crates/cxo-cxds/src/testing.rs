//! Behaviour checks run against every backend.

use cxo_types::Hash;

use crate::error::CxdsError;
use crate::object::Object;
use crate::traits::Cxds;

fn put(db: &dyn Cxds, val: &[u8]) -> Hash {
    let key = Hash::sum(val);
    db.set(&key, val).unwrap();
    key
}

/// Set, read, count up and down, delete.
pub fn lifecycle(db: &dyn Cxds) {
    let val = b"hello";
    let k = Hash::sum(val);

    assert_eq!(db.set(&k, val).unwrap().rc, 1);
    let got = db.get(&k).unwrap();
    assert_eq!(got.val, val);
    assert_eq!(got.rc, 1);
    assert_eq!(db.incr(&k, 2).unwrap(), 3);
    assert_eq!(db.incr(&k, -3).unwrap(), 0);

    let got = db.get_incr(&k, 0).unwrap();
    assert_eq!(got.val, val);
    assert_eq!(got.rc, 0);

    db.del(&k).unwrap();
    assert!(matches!(db.get(&k), Err(CxdsError::NotFound(h)) if h == k));
    assert_eq!(db.amount(), (0, 0));
    assert_eq!(db.volume(), (0, 0));
}

pub fn stat_accounting(db: &dyn Cxds) {
    let a = put(db, b"aaaa");
    let b = put(db, b"bb");
    assert_eq!(db.amount(), (2, 2));
    assert_eq!(db.volume(), (6, 6));

    // second set of the same value only adds to rc
    assert_eq!(db.set(&a, b"aaaa").unwrap().rc, 2);
    assert_eq!(db.amount(), (2, 2));

    // kill a
    assert_eq!(db.get_incr(&a, -2).unwrap().rc, 0);
    assert_eq!(db.amount(), (2, 1));
    assert_eq!(db.volume(), (6, 2));

    // underflow saturates
    assert_eq!(db.incr(&b, -10).unwrap(), 0);
    assert_eq!(db.amount(), (2, 0));
    assert_eq!(db.volume(), (6, 0));

    // resurrect b
    assert_eq!(db.incr_not_touch(&b, 1).unwrap(), 1);
    assert_eq!(db.amount(), (2, 1));

    let taken = db.take(&b).unwrap();
    assert_eq!(taken.val, b"bb");
    assert_eq!(db.amount(), (1, 0));
    assert_eq!(db.volume(), (4, 0));

    assert!(db.take(&b).unwrap_err().is_not_found());
    assert!(db.incr(&b, 1).unwrap_err().is_not_found());
}

pub fn touch_semantics(db: &dyn Cxds) {
    let k = Hash::sum(b"t");

    // created without touch: access stays zero
    let created = db.set_not_touch(&k, b"t").unwrap();
    assert_eq!(created.access_time, 0);
    let stored = db.get_not_touch(&k).unwrap();
    assert_eq!(stored.access_time, 0);
    assert!(stored.create_time > 0);

    // touch returns the previous access time
    assert_eq!(db.touch(&k).unwrap(), 0);
    let first = db.get_not_touch(&k).unwrap().access_time;
    assert!(first > 0);

    // get reports the access time before the call
    assert_eq!(db.get(&k).unwrap().access_time, first);
    assert!(db.get_not_touch(&k).unwrap().access_time >= first);

    // the not-touch family leaves it alone
    let before = db.get_not_touch(&k).unwrap().access_time;
    db.get_incr_not_touch(&k, 1).unwrap();
    db.incr_not_touch(&k, 1).unwrap();
    db.set_incr_not_touch(&k, b"t", 1).unwrap();
    assert_eq!(db.get_not_touch(&k).unwrap().access_time, before);

    // set on an existing object replies with the previous access time
    assert_eq!(db.set_incr(&k, b"t", 1).unwrap().access_time, before);

    assert!(db.touch(&Hash::sum(b"absent")).unwrap_err().is_not_found());
}

pub fn rejects_bad_input(db: &dyn Cxds) {
    assert!(matches!(
        db.set(&Hash::sum(b""), b""),
        Err(CxdsError::EmptyValue)
    ));
    assert!(matches!(
        db.set(&Hash::sum(b"one"), b"two"),
        Err(CxdsError::InvalidKey { .. })
    ));
    assert_eq!(db.amount(), (0, 0));
    assert!(!db.has(&Hash::sum(b"two")).unwrap());
}

pub fn iterate_tolerates_deletion(db: &dyn Cxds) {
    let mut keys: Vec<Hash> = (0u8..6).map(|i| put(db, &[i, i])).collect();
    keys.sort();

    // delete the last key from inside the visitor
    let last = keys[5];
    let mut seen = Vec::new();
    db.iterate(&mut |k, obj| {
        assert_eq!(Hash::sum(&obj.val), *k);
        if seen.is_empty() {
            db.del(&last)?;
        }
        seen.push(*k);
        Ok(())
    })
    .unwrap();
    assert_eq!(seen, keys[..5].to_vec());

    // early stop
    let mut count = 0;
    db.iterate(&mut |_, _| {
        count += 1;
        if count == 2 {
            return Err(CxdsError::StopIteration);
        }
        Ok(())
    })
    .unwrap();
    assert_eq!(count, 2);
}

pub fn iterate_del_removes_selected(db: &dyn Cxds) {
    let mut dead = Vec::new();
    for i in 0u8..10 {
        let k = put(db, &[b'v', i]);
        if i % 2 == 0 {
            db.incr(&k, -1).unwrap();
            dead.push(k);
        }
    }
    assert_eq!(db.amount(), (10, 5));

    db.iterate_del(&mut |_, obj| Ok(obj.rc == 0)).unwrap();

    assert_eq!(db.amount(), (5, 5));
    for k in &dead {
        assert!(!db.has(k).unwrap());
    }

    // a visitor error aborts without deleting the current entry
    let err = db
        .iterate_del(&mut |_, _| Err(CxdsError::EmptyValue))
        .unwrap_err();
    assert!(matches!(err, CxdsError::EmptyValue));
    assert_eq!(db.amount(), (5, 5));
}

pub fn set_raw_replaces(db: &dyn Cxds) {
    let k = Hash::sum(b"raw");
    let obj = Object {
        val: b"raw".to_vec(),
        rc: 0,
        access_time: 7,
        create_time: 3,
    };
    db.set_raw(&k, &obj).unwrap();
    assert_eq!(db.get_not_touch(&k).unwrap(), obj);
    assert_eq!(db.amount(), (1, 0));

    let live = Object { rc: 4, ..obj.clone() };
    db.set_raw(&k, &live).unwrap();
    assert_eq!(db.amount(), (1, 1));
    assert_eq!(db.volume(), (3, 3));

    let bad = Object {
        val: b"other".to_vec(),
        ..obj
    };
    assert!(matches!(
        db.set_raw(&k, &bad),
        Err(CxdsError::InvalidKey { .. })
    ));
}
