//! Retention of roots and sweeping of unheld objects.

use std::sync::Arc;
use std::time::Instant;

use cxo_cxds::CxdsError;
use cxo_idxdb::IdxError;
use cxo_types::PubKey;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::container::Container;
use crate::error::ContainerResult;

/// Remove every root older than the `keep_last` newest of its head and
/// release the hold on its body. Returns the number of roots removed.
///
/// A head whose last seq is below `keep_last` is left alone. Seqs are
/// sparse, so positions with no root are skipped.
pub fn remove_root_objects(c: &Container, keep_last: u64) -> ContainerResult<usize> {
    let mut feeds: Vec<PubKey> = Vec::new();
    c.idx().iterate_feeds(&mut |pk| {
        feeds.push(*pk);
        Ok(())
    })?;

    let mut removed = 0;
    for pk in feeds {
        let mut nonces = Vec::new();
        c.idx().iterate_heads(&pk, &mut |nonce| {
            nonces.push(nonce);
            Ok(())
        })?;
        for nonce in nonces {
            removed += prune_head(c, &pk, nonce, keep_last)?;
        }
    }
    if removed > 0 {
        info!(removed, keep_last, "old roots removed");
    }
    Ok(removed)
}

fn prune_head(c: &Container, pk: &PubKey, nonce: u64, keep_last: u64) -> ContainerResult<usize> {
    let Some((last, _)) = c.idx().last_root(pk, nonce)? else {
        return Ok(0);
    };
    let Some(bound) = last.checked_sub(keep_last) else {
        return Ok(0);
    };

    let mut seqs = Vec::new();
    c.idx().ascend_roots(pk, nonce, &mut |seq, _| {
        if seq > bound {
            return Err(IdxError::StopIteration);
        }
        seqs.push(seq);
        Ok(())
    })?;

    let mut removed = 0;
    for seq in seqs {
        let root = match c.idx().take_root(pk, nonce, seq) {
            Ok(root) => root,
            Err(IdxError::NotFound { .. }) => continue,
            Err(e) => return Err(e.into()),
        };
        c.release(&root.hash)?;
        removed += 1;
    }
    debug!(feed = %pk, nonce, removed, "head pruned");
    Ok(removed)
}

/// Delete every object nobody holds or pins, for at most `timeout`.
/// Returns the number of objects deleted.
pub fn remove_objects(c: &Container, timeout: Duration) -> ContainerResult<usize> {
    let deadline = Instant::now() + timeout;
    let mut removed = 0;
    c.cxds().iterate_del(&mut |key, obj| {
        if Instant::now() >= deadline {
            return Err(CxdsError::StopIteration);
        }
        if obj.rc > 0 || c.is_pinned(key) {
            return Ok(false);
        }
        removed += 1;
        Ok(true)
    })?;
    if removed > 0 {
        info!(removed, "unheld objects removed");
    }
    Ok(removed)
}

/// Run both passes every `gc_interval` until `shutdown` turns `true` or
/// its sender is dropped. A zero interval returns at once.
pub async fn run_gc(c: Arc<Container>, mut shutdown: watch::Receiver<bool>) {
    let config = c.config().clone();
    if config.gc_interval_ms == 0 {
        return;
    }
    let mut ticker = interval(config.gc_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    info!(interval_ms = config.gc_interval_ms, "gc started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        if c.is_closed() {
            break;
        }
        let roots = remove_root_objects(&c, config.gc_keep_last);
        let objects = remove_objects(&c, config.gc_timeout());
        match (roots, objects) {
            (Ok(roots), Ok(objects)) => debug!(roots, objects, "gc pass"),
            (Err(e), _) | (_, Err(e)) => warn!(error = %e, "gc pass failed"),
        }
    }
    info!("gc stopped");
}

#[cfg(test)]
mod tests {
    use cxo_crypto::{generate_keypair, SecKey};
    use cxo_cxds::Cxds;
    use cxo_skyobject::{Chunk, Dynamic, PackFlags};
    use cxo_types::Hash;

    use super::*;
    use crate::config::Config;
    use crate::testing::container;

    /// Save `n` roots on head 0, each naming one fresh chunk held by the
    /// saver. Returns the chunk hashes.
    fn publish(c: &Container, sk: &SecKey, n: u8) -> Vec<Hash> {
        c.register::<Chunk>();
        let reg = c.library();
        let reg_ref = c.save_registry(&reg).unwrap();
        let pack = c.pack(reg, PackFlags::NONE);
        (0..n)
            .map(|i| {
                let chunk = pack.add_value(&Chunk { data: vec![i] }).unwrap();
                c.save(sk, 0, vec![Dynamic::of::<Chunk>(chunk)], reg_ref)
                    .unwrap();
                chunk
            })
            .collect()
    }

    // ---- Roots ----

    #[test]
    fn keeps_the_newest_roots_of_each_head() {
        let c = container();
        let (pk, sk) = generate_keypair();
        publish(&c, &sk, 5);
        let first = c.root(&pk, 0, 0).unwrap();

        assert_eq!(remove_root_objects(&c, 2).unwrap(), 3);
        assert_eq!(c.idx().roots_len(&pk, 0).unwrap(), 2);
        assert!(c.idx().has_root(&pk, 0, 3).unwrap());
        assert!(c.idx().has_root(&pk, 0, 4).unwrap());
        assert_eq!(c.cxds().get_not_touch(&first.hash).unwrap().rc, 0);

        // nothing older left
        assert_eq!(remove_root_objects(&c, 2).unwrap(), 0);
    }

    #[test]
    fn short_heads_are_left_alone() {
        let c = container();
        let (pk, sk) = generate_keypair();
        publish(&c, &sk, 2);
        assert_eq!(remove_root_objects(&c, 5).unwrap(), 0);
        assert_eq!(c.idx().roots_len(&pk, 0).unwrap(), 2);
    }

    #[test]
    fn sparse_seqs_are_skipped() {
        let c = container();
        let (pk, sk) = generate_keypair();
        publish(&c, &sk, 4);
        c.idx().del_root(&pk, 0, 1).unwrap();
        assert_eq!(remove_root_objects(&c, 1).unwrap(), 2);
        assert_eq!(c.idx().roots_len(&pk, 0).unwrap(), 1);
    }

    // ---- Objects ----

    #[test]
    fn sweeps_unheld_unpinned_objects() {
        let c = container();
        let (_, sk) = generate_keypair();
        let chunks = publish(&c, &sk, 3);
        let free = c.deliver(b"free").unwrap();
        let pinned = c.deliver(b"pinned").unwrap();
        c.pin(pinned);
        for h in &chunks[..2] {
            c.cxds().incr(h, -1).unwrap();
        }

        assert_eq!(remove_objects(&c, Duration::from_secs(5)).unwrap(), 3);
        assert!(!c.cxds().has(&free).unwrap());
        assert!(!c.cxds().has(&chunks[0]).unwrap());
        assert!(c.cxds().has(&chunks[2]).unwrap());
        assert!(c.cxds().has(&pinned).unwrap());

        c.unpin(&pinned);
        assert_eq!(remove_objects(&c, Duration::from_secs(5)).unwrap(), 1);
    }

    #[test]
    fn expired_sweep_stops_cleanly() {
        let c = container();
        c.deliver(b"left over").unwrap();
        assert_eq!(remove_objects(&c, Duration::ZERO).unwrap(), 0);
        assert_eq!(c.cxds().amount().0, 1);
    }

    // ---- Loop ----

    #[tokio::test(start_paused = true)]
    async fn periodic_gc_runs_until_shutdown() {
        let config = Config {
            gc_interval_ms: 1_000,
            gc_keep_last: 1,
            ..Config::in_memory()
        };
        let c = Arc::new(Container::open(config).unwrap());
        let (pk, sk) = generate_keypair();
        publish(&c, &sk, 3);
        let leftover = c.deliver(b"left over").unwrap();

        let (tx, rx) = watch::channel(false);
        let gc = tokio::spawn(run_gc(Arc::clone(&c), rx));
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        assert_eq!(c.idx().roots_len(&pk, 0).unwrap(), 1);
        assert!(!c.cxds().has(&leftover).unwrap());

        tx.send(true).unwrap();
        gc.await.unwrap();
    }

    #[tokio::test]
    async fn zero_interval_disables_gc() {
        let c = Arc::new(
            Container::open(Config {
                gc_interval_ms: 0,
                ..Config::in_memory()
            })
            .unwrap(),
        );
        let (_tx, rx) = watch::channel(false);
        run_gc(c, rx).await;
    }
}
