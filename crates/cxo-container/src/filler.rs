//! Completing a root by fetching every object it references.
//!
//! A filler runs as a tokio task tree. The main task resolves the root's
//! registry, then starts one worker per top-level reference. Workers walk
//! their subgraph with an explicit stack. Every object is read with a hold
//! (`get_incr(+1)`); missing objects are published on the container's
//! request channel and awaited through a want. The holds taken are
//! recorded so that a failed or closed fill can give them back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cxo_codec::Decode;
use cxo_skyobject::{BranchNode, Dynamic, Reference, Registry, Root, RootNode, SchemaRef};
use cxo_types::Hash;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::container::Container;
use crate::error::{ContainerError, ContainerResult};

/// Handle of a running fill.
pub struct Filler {
    root: Hash,
    fetcher: Arc<Fetcher>,
    task: JoinHandle<ContainerResult<()>>,
}

impl Filler {
    pub(crate) fn start(container: Arc<Container>, root: Root) -> Self {
        let (cancel, _) = watch::channel(false);
        let fetcher = Arc::new(Fetcher {
            container,
            incs: Mutex::new(HashMap::new()),
            cancel,
        });
        let hash = root.hash;
        info!(root = %hash, refs = root.body.refs.len(), "filler started");
        let task = tokio::spawn({
            let fetcher = Arc::clone(&fetcher);
            async move {
                let res = run(Arc::clone(&fetcher), root).await;
                if res.is_err() {
                    fetcher.rollback();
                }
                res
            }
        });
        Self {
            root: hash,
            fetcher,
            task,
        }
    }

    /// Hash of the root being filled.
    pub fn root(&self) -> Hash {
        self.root
    }

    /// Wait for the fill to end. On success every reachable object is
    /// stored and held once per reference the filler followed; on failure
    /// all holds are given back, whether or not anybody waits.
    pub async fn wait(self) -> ContainerResult<()> {
        let res = self.task.await.unwrap_or(Err(ContainerError::Terminated));
        match &res {
            Ok(()) => info!(root = %self.root, held = self.fetcher.held(), "filler finished"),
            Err(e) => {
                warn!(root = %self.root, error = %e, "filler failed");
                self.fetcher.rollback();
            }
        }
        res
    }

    /// Cancel the fill, wait for its workers and give back every hold.
    pub async fn close(self) {
        self.fetcher.cancel();
        let _ = self.task.await;
        self.fetcher.rollback();
        info!(root = %self.root, "filler closed");
    }
}

struct Fetcher {
    container: Arc<Container>,
    /// Holds taken per object.
    incs: Mutex<HashMap<Hash, i64>>,
    cancel: watch::Sender<bool>,
}

impl Fetcher {
    fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Read an object with a hold, requesting it from peers while it is
    /// missing.
    async fn get(&self, hash: Hash) -> ContainerResult<Vec<u8>> {
        loop {
            if self.is_cancelled() {
                return Err(ContainerError::Terminated);
            }
            if let Some(val) = self.try_get(&hash)? {
                return Ok(val);
            }
            // a delivery may land between the miss and the want
            let mut want = self.container.want(hash);
            if let Some(val) = self.try_get(&hash)? {
                return Ok(val);
            }

            debug!(hash = %hash, "requesting object");
            tokio::select! {
                res = self.container.request(hash) => res?,
                _ = self.cancelled() => return Err(ContainerError::Terminated),
            }
            tokio::select! {
                res = want.arrived() => res?,
                _ = self.cancelled() => return Err(ContainerError::Terminated),
            }
        }
    }

    /// Take a hold on a stored object; `None` when it is missing.
    fn try_get(&self, hash: &Hash) -> ContainerResult<Option<Vec<u8>>> {
        match self.container.cxds().get_incr(hash, 1) {
            Ok(obj) => {
                *self
                    .incs
                    .lock()
                    .expect("incs lock poisoned")
                    .entry(*hash)
                    .or_default() += 1;
                Ok(Some(obj.val))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn held(&self) -> usize {
        self.incs.lock().expect("incs lock poisoned").len()
    }

    fn rollback(&self) {
        let incs: Vec<(Hash, i64)> = self
            .incs
            .lock()
            .expect("incs lock poisoned")
            .drain()
            .collect();
        for (hash, n) in incs {
            match self.container.cxds().incr(&hash, -n) {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(hash = %hash, error = %e, "cannot release filler hold"),
            }
        }
    }
}

/// Objects left to fetch by a worker.
enum Item {
    Value { schema: SchemaRef, hash: Hash },
    Refs { schema: SchemaRef, hash: Hash },
    /// A Refs node whose element hashes sit `level` levels above the values.
    Node { schema: SchemaRef, level: u32, hash: Hash },
}

impl Item {
    fn of(reference: Reference) -> Option<Self> {
        if reference.is_blank() {
            return None;
        }
        Some(match reference {
            Reference::Ref { schema, hash } | Reference::Dynamic(Dynamic { schema, hash }) => {
                Self::Value { schema, hash }
            }
            Reference::Refs { schema, hash } => Self::Refs { schema, hash },
        })
    }

    fn level(schema: SchemaRef, level: u32, hash: Hash) -> Self {
        if level == 0 {
            Self::Value { schema, hash }
        } else {
            Self::Node {
                schema,
                level,
                hash,
            }
        }
    }
}

async fn run(fetcher: Arc<Fetcher>, root: Root) -> ContainerResult<()> {
    let reg = root.body.reg;
    if !reg.is_zero() {
        fetcher.get(reg).await?;
    }
    let registry = fetcher.container.registry(&reg)?;

    let limit = fetcher.container.config().max_parallel;
    let gate = (limit > 0).then(|| Arc::new(Semaphore::new(limit)));
    let mut workers = JoinSet::new();
    for d in root.body.refs.iter().filter(|d| !d.is_blank()) {
        let first = Item::Value {
            schema: d.schema,
            hash: d.hash,
        };
        workers.spawn(worker(
            Arc::clone(&fetcher),
            Arc::clone(&registry),
            gate.clone(),
            first,
        ));
    }

    let mut result = Ok(());
    while let Some(joined) = workers.join_next().await {
        let res = joined.unwrap_or(Err(ContainerError::Terminated));
        if let Err(e) = res {
            if result.is_ok() {
                fetcher.cancel();
                result = Err(e);
            }
        }
    }
    result
}

async fn worker(
    fetcher: Arc<Fetcher>,
    registry: Arc<Registry>,
    gate: Option<Arc<Semaphore>>,
    first: Item,
) -> ContainerResult<()> {
    let _permit = match gate {
        Some(gate) => tokio::select! {
            permit = gate.acquire_owned() => {
                Some(permit.map_err(|_| ContainerError::Terminated)?)
            }
            _ = fetcher.cancelled() => return Err(ContainerError::Terminated),
        },
        None => None,
    };

    let mut stack = vec![first];
    while let Some(item) = stack.pop() {
        match item {
            Item::Value { schema, hash } => {
                let val = fetcher.get(hash).await?;
                let inner = registry.schema(&schema)?.references(&val)?;
                stack.extend(inner.into_iter().filter_map(Item::of));
            }
            Item::Refs { schema, hash } => {
                let top = RootNode::decode(&fetcher.get(hash).await?)?;
                push_level(&mut stack, schema, top.depth, &top.hashes);
            }
            Item::Node {
                schema,
                level,
                hash,
            } => {
                let node = BranchNode::decode(&fetcher.get(hash).await?)?;
                push_level(&mut stack, schema, level - 1, &node.hashes);
            }
        }
    }
    Ok(())
}

/// Push node children in reverse so they are fetched in order.
fn push_level(stack: &mut Vec<Item>, schema: SchemaRef, level: u32, hashes: &[Hash]) {
    stack.extend(
        hashes
            .iter()
            .rev()
            .filter(|h| !h.is_zero())
            .map(|&h| Item::level(schema, level, h)),
    );
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use cxo_codec::Encode;
    use cxo_crypto::{generate_keypair, SecKey};
    use cxo_cxds::Cxds;
    use cxo_skyobject::{Chunk, PackFlags, Refs, Visit, Walker};

    use super::*;
    use crate::testing::{container, Folder};

    /// Save a root with two folders of `files` chunks each.
    fn publish(c: &Container, sk: &SecKey, files: u8) -> Root {
        c.register::<Folder>();
        c.register::<Chunk>();
        let reg = c.library();
        let reg_ref = c.save_registry(&reg).unwrap();
        let pack = c.pack(reg, PackFlags::NONE);
        let mut refs = Vec::new();
        for f in 0..2u8 {
            let mut list = Refs::new();
            for n in 0..files {
                let chunk = pack.add_value(&Chunk { data: vec![f, n] }).unwrap();
                list.append_hashes(&pack, &[chunk]).unwrap();
            }
            let folder = pack
                .add_value(&Folder {
                    name: format!("f{f}"),
                    files: list.seal(&pack).unwrap(),
                })
                .unwrap();
            refs.push(Dynamic::of::<Folder>(folder));
        }
        c.save(sk, 0, refs, reg_ref).unwrap()
    }

    /// Every object a root references, registry included.
    fn reachable(c: &Container, root: &Root) -> HashSet<Hash> {
        let pack = c.unpack(root, PackFlags::NONE).unwrap();
        let mut seen = HashSet::new();
        Walker::new(&pack)
            .walk_root(&root.body, &mut |v: Visit| {
                seen.insert(v.hash());
                Ok(true)
            })
            .unwrap();
        seen
    }

    /// A second container following the feed of `root`.
    fn follower(root: &Root) -> Arc<Container> {
        let dst = container();
        dst.register::<Folder>();
        dst.register::<Chunk>();
        dst.add_feed(root.pub_key()).unwrap();
        dst.receive_root(&root.body.encode(), &root.sig).unwrap();
        dst
    }

    #[tokio::test]
    async fn local_graph_gains_one_hold_per_object() {
        let c = container();
        let (_, sk) = generate_keypair();
        let root = publish(&c, &sk, 5);
        let before: Vec<(Hash, i64)> = reachable(&c, &root)
            .into_iter()
            .map(|h| (h, c.cxds().get_not_touch(&h).unwrap().rc))
            .collect();

        c.fill(root.clone()).wait().await.unwrap();
        for (h, rc) in before {
            assert_eq!(c.cxds().get_not_touch(&h).unwrap().rc, rc + 1);
        }
    }

    #[tokio::test]
    async fn local_fills_leave_no_wants_behind() {
        let c = container();
        let (_, sk) = generate_keypair();
        let root = publish(&c, &sk, 10);
        for _ in 0..3 {
            c.fill(root.clone()).wait().await.unwrap();
        }
        assert_eq!(c.wanted(), 0);
        for h in reachable(&c, &root) {
            assert!(!c.is_pinned(&h), "{h}");
        }
    }

    #[tokio::test]
    async fn missing_objects_are_requested_and_delivered() {
        let src = container();
        let (_, sk) = generate_keypair();
        let root = publish(&src, &sk, 7);
        let dst = follower(&root);

        let mut requests = dst.listen_requests().unwrap();
        let peer = Arc::clone(&src);
        let target = Arc::clone(&dst);
        let responder = tokio::spawn(async move {
            let mut served = 0;
            while let Some(hash) = requests.recv().await {
                let val = peer.cxds().get_not_touch(&hash).unwrap().val;
                target.deliver(&val).unwrap();
                served += 1;
            }
            served
        });

        dst.fill(root.clone()).wait().await.unwrap();
        let expect = reachable(&src, &root);
        for h in &expect {
            assert_eq!(dst.cxds().get_not_touch(h).unwrap().rc, 1, "{h}");
        }
        assert!(!dst.is_pinned(&root.body.reg));
        assert_eq!(dst.wanted(), 0);
        responder.abort();
    }

    #[tokio::test]
    async fn close_terminates_and_releases_holds() {
        let src = container();
        let (_, sk) = generate_keypair();
        let root = publish(&src, &sk, 3);
        let dst = follower(&root);
        let reg = src.cxds().get_not_touch(&root.body.reg).unwrap().val;
        dst.deliver(&reg).unwrap();

        let mut requests = dst.listen_requests().unwrap();
        let filler = dst.fill(root.clone());
        // the registry is held before the first value is requested
        let first = requests.recv().await.unwrap();
        assert_ne!(first, root.body.reg);
        assert_eq!(dst.cxds().get_not_touch(&root.body.reg).unwrap().rc, 1);

        filler.close().await;
        assert_eq!(dst.cxds().get_not_touch(&root.body.reg).unwrap().rc, 0);
        assert!(!dst.is_pinned(&first));
        assert_eq!(dst.wanted(), 0);
    }

    /// A root whose folder points its file list at a blob that is not a
    /// Refs node. Returns the root and the hashes it holds once.
    fn publish_broken(c: &Container, sk: &SecKey) -> (Root, [Hash; 3]) {
        c.register::<Folder>();
        let reg = c.library();
        let reg_ref = c.save_registry(&reg).unwrap();
        let pack = c.pack(reg, PackFlags::NONE);
        let junk = pack.add(b"not a refs node").unwrap();
        let folder = pack
            .add_value(&Folder {
                name: "broken".into(),
                files: junk,
            })
            .unwrap();
        let root = c
            .save(sk, 0, vec![Dynamic::of::<Folder>(folder)], reg_ref)
            .unwrap();
        (root, [reg_ref, folder, junk])
    }

    #[tokio::test]
    async fn first_error_fails_the_fill_and_releases_holds() {
        let c = container();
        let (_, sk) = generate_keypair();
        let (root, held) = publish_broken(&c, &sk);

        let err = c.fill(root).wait().await.unwrap_err();
        assert!(matches!(err, ContainerError::Codec(_)));
        for h in held {
            assert_eq!(c.cxds().get_not_touch(&h).unwrap().rc, 1);
        }
    }

    #[tokio::test]
    async fn failed_fill_releases_holds_without_a_waiter() {
        let c = container();
        let (_, sk) = generate_keypair();
        let (root, held) = publish_broken(&c, &sk);

        drop(c.fill(root));
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        for h in held {
            assert_eq!(c.cxds().get_not_touch(&h).unwrap().rc, 1, "{h}");
        }
        assert_eq!(c.wanted(), 0);
    }

    #[tokio::test]
    async fn unbounded_workers_fill_too() {
        let c = Arc::new(
            Container::open(crate::Config {
                max_parallel: 0,
                ..crate::Config::in_memory()
            })
            .unwrap(),
        );
        let (_, sk) = generate_keypair();
        let root = publish(&c, &sk, 2);
        c.fill(root).wait().await.unwrap();
    }
}
