use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use cxo_codec::{Decode, Encode};
use cxo_crypto::{verify_hash, SecKey};
use cxo_cxds::{Cxds, FileCxds, InMemoryCxds, LsmCxds};
use cxo_idxdb::{FileIdxDb, IdxDb, InMemoryIdxDb, LsmIdxDb};
use cxo_skyobject::{
    Dynamic, Pack, PackFlags, Registry, RegistryRef, Root, RootBody, Schema, SchemaRef, Value,
};
use cxo_types::{now_nanos, Hash, PubKey, Sig};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::{Config, Engine};
use crate::error::{ContainerError, ContainerResult};
use crate::filler::Filler;

/// Capacity of the request channel.
const REQUEST_BUFFER: usize = 1024;

const CXDS_FILE: &str = "cxds.db";
const IDX_FILE: &str = "idx.db";
const CXDS_LSM_DIR: &str = "cxds.lsm";
const IDX_LSM_DIR: &str = "idx.lsm";

type Pins = Arc<Mutex<HashMap<Hash, usize>>>;
type Wants = Arc<Mutex<HashMap<Hash, Vec<oneshot::Sender<()>>>>>;

struct Registries {
    /// Schemas this process can decode.
    library: Registry,
    /// Registries loaded from CXDS, by reference.
    loaded: HashMap<RegistryRef, Arc<Registry>>,
}

/// One CXDS and one index, plus everything needed to read, write and
/// complete roots.
///
/// # Holds
///
/// Every root stored through [`save`](Self::save) or
/// [`receive_root`](Self::receive_root) holds its body once. GC releases
/// that hold together with the root record. Objects handed over by peers
/// through [`deliver`](Self::deliver) are stored without a hold; a filler
/// takes its own when it reads them.
pub struct Container {
    config: Config,
    cxds: Arc<dyn Cxds>,
    idx: Arc<dyn IdxDb>,
    registries: Mutex<Registries>,
    pins: Pins,
    wants: Wants,
    requests: mpsc::Sender<Hash>,
    listener: Mutex<Option<mpsc::Receiver<Hash>>>,
    /// Serializes seq assignment.
    save_lock: Mutex<()>,
    closed: AtomicBool,
}

impl Container {
    /// Open the databases the config names.
    pub fn open(config: Config) -> ContainerResult<Self> {
        config.validate()?;
        let (cxds, idx): (Arc<dyn Cxds>, Arc<dyn IdxDb>) = if config.in_memory_db {
            (
                Arc::new(InMemoryCxds::with_scan_count(config.scan_count)),
                Arc::new(InMemoryIdxDb::new()),
            )
        } else {
            fs::create_dir_all(&config.data_dir)?;
            let dir = &config.data_dir;
            match config.engine {
                Engine::File => (
                    Arc::new(FileCxds::open_with(dir.join(CXDS_FILE), config.scan_count)?),
                    Arc::new(FileIdxDb::open(dir.join(IDX_FILE))?),
                ),
                Engine::Lsm => (
                    Arc::new(LsmCxds::open_with(dir.join(CXDS_LSM_DIR), config.scan_count)?),
                    Arc::new(LsmIdxDb::open(dir.join(IDX_LSM_DIR))?),
                ),
            }
        };
        info!(
            data_dir = %config.data_dir.display(),
            in_memory = config.in_memory_db,
            engine = ?config.engine,
            "container opened"
        );
        Self::with_backends(config, cxds, idx)
    }

    /// Build a container over already opened backends.
    pub fn with_backends(
        config: Config,
        cxds: Arc<dyn Cxds>,
        idx: Arc<dyn IdxDb>,
    ) -> ContainerResult<Self> {
        config.validate()?;
        if !cxds.is_safe_closed() || !idx.is_safe_closed() {
            warn!("databases were not closed safely last time");
        }
        let (requests, listener) = mpsc::channel(REQUEST_BUFFER);
        Ok(Self {
            config,
            cxds,
            idx,
            registries: Mutex::new(Registries {
                library: Registry::new(),
                loaded: HashMap::new(),
            }),
            pins: Arc::new(Mutex::new(HashMap::new())),
            wants: Arc::new(Mutex::new(HashMap::new())),
            requests,
            listener: Mutex::new(Some(listener)),
            save_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cxds(&self) -> &Arc<dyn Cxds> {
        &self.cxds
    }

    pub fn idx(&self) -> &Arc<dyn IdxDb> {
        &self.idx
    }

    // ---- Registry ----

    /// Make a typed value decodable by this container. Idempotent.
    pub fn register<T: Value>(&self) -> SchemaRef {
        self.lock_registries().library.register::<T>()
    }

    pub fn register_schema(&self, schema: Arc<dyn Schema>) -> SchemaRef {
        self.lock_registries().library.register_schema(schema)
    }

    /// Snapshot of every schema registered so far.
    pub fn library(&self) -> Arc<Registry> {
        Arc::new(self.lock_registries().library.clone())
    }

    /// Store a registry, holding it once more.
    pub fn save_registry(&self, reg: &Registry) -> ContainerResult<RegistryRef> {
        let val = reg.try_encode()?;
        let key = Hash::sum(&val);
        self.cxds.set(&key, &val)?;
        self.lock_registries()
            .loaded
            .insert(key, Arc::new(reg.clone()));
        debug!(registry = %key, schemas = reg.len(), "registry saved");
        Ok(key)
    }

    /// Load a registry, resolving its schema names against the library.
    /// The zero reference is the empty registry.
    pub fn registry(&self, reference: &RegistryRef) -> ContainerResult<Arc<Registry>> {
        if reference.is_zero() {
            return Ok(Arc::new(Registry::new()));
        }
        if let Some(reg) = self.lock_registries().loaded.get(reference) {
            return Ok(Arc::clone(reg));
        }
        let val = self.cxds.get(reference)?.val;
        let mut regs = self.lock_registries();
        let reg = Arc::new(Registry::load(&val, &regs.library)?);
        regs.loaded.insert(*reference, Arc::clone(&reg));
        Ok(reg)
    }

    fn lock_registries(&self) -> std::sync::MutexGuard<'_, Registries> {
        self.registries.lock().expect("registry lock poisoned")
    }

    // ---- Packing ----

    /// A pack for building new roots with `registry`.
    pub fn pack(&self, registry: Arc<Registry>, flags: PackFlags) -> Pack {
        Pack::with_options(
            Arc::clone(&self.cxds),
            registry,
            self.config.pack_options(flags),
        )
    }

    /// A pack for reading and editing the values of `root`.
    pub fn unpack(&self, root: &Root, flags: PackFlags) -> ContainerResult<Pack> {
        let registry = self.registry(&root.body.reg)?;
        Ok(self.pack(registry, flags))
    }

    // ---- Roots ----

    /// Start following a feed.
    pub fn add_feed(&self, pk: &PubKey) -> ContainerResult<()> {
        self.idx.add_feed(pk)?;
        Ok(())
    }

    /// Stop following a feed, releasing the bodies of its roots.
    pub fn del_feed(&self, pk: &PubKey) -> ContainerResult<()> {
        let mut nonces = Vec::new();
        self.idx.iterate_heads(pk, &mut |nonce| {
            nonces.push(nonce);
            Ok(())
        })?;
        for nonce in nonces {
            let mut bodies = Vec::new();
            self.idx.ascend_roots(pk, nonce, &mut |_, root| {
                bodies.push(root.hash);
                Ok(())
            })?;
            for hash in bodies {
                self.release(&hash)?;
            }
        }
        self.idx.del_feed(pk)?;
        info!(feed = %pk, "feed removed");
        Ok(())
    }

    /// Publish a new root of head `nonce`: the next seq, linked to the
    /// previous root, signed with `sk`.
    pub fn save(
        &self,
        sk: &SecKey,
        nonce: u64,
        refs: Vec<Dynamic>,
        reg: RegistryRef,
    ) -> ContainerResult<Root> {
        let pk = sk.pub_key();
        let _guard = self.save_lock.lock().expect("save lock poisoned");
        self.idx.add_feed(&pk)?;
        self.idx.add_head(&pk, nonce)?;
        let (seq, prev) = match self.idx.last_root(&pk, nonce)? {
            Some((seq, last)) => (seq + 1, last.hash),
            None => (0, Hash::ZERO),
        };

        let body = RootBody {
            refs,
            reg,
            pub_key: pk,
            nonce,
            seq,
            time: now_nanos(),
            prev,
        };
        let val = body.try_encode()?;
        let hash = Hash::sum(&val);
        self.cxds.set(&hash, &val)?;
        let sig = sk.sign_hash(&hash);
        if let Err(e) = self.idx.set_root(&pk, nonce, seq, &hash, &sig) {
            self.release(&hash)?;
            return Err(e.into());
        }
        info!(feed = %pk, nonce, seq, root = %hash, "root saved");
        Ok(Root { body, hash, sig })
    }

    /// Read a root by position, touching its record.
    pub fn root(&self, pk: &PubKey, nonce: u64, seq: u64) -> ContainerResult<Root> {
        let rec = self.idx.get_root(pk, nonce, seq)?;
        self.load_root(rec.hash, rec.sig)
    }

    /// The root with the greatest seq of a head.
    pub fn last_root(&self, pk: &PubKey, nonce: u64) -> ContainerResult<Option<Root>> {
        match self.idx.last_root(pk, nonce)? {
            Some((_, rec)) => Ok(Some(self.load_root(rec.hash, rec.sig)?)),
            None => Ok(None),
        }
    }

    fn load_root(&self, hash: Hash, sig: Sig) -> ContainerResult<Root> {
        let body = RootBody::decode(&self.cxds.get(&hash)?.val)?;
        Ok(Root { body, hash, sig })
    }

    /// Import a root received from a peer. The feed must be followed and
    /// the signature must verify; the head is created on demand. Receiving
    /// a known root again changes nothing.
    pub fn receive_root(&self, val: &[u8], sig: &Sig) -> ContainerResult<Root> {
        let body = RootBody::decode(val)?;
        let hash = Hash::sum(val);
        let pk = body.pub_key;
        if !self.idx.has_feed(&pk)? {
            return Err(ContainerError::NoSuchFeed(pk));
        }
        verify_hash(&pk, &hash, sig).map_err(|_| ContainerError::InvalidSignature(hash))?;
        self.idx.add_head(&pk, body.nonce)?;
        if self.idx.has_root(&pk, body.nonce, body.seq)? {
            let known = self.idx.get_not_touch_root(&pk, body.nonce, body.seq)?;
            return self.load_root(known.hash, known.sig);
        }

        self.cxds.set(&hash, val)?;
        if let Err(e) = self.idx.set_root(&pk, body.nonce, body.seq, &hash, sig) {
            self.release(&hash)?;
            return Err(e.into());
        }
        debug!(feed = %pk, nonce = body.nonce, seq = body.seq, root = %hash, "root received");
        Ok(Root {
            body,
            hash,
            sig: *sig,
        })
    }

    /// Drop one hold; missing objects are ignored.
    pub(crate) fn release(&self, key: &Hash) -> ContainerResult<()> {
        match self.cxds.incr(key, -1) {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ---- Pins and wants ----

    /// Keep `hash` from being swept even with no holds. Pins nest.
    pub fn pin(&self, hash: Hash) {
        pin(&self.pins, hash);
    }

    pub fn unpin(&self, hash: &Hash) {
        unpin(&self.pins, hash);
    }

    pub fn is_pinned(&self, hash: &Hash) -> bool {
        self.pins
            .lock()
            .expect("pin lock poisoned")
            .contains_key(hash)
    }

    /// Register interest in an object that is not stored yet. The object
    /// stays pinned while the returned [`Want`] lives; dropping it takes
    /// the registration back.
    pub fn want(&self, hash: Hash) -> Want {
        let (tx, rx) = oneshot::channel();
        let mut wants = self.wants.lock().expect("want lock poisoned");
        let waiting = wants.entry(hash).or_default();
        waiting.retain(|s| !s.is_closed());
        waiting.push(tx);
        pin(&self.pins, hash);
        Want {
            hash,
            rx,
            pins: Arc::clone(&self.pins),
            wants: Arc::clone(&self.wants),
        }
    }

    /// Number of objects somebody is waiting for.
    pub fn wanted(&self) -> usize {
        self.wants.lock().expect("want lock poisoned").len()
    }

    /// Store an object received from a peer and wake everyone waiting for
    /// it. The object is stored without a hold.
    pub fn deliver(&self, val: &[u8]) -> ContainerResult<Hash> {
        let key = Hash::sum(val);
        self.cxds.set(&key, val)?;
        self.cxds.incr(&key, -1)?;
        let waiting = self
            .wants
            .lock()
            .expect("want lock poisoned")
            .remove(&key)
            .unwrap_or_default();
        for tx in waiting {
            let _ = tx.send(());
        }
        Ok(key)
    }

    /// Take the receiving end of the request channel. Fillers publish the
    /// hashes they miss there.
    pub fn listen_requests(&self) -> ContainerResult<mpsc::Receiver<Hash>> {
        self.listener
            .lock()
            .expect("listener lock poisoned")
            .take()
            .ok_or(ContainerError::AlreadyListen)
    }

    pub(crate) async fn request(&self, hash: Hash) -> ContainerResult<()> {
        self.requests
            .send(hash)
            .await
            .map_err(|_| ContainerError::Closed)
    }

    /// Start fetching everything `root` references.
    pub fn fill(self: &Arc<Self>, root: Root) -> Filler {
        Filler::start(Arc::clone(self), root)
    }

    // ---- Lifecycle ----

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close both databases. Pending wants fail with
    /// [`ContainerError::Terminated`]. Closing twice is a no-op.
    pub fn close(&self) -> ContainerResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.wants.lock().expect("want lock poisoned").clear();
        let cxds = self.cxds.close();
        let idx = self.idx.close();
        info!("container closed");
        cxds?;
        idx?;
        Ok(())
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn pin(pins: &Pins, hash: Hash) {
    *pins.lock().expect("pin lock poisoned").entry(hash).or_default() += 1;
}

fn unpin(pins: &Pins, hash: &Hash) {
    let mut pins = pins.lock().expect("pin lock poisoned");
    if let Some(n) = pins.get_mut(hash) {
        *n -= 1;
        if *n == 0 {
            pins.remove(hash);
        }
    }
}

/// Pending interest in one object; see [`Container::want`].
pub struct Want {
    hash: Hash,
    rx: oneshot::Receiver<()>,
    pins: Pins,
    wants: Wants,
}

impl Want {
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// Resolves once the object is delivered.
    pub async fn arrived(&mut self) -> ContainerResult<()> {
        (&mut self.rx).await.map_err(|_| ContainerError::Terminated)
    }
}

impl Drop for Want {
    fn drop(&mut self) {
        self.rx.close();
        let mut wants = self.wants.lock().expect("want lock poisoned");
        if let Some(waiting) = wants.get_mut(&self.hash) {
            waiting.retain(|s| !s.is_closed());
            if waiting.is_empty() {
                wants.remove(&self.hash);
            }
        }
        drop(wants);
        unpin(&self.pins, &self.hash);
    }
}
