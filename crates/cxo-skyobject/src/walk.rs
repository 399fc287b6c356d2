//! Synchronous traversal of everything a root body references.

use cxo_codec::Decode;
use cxo_types::Hash;

use crate::dynamic::Dynamic;
use crate::error::{SkyError, SkyResult};
use crate::pack::Pack;
use crate::refs::{BranchNode, RootNode};
use crate::registry::{Reference, SchemaRef};
use crate::root::RootBody;

/// An object reached by a [`Walker`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visit {
    /// The encoded registry of the root.
    Registry(Hash),
    /// A typed value.
    Value { schema: SchemaRef, hash: Hash },
    /// A node of a Refs tree whose elements have `schema`.
    RefsNode { schema: SchemaRef, hash: Hash },
}

impl Visit {
    pub fn hash(&self) -> Hash {
        match self {
            Self::Registry(hash) | Self::Value { hash, .. } | Self::RefsNode { hash, .. } => *hash,
        }
    }
}

/// Called for each reached object before its content is read. Returning
/// `false` skips what the object references; [`SkyError::StopIteration`]
/// ends the walk without an error.
pub type WalkFn<'a> = dyn FnMut(Visit) -> SkyResult<bool> + 'a;

/// Depth-first walk over a root's object graph, reading through a
/// [`Pack`] whose registry describes the root's values. Blank references
/// are skipped.
pub struct Walker<'a> {
    pack: &'a Pack,
}

impl<'a> Walker<'a> {
    pub fn new(pack: &'a Pack) -> Self {
        Self { pack }
    }

    pub fn walk_root(&self, body: &RootBody, visit: &mut WalkFn<'_>) -> SkyResult<()> {
        match self.root_refs(body, visit) {
            Err(SkyError::StopIteration) => Ok(()),
            other => other,
        }
    }

    fn root_refs(&self, body: &RootBody, visit: &mut WalkFn<'_>) -> SkyResult<()> {
        if !body.reg.is_zero() {
            visit(Visit::Registry(body.reg))?;
        }
        for d in &body.refs {
            self.reference(Reference::Dynamic(*d), visit)?;
        }
        Ok(())
    }

    /// Walk from a single reference.
    pub fn walk(&self, reference: Reference, visit: &mut WalkFn<'_>) -> SkyResult<()> {
        match self.reference(reference, visit) {
            Err(SkyError::StopIteration) => Ok(()),
            other => other,
        }
    }

    fn reference(&self, reference: Reference, visit: &mut WalkFn<'_>) -> SkyResult<()> {
        if reference.is_blank() {
            return Ok(());
        }
        match reference {
            Reference::Ref { schema, hash } | Reference::Dynamic(Dynamic { schema, hash }) => {
                self.value(schema, hash, visit)
            }
            Reference::Refs { schema, hash } => {
                if !visit(Visit::RefsNode { schema, hash })? {
                    return Ok(());
                }
                let top = RootNode::decode(&self.pack.get(&hash)?)?;
                self.refs_level(schema, top.depth, &top.hashes, visit)
            }
        }
    }

    fn value(&self, schema: SchemaRef, hash: Hash, visit: &mut WalkFn<'_>) -> SkyResult<()> {
        if !visit(Visit::Value { schema, hash })? {
            return Ok(());
        }
        let val = self.pack.get(&hash)?;
        let inner = self.pack.registry().schema(&schema)?.references(&val)?;
        for r in inner {
            self.reference(r, visit)?;
        }
        Ok(())
    }

    fn refs_level(
        &self,
        schema: SchemaRef,
        level: u32,
        hashes: &[Hash],
        visit: &mut WalkFn<'_>,
    ) -> SkyResult<()> {
        for &hash in hashes {
            if hash.is_zero() {
                continue;
            }
            if level == 0 {
                self.value(schema, hash, visit)?;
                continue;
            }
            if !visit(Visit::RefsNode { schema, hash })? {
                continue;
            }
            let node = BranchNode::decode(&self.pack.get(&hash)?)?;
            self.refs_level(schema, level - 1, &node.hashes, visit)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use cxo_cxds::InMemoryCxds;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::dynamic::Ref;
    use crate::pack::PackFlags;
    use crate::refs::Refs;
    use crate::registry::{Registry, Value};
    use crate::split::Chunk;

    #[derive(Serialize, Deserialize)]
    struct Album {
        title: String,
        cover: Ref,
        tracks: Hash,
    }

    impl Value for Album {
        const SCHEMA: &'static str = "test.Album";

        fn references(&self) -> Vec<Reference> {
            vec![
                Reference::Ref {
                    schema: Chunk::schema_ref(),
                    hash: self.cover.hash,
                },
                Reference::Refs {
                    schema: Chunk::schema_ref(),
                    hash: self.tracks,
                },
            ]
        }
    }

    fn pack() -> Pack {
        let mut reg = Registry::new();
        reg.register::<Album>();
        reg.register::<Chunk>();
        Pack::new(Arc::new(InMemoryCxds::new()), Arc::new(reg), PackFlags::NONE, 2)
    }

    fn chunk(p: &Pack, n: u8) -> Hash {
        p.add_value(&Chunk { data: vec![n; 4] }).unwrap()
    }

    /// Root -> album -> (cover, refs of three tracks).
    fn graph(p: &Pack) -> (RootBody, HashSet<Hash>) {
        let mut expect = HashSet::new();
        let mut tracks = Refs::new();
        let hashes: Vec<Hash> = (1..=3).map(|n| chunk(p, n)).collect();
        tracks.append_hashes(p, &hashes).unwrap();
        expect.extend(hashes);
        let tracks_hash = tracks.hash(p).unwrap();
        expect.insert(tracks_hash);

        let cover = chunk(p, 9);
        expect.insert(cover);
        let album = p
            .add_value(&Album {
                title: "x".into(),
                cover: Ref::new(cover),
                tracks: tracks_hash,
            })
            .unwrap();
        expect.insert(album);

        let body = RootBody {
            refs: vec![Dynamic::of::<Album>(album), Dynamic::default()],
            reg: p.registry().reference(),
            ..RootBody::default()
        };
        expect.insert(body.reg);
        (body, expect)
    }

    #[test]
    fn walk_reaches_every_reference() {
        let p = pack();
        let (body, expect) = graph(&p);
        let mut seen = HashSet::new();
        let mut nodes = 0;
        Walker::new(&p)
            .walk_root(&body, &mut |v| {
                if matches!(v, Visit::RefsNode { .. }) {
                    nodes += 1;
                }
                seen.insert(v.hash());
                Ok(true)
            })
            .unwrap();
        // three tracks at degree 2 need a root and two leaf nodes
        assert_eq!(nodes, 3);
        assert!(expect.is_subset(&seen));
        assert_eq!(seen.len(), expect.len() + 2);
    }

    #[test]
    fn returning_false_prunes() {
        let p = pack();
        let (body, _) = graph(&p);
        let mut values = 0;
        Walker::new(&p)
            .walk_root(&body, &mut |v| {
                values += 1;
                Ok(!matches!(v, Visit::Value { .. }))
            })
            .unwrap();
        // registry and album
        assert_eq!(values, 2);
    }

    #[test]
    fn stop_iteration_ends_walk() {
        let p = pack();
        let (body, _) = graph(&p);
        let mut calls = 0;
        Walker::new(&p)
            .walk_root(&body, &mut |_| {
                calls += 1;
                Err(SkyError::StopIteration)
            })
            .unwrap();
        assert_eq!(calls, 1);
    }

    #[test]
    fn missing_objects_fail_the_walk() {
        let p = pack();
        let body = RootBody {
            refs: vec![Dynamic::of::<Album>(Hash::sum(b"missing"))],
            ..RootBody::default()
        };
        let err = Walker::new(&p)
            .walk_root(&body, &mut |_| Ok(true))
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
