use cxo_codec::{CodecError, CodecResult, Decode, Decoder, Encode, Encoder};
use cxo_types::Hash;

/// Index of a node in the arena of a tree.
pub(crate) type NodeId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Leaf {
    pub hash: Hash,
    pub deleted: bool,
}

#[derive(Clone, Debug)]
pub(crate) enum Body {
    Leaves(Vec<Leaf>),
    Branches(Vec<NodeId>),
}

/// A node of the arena. Level 0 nodes hold leaves.
///
/// An unloaded node knows only its hash; `length` and `body` are filled
/// when it is first needed.
#[derive(Clone, Debug)]
pub(crate) struct Node {
    pub parent: Option<NodeId>,
    pub level: u32,
    pub hash: Hash,
    pub length: usize,
    pub loaded: bool,
    /// The hash no longer matches the content.
    pub dirty: bool,
    /// This session stored the encoding under `hash` and holds it once.
    pub owned: bool,
    pub body: Body,
}

impl Node {
    pub fn stub(parent: NodeId, level: u32, hash: Hash) -> Self {
        Self {
            parent: Some(parent),
            level,
            hash,
            length: 0,
            loaded: false,
            dirty: false,
            owned: false,
            body: Body::Branches(Vec::new()),
        }
    }

    pub fn empty(parent: Option<NodeId>, level: u32) -> Self {
        Self {
            parent,
            level,
            hash: Hash::ZERO,
            length: 0,
            loaded: true,
            dirty: true,
            owned: false,
            body: Self::empty_body(level),
        }
    }

    pub fn empty_body(level: u32) -> Body {
        if level == 0 {
            Body::Leaves(Vec::new())
        } else {
            Body::Branches(Vec::new())
        }
    }
}

/// Encoded top node of a Refs tree.
///
/// Layout: `[4: depth][4: degree][4: length][4: count][count * 32: hashes]`.
/// At depth 0 the hashes are elements; otherwise they name branch nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootNode {
    pub depth: u32,
    pub degree: u32,
    pub length: u32,
    pub hashes: Vec<Hash>,
}

impl Encode for RootNode {
    fn encode_into(&self, enc: &mut Encoder) {
        enc.put_u32(self.depth)
            .put_u32(self.degree)
            .put_u32(self.length)
            .put_hashes(&self.hashes);
    }
}

impl Decode for RootNode {
    fn decode_from(dec: &mut Decoder<'_>) -> CodecResult<Self> {
        let node = Self {
            depth: dec.get_u32()?,
            degree: dec.get_u32()?,
            length: dec.get_u32()?,
            hashes: dec.get_hashes()?,
        };
        if node.degree < 2 {
            return Err(CodecError::InvalidField {
                field: "degree",
                reason: format!("{} < 2", node.degree),
            });
        }
        Ok(node)
    }
}

/// Encoded non-top node. Layout: `[4: length][4: count][count * 32]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchNode {
    pub length: u32,
    pub hashes: Vec<Hash>,
}

impl Encode for BranchNode {
    fn encode_into(&self, enc: &mut Encoder) {
        enc.put_u32(self.length).put_hashes(&self.hashes);
    }
}

impl Decode for BranchNode {
    fn decode_from(dec: &mut Decoder<'_>) -> CodecResult<Self> {
        Ok(Self {
            length: dec.get_u32()?,
            hashes: dec.get_hashes()?,
        })
    }
}

/// `base^exp` by repeated squaring, saturating at `u64::MAX`.
pub fn pow(base: u64, mut exp: u32) -> u64 {
    let mut result: u64 = 1;
    let mut base = base;
    while exp > 0 {
        if exp & 1 == 1 {
            result = result.saturating_mul(base);
        }
        exp >>= 1;
        if exp > 0 {
            base = base.saturating_mul(base);
        }
    }
    result
}

/// Number of elements a tree of this degree and depth can hold.
pub fn max_capacity(degree: u32, depth: u32) -> u64 {
    pow(u64::from(degree), depth.saturating_add(1))
}

/// Smallest depth whose capacity is at least `length`.
pub fn depth_to_fit(degree: u32, length: usize) -> u32 {
    let mut depth = 0;
    while max_capacity(degree, depth) < length as u64 {
        depth += 1;
    }
    depth
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pow_by_squaring() {
        assert_eq!(pow(2, 0), 1);
        assert_eq!(pow(2, 10), 1024);
        assert_eq!(pow(16, 3), 4096);
        assert_eq!(pow(3, 5), 243);
        assert_eq!(pow(16, 40), u64::MAX);
    }

    #[test]
    fn depth_fit() {
        assert_eq!(depth_to_fit(2, 0), 0);
        assert_eq!(depth_to_fit(2, 2), 0);
        assert_eq!(depth_to_fit(2, 3), 1);
        assert_eq!(depth_to_fit(2, 4), 1);
        assert_eq!(depth_to_fit(2, 5), 2);
        assert_eq!(depth_to_fit(16, 256), 1);
        assert_eq!(depth_to_fit(16, 257), 2);
    }

    #[test]
    fn node_layouts() {
        let root = RootNode {
            depth: 1,
            degree: 16,
            length: 20,
            hashes: vec![Hash::sum(b"a"), Hash::sum(b"b")],
        };
        let bytes = root.encode();
        assert_eq!(bytes.len(), 16 + 64);
        assert_eq!(RootNode::decode(&bytes).unwrap(), root);

        let branch = BranchNode {
            length: 1,
            hashes: vec![Hash::sum(b"x")],
        };
        assert_eq!(branch.encode().len(), 8 + 32);
    }

    #[test]
    fn degree_below_two_is_rejected() {
        let root = RootNode {
            depth: 0,
            degree: 1,
            length: 0,
            hashes: vec![],
        };
        assert!(RootNode::decode(&root.encode()).is_err());
    }
}
