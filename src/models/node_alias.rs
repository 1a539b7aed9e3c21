//! Node aliases: compact integer stand-ins for 32-byte storage node ids.
//!
//! A segment's placements are stored as two varint blobs, piece numbers and
//! node aliases, where the i-th alias belongs to the i-th piece.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::errors::CodecError;

/// Upper bound on pieces per segment that the encodings are exercised with.
pub const MAX_PIECE_COUNT: usize = 256;

/// Alias assigned to a storage node by the node alias table. Starts at 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAlias(pub u32);

/// Ordered alias sequence, one entry per piece.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAliases(pub Vec<NodeAlias>);

impl NodeAliases {
    /// Packs aliases as consecutive unsigned LEB128 varints, no length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.0.len() * 2);
        for alias in &self.0 {
            put_uvarint(&mut buf, u64::from(alias.0));
        }
        buf
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, CodecError> {
        let mut aliases = Vec::new();
        while data.has_remaining() {
            let value = get_uvarint(&mut data)?;
            let alias = u32::try_from(value).map_err(|_| CodecError::Overflow("node alias"))?;
            aliases.push(NodeAlias(alias));
        }
        Ok(Self(aliases))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<NodeAlias> for NodeAliases {
    fn from_iter<I: IntoIterator<Item = NodeAlias>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

pub(crate) fn put_uvarint(buf: &mut impl BufMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;

        if value != 0 {
            byte |= 0x80;
        }

        buf.put_u8(byte);

        if value == 0 {
            break;
        }
    }
}

pub(crate) fn get_uvarint(buf: &mut impl Buf) -> Result<u64, CodecError> {
    let mut value: u64 = 0;
    let mut shift = 0;

    loop {
        if !buf.has_remaining() {
            return Err(CodecError::Truncated);
        }
        let byte = buf.get_u8();
        if shift == 63 && byte > 1 {
            return Err(CodecError::Overflow("u64"));
        }
        value |= u64::from(byte & 0x7F) << shift;

        if byte & 0x80 == 0 {
            return Ok(value);
        }

        shift += 7;
        if shift > 63 {
            return Err(CodecError::Overflow("u64"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_aliases_encode_to_empty_blob() {
        let aliases = NodeAliases::default();
        let encoded = aliases.encode();
        assert!(encoded.is_empty());
        assert_eq!(NodeAliases::decode(&encoded).unwrap(), aliases);
    }

    #[test]
    fn test_small_aliases_take_one_byte() {
        let aliases: NodeAliases = [1, 2, 127].into_iter().map(NodeAlias).collect();
        assert_eq!(aliases.encode(), vec![1, 2, 127]);
    }

    #[test]
    fn test_max_piece_count_round_trip() {
        let aliases: NodeAliases = (0..MAX_PIECE_COUNT as u32)
            .map(|i| NodeAlias(i * 977 + 1))
            .collect();
        let decoded = NodeAliases::decode(&aliases.encode()).unwrap();
        assert_eq!(decoded.len(), MAX_PIECE_COUNT);
        assert_eq!(decoded, aliases);
    }

    #[test]
    fn test_order_is_preserved() {
        let aliases: NodeAliases = [300, 5, u32::MAX, 1].into_iter().map(NodeAlias).collect();
        assert_eq!(NodeAliases::decode(&aliases.encode()).unwrap(), aliases);
    }

    #[test]
    fn test_truncated_varint_is_rejected() {
        let mut encoded = NodeAliases(vec![NodeAlias(300)]).encode();
        encoded.pop();
        assert_eq!(NodeAliases::decode(&encoded), Err(CodecError::Truncated));
    }

    #[test]
    fn test_alias_above_u32_is_rejected() {
        let mut buf = Vec::new();
        put_uvarint(&mut buf, u64::from(u32::MAX) + 1);
        assert_eq!(
            NodeAliases::decode(&buf),
            Err(CodecError::Overflow("node alias"))
        );
    }
}
