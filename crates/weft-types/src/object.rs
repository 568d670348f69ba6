use std::fmt;

use serde::{Deserialize, Serialize};

use crate::class::{ObjectClass, ObjectFeatures};
use crate::error::{TypeError, TypeResult};

/// Bit position of the object-kind tag within the high word.
const KIND_SHIFT: u32 = 30;
/// Mask selecting the object-kind tag within the high word.
const KIND_MASK: u64 = 0b11 << KIND_SHIFT;
/// Bit position of the placement-class tag within the high word.
const CLASS_SHIFT: u32 = 32;
/// Bit position of the feature bits within the high word.
const FEATURE_SHIFT: u32 = 48;

/// The closed set of object kinds an identifier can name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    /// A container of named links to other objects.
    Group,
    /// An array-like object holding bulk data.
    Dataset,
    /// A committed type descriptor.
    Datatype,
    /// A key-value map object.
    Map,
}

impl ObjectKind {
    /// The two-bit tag this kind occupies in an identifier's high word.
    pub const fn tag(self) -> u64 {
        match self {
            ObjectKind::Group => 0,
            ObjectKind::Dataset => 1,
            ObjectKind::Datatype => 2,
            ObjectKind::Map => 3,
        }
    }

    fn from_tag(tag: u64) -> Self {
        match tag & 0b11 {
            0 => ObjectKind::Group,
            1 => ObjectKind::Dataset,
            2 => ObjectKind::Datatype,
            _ => ObjectKind::Map,
        }
    }

    /// Placement class used when nothing more specific is configured.
    pub fn default_class(self) -> ObjectClass {
        match self {
            ObjectKind::Dataset => ObjectClass::SX,
            _ => ObjectClass::S1,
        }
    }

    /// Key-ordering features objects of this kind are created with.
    pub fn features(self) -> ObjectFeatures {
        match self {
            ObjectKind::Group => ObjectFeatures::DKEY_LEXICAL | ObjectFeatures::AKEY_LEXICAL,
            _ => ObjectFeatures::DKEY_HASHED | ObjectFeatures::AKEY_LEXICAL,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectKind::Group => "group",
            ObjectKind::Dataset => "dataset",
            ObjectKind::Datatype => "datatype",
            ObjectKind::Map => "map",
        };
        f.write_str(name)
    }
}

/// Opaque 128-bit identifier of an object in the store.
///
/// The low word carries the raw index handed out by the identifier
/// allocator. The high word packs, from least to most significant, the
/// object-kind tag (bits 30..32), the placement-class id (bits 32..48) and
/// the key-ordering feature bits (bits 48..64).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    pub hi: u64,
    pub lo: u64,
}

impl ObjectId {
    /// Size of the binary token form.
    pub const TOKEN_LEN: usize = 16;

    /// Build an identifier from its two raw halves.
    pub const fn from_parts(lo: u64, hi: u64) -> Self {
        Self { hi, lo }
    }

    /// The null identifier. Represents "no object".
    pub const fn null() -> Self {
        Self { hi: 0, lo: 0 }
    }

    /// Returns `true` if this is the null identifier.
    pub fn is_null(&self) -> bool {
        self.hi == 0 && self.lo == 0
    }

    /// Pack an allocated index, an object kind and a placement class.
    pub fn encode(index: u64, kind: ObjectKind, class: ObjectClass) -> Self {
        let features = u64::from(kind.features().bits());
        let hi = (features << FEATURE_SHIFT)
            | (u64::from(class.id()) << CLASS_SHIFT)
            | (kind.tag() << KIND_SHIFT);
        Self { hi, lo: index }
    }

    /// The raw index this identifier was encoded from.
    pub fn index(&self) -> u64 {
        self.lo
    }

    /// Recover the object kind from the type bits.
    pub fn kind(&self) -> ObjectKind {
        ObjectKind::from_tag((self.hi & KIND_MASK) >> KIND_SHIFT)
    }

    /// Placement-class id embedded in the high word.
    pub fn class_id(&self) -> u16 {
        (self.hi >> CLASS_SHIFT) as u16
    }

    /// Feature bits embedded in the high word.
    pub fn features(&self) -> ObjectFeatures {
        ObjectFeatures::from_bits((self.hi >> FEATURE_SHIFT) as u16)
    }

    /// The 16-byte token form: `lo` then `hi`, both little-endian.
    pub fn to_token(&self) -> [u8; 16] {
        let mut token = [0u8; 16];
        token[..8].copy_from_slice(&self.lo.to_le_bytes());
        token[8..].copy_from_slice(&self.hi.to_le_bytes());
        token
    }

    /// Parse the 16-byte token form.
    pub fn from_token(token: &[u8]) -> TypeResult<Self> {
        if token.len() != Self::TOKEN_LEN {
            return Err(TypeError::InvalidLength {
                expected: Self::TOKEN_LEN,
                actual: token.len(),
            });
        }
        let mut lo = [0u8; 8];
        let mut hi = [0u8; 8];
        lo.copy_from_slice(&token[..8]);
        hi.copy_from_slice(&token[8..]);
        Ok(Self {
            lo: u64::from_le_bytes(lo),
            hi: u64::from_le_bytes(hi),
        })
    }

    /// Hex-encoded string: the high word then the low word, big-endian.
    pub fn to_hex(&self) -> String {
        format!("{:016x}{:016x}", self.hi, self.lo)
    }

    /// Parse from the representation produced by [`ObjectId::to_hex`].
    pub fn from_hex(s: &str) -> TypeResult<Self> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        if bytes.len() != 16 {
            return Err(TypeError::InvalidLength {
                expected: 16,
                actual: bytes.len(),
            });
        }
        let mut hi = [0u8; 8];
        let mut lo = [0u8; 8];
        hi.copy_from_slice(&bytes[..8]);
        lo.copy_from_slice(&bytes[8..]);
        Ok(Self {
            hi: u64::from_be_bytes(hi),
            lo: u64::from_be_bytes(lo),
        })
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({}:{})", self.kind(), self.lo)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn null_is_all_zeros() {
        let null = ObjectId::null();
        assert!(null.is_null());
        assert_eq!(null.to_token(), [0u8; 16]);
        assert_eq!(null.kind(), ObjectKind::Group);
    }

    #[test]
    fn encode_keeps_index_in_low_word() {
        let oid = ObjectId::encode(42, ObjectKind::Dataset, ObjectClass::SX);
        assert_eq!(oid.lo, 42);
        assert_eq!(oid.index(), 42);
        assert_eq!(oid.kind(), ObjectKind::Dataset);
        assert_eq!(oid.class_id(), ObjectClass::SX.id());
    }

    #[test]
    fn group_uses_lexical_dkeys() {
        let oid = ObjectId::encode(7, ObjectKind::Group, ObjectClass::S1);
        assert!(oid.features().contains(ObjectFeatures::DKEY_LEXICAL));
        assert!(!oid.features().contains(ObjectFeatures::DKEY_HASHED));

        let oid = ObjectId::encode(7, ObjectKind::Map, ObjectClass::S1);
        assert!(oid.features().contains(ObjectFeatures::DKEY_HASHED));
        assert!(oid.features().contains(ObjectFeatures::AKEY_LEXICAL));
    }

    #[test]
    fn token_is_lo_then_hi_little_endian() {
        let oid = ObjectId::from_parts(0x0102, 0x0a0b);
        let token = oid.to_token();
        assert_eq!(&token[..2], &[0x02, 0x01]);
        assert_eq!(&token[8..10], &[0x0b, 0x0a]);
    }

    #[test]
    fn from_token_rejects_wrong_length() {
        let err = ObjectId::from_token(&[0u8; 15]).unwrap_err();
        assert_eq!(
            err,
            TypeError::InvalidLength {
                expected: 16,
                actual: 15
            }
        );
    }

    #[test]
    fn hex_roundtrip() {
        let oid = ObjectId::encode(99, ObjectKind::Datatype, ObjectClass::S2);
        let hex = oid.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(ObjectId::from_hex(&hex).unwrap(), oid);
        assert_eq!(format!("{oid}"), hex);
    }

    #[test]
    fn from_hex_rejects_garbage() {
        assert!(matches!(
            ObjectId::from_hex("zz"),
            Err(TypeError::InvalidHex(_))
        ));
    }

    #[test]
    fn serde_roundtrip() {
        let oid = ObjectId::encode(5, ObjectKind::Map, ObjectClass::S4);
        let json = serde_json::to_string(&oid).unwrap();
        let parsed: ObjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(oid, parsed);
    }

    fn any_kind() -> impl Strategy<Value = ObjectKind> {
        prop_oneof![
            Just(ObjectKind::Group),
            Just(ObjectKind::Dataset),
            Just(ObjectKind::Datatype),
            Just(ObjectKind::Map),
        ]
    }

    proptest! {
        #[test]
        fn encode_preserves_index_kind_and_class(
            index in any::<u64>(),
            kind in any_kind(),
            class_id in any::<u16>(),
        ) {
            let class = ObjectClass::from_id(class_id);
            let oid = ObjectId::encode(index, kind, class);
            prop_assert_eq!(oid.index(), index);
            prop_assert_eq!(oid.kind(), kind);
            prop_assert_eq!(oid.class_id(), class_id);
            prop_assert_eq!(oid.features(), kind.features());
            prop_assert_eq!(ObjectId::from_token(&oid.to_token()).unwrap(), oid);
        }
    }
}
