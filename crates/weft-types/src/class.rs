use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{TypeError, TypeResult};
use crate::object::ObjectKind;

/// Store-defined placement class.
///
/// Classes are referred to by short names (`"S1"`, `"SX"`, `"RP_2G1"`, ...)
/// in configuration and creation properties; only the numeric id is
/// embedded in an [`ObjectId`](crate::ObjectId).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectClass(u16);

/// Names and ids of the placement classes the store knows about.
const CLASS_TABLE: &[(&str, u16)] = &[
    ("S1", 1),
    ("S2", 2),
    ("S4", 3),
    ("S8", 4),
    ("S16", 5),
    ("S32", 6),
    ("SX", 7),
    ("RP_2G1", 16),
    ("RP_2G2", 17),
    ("RP_2GX", 18),
    ("RP_3G1", 19),
    ("RP_3GX", 20),
    ("EC_2P1G1", 32),
    ("EC_4P1G1", 33),
    ("EC_8P2G1", 34),
];

impl ObjectClass {
    pub const S1: ObjectClass = ObjectClass(1);
    pub const S2: ObjectClass = ObjectClass(2);
    pub const S4: ObjectClass = ObjectClass(3);
    pub const SX: ObjectClass = ObjectClass(7);

    /// Wrap a raw class id.
    pub const fn from_id(id: u16) -> Self {
        Self(id)
    }

    pub const fn id(self) -> u16 {
        self.0
    }

    /// Resolve a class by its store-defined name (case-insensitive).
    pub fn from_name(name: &str) -> TypeResult<Self> {
        CLASS_TABLE
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, id)| Self(*id))
            .ok_or_else(|| TypeError::UnknownObjectClass(name.to_string()))
    }

    /// The store-defined name, if the id is a known class.
    pub fn name(self) -> Option<&'static str> {
        CLASS_TABLE
            .iter()
            .find(|(_, id)| *id == self.0)
            .map(|(n, _)| *n)
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "class#{}", self.0),
        }
    }
}

impl FromStr for ObjectClass {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

impl TryFrom<String> for ObjectClass {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_name(&value)
    }
}

impl From<ObjectClass> for String {
    fn from(class: ObjectClass) -> Self {
        class.to_string()
    }
}

/// Key-ordering feature bits stored with an object identifier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ObjectFeatures(u16);

impl ObjectFeatures {
    pub const DKEY_HASHED: ObjectFeatures = ObjectFeatures(1 << 0);
    pub const DKEY_LEXICAL: ObjectFeatures = ObjectFeatures(1 << 1);
    pub const AKEY_HASHED: ObjectFeatures = ObjectFeatures(1 << 2);
    pub const AKEY_LEXICAL: ObjectFeatures = ObjectFeatures(1 << 3);

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub fn contains(self, other: ObjectFeatures) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ObjectFeatures {
    type Output = ObjectFeatures;

    fn bitor(self, rhs: Self) -> Self::Output {
        ObjectFeatures(self.0 | rhs.0)
    }
}

/// Chooses the placement class for a new object.
///
/// Precedence, highest first: an explicit override passed to the encoder,
/// the class named in the creation call's properties, the container-wide
/// default, and finally the kind-based default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClassResolver {
    pub container_default: Option<ObjectClass>,
}

impl ClassResolver {
    pub fn new(container_default: Option<ObjectClass>) -> Self {
        Self { container_default }
    }

    pub fn resolve(
        &self,
        kind: ObjectKind,
        explicit: Option<ObjectClass>,
        creation: Option<ObjectClass>,
    ) -> ObjectClass {
        explicit
            .or(creation)
            .or(self.container_default)
            .unwrap_or_else(|| kind.default_class())
    }
}
