//! Entity identifiers.
//!
//! Identifiers are modelled as the closed sum type [`EntityId`]. Each entity
//! type declares the [`IdKind`] it uses; the context generates a value of that
//! kind the first time an unsaved entity is written, and never touches the
//! identifier again afterwards.
//!
//! Sequence identifiers come from an in-process [`SequenceGenerator`] that
//! hands out values with a single atomic `fetch_add`, so concurrent saves can
//! never observe the same number.

use bson::{
    Binary, Bson,
    oid::ObjectId,
    spec::BinarySubtype,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{
    fmt,
    sync::atomic::{AtomicI64, Ordering},
};
use uuid::Uuid;

use crate::error::{OdmError, OdmResult};

/// The identifier representation declared by an entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    /// Monotonic 64-bit integers handed out by an in-process counter.
    Sequence,
    /// Random 128-bit values (UUID v4), stored as BSON binary subtype 4.
    Random,
    /// Strings. Generated values are ObjectId hex strings.
    String,
    /// Store-native ObjectIds.
    ObjectId,
}

impl IdKind {
    /// Returns the unset value of this kind.
    pub fn unset(self) -> EntityId {
        match self {
            IdKind::Sequence => EntityId::Sequence(0),
            IdKind::Random => EntityId::Random(Uuid::nil()),
            IdKind::String => EntityId::String(String::new()),
            IdKind::ObjectId => EntityId::ObjectId(ObjectId::from_bytes([0; 12])),
        }
    }

    /// Generates a fresh identifier of this kind.
    ///
    /// Sequence identifiers are drawn from `sequence`; the other kinds ignore it.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Initialization`] when a sequence identifier is
    /// requested without a generator.
    pub fn generate(self, sequence: Option<&SequenceGenerator>) -> OdmResult<EntityId> {
        Ok(match self {
            IdKind::Sequence => {
                let generator = sequence.ok_or_else(|| {
                    OdmError::Initialization("sequence identifiers need a generator".into())
                })?;
                EntityId::Sequence(generator.next())
            }
            IdKind::Random => EntityId::Random(Uuid::new_v4()),
            IdKind::String => EntityId::String(ObjectId::new().to_hex()),
            IdKind::ObjectId => EntityId::ObjectId(ObjectId::new()),
        })
    }

    fn name(self) -> &'static str {
        match self {
            IdKind::Sequence => "sequence",
            IdKind::Random => "random",
            IdKind::String => "string",
            IdKind::ObjectId => "ObjectId",
        }
    }
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An entity identifier.
///
/// Equality is structural: two identifiers are equal only if they have the
/// same kind and the same value. [`Display`](fmt::Display) and
/// [`EntityId::parse`] form a lossless string round trip for every kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityId {
    Sequence(i64),
    Random(Uuid),
    String(String),
    ObjectId(ObjectId),
}

impl EntityId {
    /// Returns the kind of this identifier.
    pub fn kind(&self) -> IdKind {
        match self {
            EntityId::Sequence(_) => IdKind::Sequence,
            EntityId::Random(_) => IdKind::Random,
            EntityId::String(_) => IdKind::String,
            EntityId::ObjectId(_) => IdKind::ObjectId,
        }
    }

    /// Returns `true` if this identifier has never been assigned.
    pub fn is_unset(&self) -> bool {
        *self == self.kind().unset()
    }

    /// Parses the string form of an identifier of the given kind.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Serialization`] if `value` is not a valid
    /// representation for `kind`.
    pub fn parse(kind: IdKind, value: &str) -> OdmResult<Self> {
        match kind {
            IdKind::Sequence => value
                .parse::<i64>()
                .map(EntityId::Sequence)
                .map_err(|e| OdmError::serialization_of("i64", format!("'{value}': {e}"))),
            IdKind::Random => Uuid::parse_str(value)
                .map(EntityId::Random)
                .map_err(|e| OdmError::serialization::<Uuid>(format!("'{value}': {e}"))),
            IdKind::String => Ok(EntityId::String(value.to_string())),
            IdKind::ObjectId => ObjectId::parse_str(value)
                .map(EntityId::ObjectId)
                .map_err(|e| OdmError::serialization::<ObjectId>(format!("'{value}': {e}"))),
        }
    }

    /// Converts the identifier into the BSON value stored in `_id`.
    pub fn to_bson(&self) -> Bson {
        Bson::from(self)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        IdKind::ObjectId.unset()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Sequence(n) => write!(f, "{n}"),
            EntityId::Random(u) => write!(f, "{}", u.hyphenated()),
            EntityId::String(s) => f.write_str(s),
            EntityId::ObjectId(oid) => f.write_str(&oid.to_hex()),
        }
    }
}

impl From<EntityId> for Bson {
    fn from(id: EntityId) -> Self {
        match &id {
            EntityId::Sequence(n) => Bson::Int64(*n),
            EntityId::Random(u) => Bson::Binary(Binary {
                subtype: BinarySubtype::Uuid,
                bytes: u.as_bytes().to_vec(),
            }),
            EntityId::String(s) => Bson::String(s.clone()),
            EntityId::ObjectId(oid) => Bson::ObjectId(*oid),
        }
    }
}

impl TryFrom<&Bson> for EntityId {
    type Error = OdmError;

    fn try_from(value: &Bson) -> OdmResult<Self> {
        match value {
            Bson::Int64(n) => Ok(EntityId::Sequence(*n)),
            Bson::Int32(n) => Ok(EntityId::Sequence(i64::from(*n))),
            Bson::String(s) => Ok(EntityId::String(s.clone())),
            Bson::ObjectId(oid) => Ok(EntityId::ObjectId(*oid)),
            Bson::Binary(Binary { subtype: BinarySubtype::Uuid, bytes }) => {
                let bytes: [u8; 16] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| OdmError::serialization::<Uuid>("uuid binary must be 16 bytes"))?;
                Ok(EntityId::Random(Uuid::from_bytes(bytes)))
            }
            other => Err(OdmError::serialization_of(
                format!("{:?}", other.element_type()),
                "value cannot be used as an entity identifier",
            )),
        }
    }
}

impl TryFrom<Bson> for EntityId {
    type Error = OdmError;

    fn try_from(value: Bson) -> OdmResult<Self> {
        EntityId::try_from(&value)
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        EntityId::Sequence(value)
    }
}

impl From<Uuid> for EntityId {
    fn from(value: Uuid) -> Self {
        EntityId::Random(value)
    }
}

impl From<ObjectId> for EntityId {
    fn from(value: ObjectId) -> Self {
        EntityId::ObjectId(value)
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        EntityId::String(value)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        EntityId::String(value.to_string())
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Bson::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Bson::deserialize(deserializer)?;
        EntityId::try_from(&value).map_err(serde::de::Error::custom)
    }
}

/// Lock-free source of sequence identifiers.
///
/// Values are handed out with one atomic `fetch_add` each; there is no
/// lock-and-check step, so any number of concurrent callers receive pairwise
/// distinct values.
#[derive(Debug)]
pub struct SequenceGenerator {
    next: AtomicI64,
}

impl SequenceGenerator {
    /// Creates a generator whose first value is `start`.
    pub fn new(start: i64) -> Self {
        Self { next: AtomicI64::new(start) }
    }

    /// Returns the next value.
    pub fn next(&self) -> i64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Raises the counter so the next value is at least `floor`.
    ///
    /// Never moves the counter backwards, so it is safe to call concurrently
    /// with [`next`](Self::next).
    pub fn seed_at_least(&self, floor: i64) {
        self.next.fetch_max(floor, Ordering::SeqCst);
    }

    /// Returns the value the next call to [`next`](Self::next) would produce.
    pub fn peek(&self) -> i64 {
        self.next.load(Ordering::SeqCst)
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashSet, sync::Arc, thread};

    #[test]
    fn concurrent_sequence_values_are_distinct() {
        let generator = Arc::new(SequenceGenerator::new(1));
        let handles = (0..8)
            .map(|_| {
                let generator = Arc::clone(&generator);
                thread::spawn(move || (0..1_000).map(|_| generator.next()).collect::<Vec<_>>())
            })
            .collect::<Vec<_>>();

        let values = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect::<Vec<_>>();
        let distinct = values.iter().copied().collect::<HashSet<_>>();

        assert_eq!(values.len(), 8_000);
        assert_eq!(distinct.len(), 8_000);
    }

    #[test]
    fn seeding_never_moves_backwards() {
        let generator = SequenceGenerator::new(100);
        generator.seed_at_least(10);
        assert_eq!(generator.peek(), 100);
        generator.seed_at_least(500);
        assert_eq!(generator.next(), 500);
        assert_eq!(generator.next(), 501);
    }

    #[test]
    fn unset_values_are_recognised_for_every_kind() {
        for kind in [IdKind::Sequence, IdKind::Random, IdKind::String, IdKind::ObjectId] {
            assert!(kind.unset().is_unset());
            assert!(!kind.generate(Some(&SequenceGenerator::new(7))).unwrap().is_unset());
        }
    }

    #[test]
    fn string_form_parses_back() {
        let generator = SequenceGenerator::new(42);
        for kind in [IdKind::Sequence, IdKind::Random, IdKind::String, IdKind::ObjectId] {
            let id = kind.generate(Some(&generator)).unwrap();
            assert_eq!(EntityId::parse(kind, &id.to_string()).unwrap(), id);
        }
    }

    #[test]
    fn sequence_kind_needs_a_generator() {
        assert!(matches!(IdKind::Sequence.generate(None), Err(OdmError::Initialization(_))));
        assert!(IdKind::Random.generate(None).is_ok());
    }

    #[test]
    fn malformed_object_id_reports_its_type() {
        match EntityId::parse(IdKind::ObjectId, "not-an-oid") {
            Err(OdmError::Serialization { type_name, .. }) => assert!(type_name.contains("ObjectId")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn bson_representation_is_native() {
        let uuid = Uuid::new_v4();
        match Bson::from(EntityId::Random(uuid)) {
            Bson::Binary(binary) => {
                assert_eq!(binary.subtype, BinarySubtype::Uuid);
                assert_eq!(EntityId::try_from(Bson::Binary(binary)).unwrap(), EntityId::Random(uuid));
            }
            other => panic!("expected binary, got {other:?}"),
        }
        assert_eq!(Bson::from(EntityId::Sequence(3)), Bson::Int64(3));
        assert_eq!(EntityId::try_from(Bson::Int32(3)).unwrap(), EntityId::Sequence(3));
    }

    #[test]
    fn borrowed_ids_convert_like_owned_ones() {
        let oid = ObjectId::new();
        let id = EntityId::ObjectId(oid);
        assert_eq!(Bson::from(&id), Bson::ObjectId(oid));
        assert_eq!(id.to_bson(), Bson::from(id.clone()));
        assert_eq!(EntityId::String("k".into()).to_bson(), Bson::String("k".into()));
    }
}
