//! Join records: the persisted edges of declared relations.
//!
//! Each relation keeps its edges in a dedicated join collection. A record
//! holds the owner's identifier under [`PARENT_KEY`] and the target's under
//! [`CHILD_KEY`]; the pair is unique.

use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

use crate::{
    backend::{IndexKind, IndexModel},
    id::EntityId,
};

/// Field holding the owner-side identifier.
pub const PARENT_KEY: &str = "parent_id";
/// Field holding the target-side identifier.
pub const CHILD_KEY: &str = "child_id";

/// One edge between two entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRecord {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub parent_id: EntityId,
    pub child_id: EntityId,
}

/// Indexes every join collection carries: the unique pair, and the child key
/// alone so lookups from the inverse side stay indexed.
pub(crate) fn indexes() -> [IndexModel; 2] {
    [
        IndexModel::new([
            (PARENT_KEY.to_string(), IndexKind::Asc),
            (CHILD_KEY.to_string(), IndexKind::Asc),
        ])
        .unique(true),
        IndexModel::new([(CHILD_KEY.to_string(), IndexKind::Asc)]),
    ]
}

/// Key fields as seen from one endpoint: `(self_key, other_key)`.
pub(crate) fn keys_for(side: crate::schema::Side) -> (&'static str, &'static str) {
    match side {
        crate::schema::Side::Owner => (PARENT_KEY, CHILD_KEY),
        crate::schema::Side::Inverse => (CHILD_KEY, PARENT_KEY),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Side;

    #[test]
    fn pair_index_is_unique() {
        let [pair, child] = indexes();
        assert!(pair.unique);
        assert_eq!(pair.effective_name(), "parent_id_1_child_id_1");
        assert!(!child.unique);
        assert_eq!(child.effective_name(), "child_id_1");
    }

    #[test]
    fn inverse_side_swaps_keys() {
        assert_eq!(keys_for(Side::Owner), (PARENT_KEY, CHILD_KEY));
        assert_eq!(keys_for(Side::Inverse), (CHILD_KEY, PARENT_KEY));
    }
}
