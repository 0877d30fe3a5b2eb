//! Stored Value Types
//!
//! Every key maps to exactly one [`DataEntity`]. Collection payloads are
//! mutated in place under the dictionary's shard lock; multi-step commands
//! hold key locks around the whole read-modify-write.

use super::sortedset::SortedSet;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

/// The payload stored under a key.
#[derive(Debug, Clone)]
pub enum DataEntity {
    Str(Bytes),
    List(VecDeque<Bytes>),
    Set(HashSet<Bytes>),
    Hash(HashMap<Bytes, Bytes>),
    ZSet(SortedSet),
}

impl DataEntity {
    /// Name reported by the TYPE command.
    pub fn type_name(&self) -> &'static str {
        match self {
            DataEntity::Str(_) => "string",
            DataEntity::List(_) => "list",
            DataEntity::Set(_) => "set",
            DataEntity::Hash(_) => "hash",
            DataEntity::ZSet(_) => "zset",
        }
    }

    /// True for a collection with no elements left. Strings are never empty
    /// in this sense, even when zero-length.
    pub fn is_empty_collection(&self) -> bool {
        match self {
            DataEntity::Str(_) => false,
            DataEntity::List(list) => list.is_empty(),
            DataEntity::Set(set) => set.is_empty(),
            DataEntity::Hash(hash) => hash.is_empty(),
            DataEntity::ZSet(zset) => zset.is_empty(),
        }
    }
}

/// The stored payload does not have the type a command expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
pub struct WrongType;

/// A payload kind that collection commands read and update in place.
pub trait Collection: Default + Sized {
    fn wrap(self) -> DataEntity;
    fn view(entity: &DataEntity) -> Option<&Self>;
    fn view_mut(entity: &mut DataEntity) -> Option<&mut Self>;
}

macro_rules! collection {
    ($ty:ty, $variant:ident) => {
        impl Collection for $ty {
            fn wrap(self) -> DataEntity {
                DataEntity::$variant(self)
            }

            fn view(entity: &DataEntity) -> Option<&Self> {
                match entity {
                    DataEntity::$variant(inner) => Some(inner),
                    _ => None,
                }
            }

            fn view_mut(entity: &mut DataEntity) -> Option<&mut Self> {
                match entity {
                    DataEntity::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

collection!(VecDeque<Bytes>, List);
collection!(HashSet<Bytes>, Set);
collection!(HashMap<Bytes, Bytes>, Hash);
collection!(SortedSet, ZSet);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names() {
        assert_eq!(DataEntity::Str(Bytes::new()).type_name(), "string");
        assert_eq!(DataEntity::List(VecDeque::new()).type_name(), "list");
        assert_eq!(DataEntity::ZSet(SortedSet::new()).type_name(), "zset");
    }

    #[test]
    fn test_empty_collection() {
        assert!(!DataEntity::Str(Bytes::new()).is_empty_collection());
        assert!(DataEntity::Set(HashSet::new()).is_empty_collection());

        let mut entity = VecDeque::from(vec![Bytes::from("x")]).wrap();
        assert!(!entity.is_empty_collection());
        <VecDeque<Bytes>>::view_mut(&mut entity).unwrap().clear();
        assert!(entity.is_empty_collection());
    }

    #[test]
    fn test_view_rejects_other_kinds() {
        let entity = DataEntity::Str(Bytes::from("v"));
        assert!(<HashSet<Bytes>>::view(&entity).is_none());
        assert!(<HashMap<Bytes, Bytes>>::view(&entity).is_none());
    }
}
