use std::collections::HashMap;
use std::fmt;

use crate::hash;

/// Object kinds, with the numeric values used in pack entry headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Commit = 1,
    Tree = 2,
    Blob = 3,
    Tag = 4,
}

impl ObjectType {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(ObjectType::Commit),
            2 => Some(ObjectType::Tree),
            3 => Some(ObjectType::Blob),
            4 => Some(ObjectType::Tag),
            _ => None,
        }
    }

    pub fn wire(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            ObjectType::Commit => "commit",
            ObjectType::Tree => "tree",
            ObjectType::Blob => "blob",
            ObjectType::Tag => "tag",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An immutable content-addressed object. The id is fixed at construction
/// and always equals the hash of the type-prefixed payload.
#[derive(Debug, Clone)]
pub struct Object {
    pub kind: ObjectType,
    pub data: Vec<u8>,
    pub id: String,
}

impl Object {
    pub fn new(kind: ObjectType, data: Vec<u8>) -> Self {
        let id = hash::object_id(kind.name(), &data);
        Object { kind, data, id }
    }

    /// For cache loads, where the id was computed when the object was first
    /// ingested.
    pub fn with_id(kind: ObjectType, data: Vec<u8>, id: String) -> Self {
        Object { kind, data, id }
    }
}

/// hex id -> object. Inserting an existing id replaces the entry; the
/// replacement is equivalent since the id determines the content.
#[derive(Debug, Default)]
pub struct ObjectStore {
    objects: HashMap<String, Object>,
}

impl ObjectStore {
    pub fn new() -> Self {
        ObjectStore::default()
    }

    pub fn insert(&mut self, object: Object) {
        self.objects.insert(object.id.clone(), object);
    }

    pub fn get(&self, id: &str) -> Option<&Object> {
        self.objects.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.objects.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Object> {
        self.objects.values()
    }

    /// Ids of every tree in the store, for `have` announcements.
    pub fn tree_ids(&self) -> impl Iterator<Item = &str> {
        self.objects
            .values()
            .filter(|object| object.kind == ObjectType::Tree)
            .map(|object| object.id.as_str())
    }
}
