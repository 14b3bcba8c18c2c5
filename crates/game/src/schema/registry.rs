use std::fmt;

use bit_set::BitSet;

use super::field::NetworkSchema;

pub const MAX_MAP_TYPES: usize = 16;
pub const MAX_ENTITY_TYPES: usize = 256;
pub const MAX_EVENT_TYPES: usize = 64;
pub const MAX_COMMAND_TYPES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaCategory {
    Map,
    Entity,
    Event,
    Command,
}

impl SchemaCategory {
    pub const ALL: [SchemaCategory; 4] = [Self::Map, Self::Entity, Self::Event, Self::Command];

    pub fn capacity(self) -> usize {
        match self {
            Self::Map => MAX_MAP_TYPES,
            Self::Entity => MAX_ENTITY_TYPES,
            Self::Event => MAX_EVENT_TYPES,
            Self::Command => MAX_COMMAND_TYPES,
        }
    }

    /// Bits needed to send a type id of this category.
    pub fn id_bits(self) -> u32 {
        self.capacity().trailing_zeros()
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Map => "map",
            Self::Entity => "entity",
            Self::Event => "event",
            Self::Command => "command",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for SchemaCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("{category} schema id {id} exceeds capacity {capacity}")]
    IdOutOfRange {
        category: SchemaCategory,
        id: u16,
        capacity: usize,
    },
    #[error("{category} schema id {id} registered twice")]
    Duplicate { category: SchemaCategory, id: u16 },
}

/// Schemas by category and id.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    schemas: [Vec<Option<NetworkSchema>>; 4],
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            schemas: SchemaCategory::ALL.map(|c| vec![None; c.capacity()]),
        }
    }

    fn check(category: SchemaCategory, id: u16) -> Result<(), SchemaError> {
        if id as usize >= category.capacity() {
            return Err(SchemaError::IdOutOfRange {
                category,
                id,
                capacity: category.capacity(),
            });
        }
        Ok(())
    }

    pub fn register(
        &mut self,
        category: SchemaCategory,
        schema: NetworkSchema,
    ) -> Result<(), SchemaError> {
        let id = schema.id;
        Self::check(category, id)?;
        let slot = &mut self.schemas[category.index()][id as usize];
        if slot.is_some() {
            return Err(SchemaError::Duplicate { category, id });
        }
        *slot = Some(schema);
        Ok(())
    }

    /// Stores a schema received from a peer, replacing any previous one.
    pub fn replace(
        &mut self,
        category: SchemaCategory,
        schema: NetworkSchema,
    ) -> Result<(), SchemaError> {
        let id = schema.id;
        Self::check(category, id)?;
        self.schemas[category.index()][id as usize] = Some(schema);
        Ok(())
    }

    pub fn get(&self, category: SchemaCategory, id: u16) -> Option<&NetworkSchema> {
        self.schemas[category.index()]
            .get(id as usize)
            .and_then(Option::as_ref)
    }

    pub fn iter(&self, category: SchemaCategory) -> impl Iterator<Item = &NetworkSchema> {
        self.schemas[category.index()].iter().flatten()
    }

    pub fn clear(&mut self) {
        for slots in &mut self.schemas {
            slots.fill(None);
        }
    }
}

/// Schemas a peer has confirmed receiving and need not be sent again.
#[derive(Debug, Clone, Default)]
pub struct AckedSchemas {
    acked: [BitSet; 4],
}

impl AckedSchemas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_acked(&self, category: SchemaCategory, id: u16) -> bool {
        self.acked[category.index()].contains(id as usize)
    }

    pub fn acknowledge(&mut self, category: SchemaCategory, id: u16) {
        self.acked[category.index()].insert(id as usize);
    }

    pub fn reset(&mut self) {
        for set in &mut self.acked {
            set.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::field::FieldType;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = SchemaRegistry::new();
        let schema = NetworkSchema::new(3).with_field("hp", FieldType::Int, 8, 0);
        registry.register(SchemaCategory::Entity, schema.clone()).unwrap();

        assert_eq!(registry.get(SchemaCategory::Entity, 3), Some(&schema));
        assert_eq!(registry.get(SchemaCategory::Event, 3), None);
        assert_eq!(
            registry.register(SchemaCategory::Entity, schema.clone()),
            Err(SchemaError::Duplicate {
                category: SchemaCategory::Entity,
                id: 3
            })
        );
        assert!(registry.replace(SchemaCategory::Entity, schema).is_ok());
        assert_eq!(registry.iter(SchemaCategory::Entity).count(), 1);
    }

    #[test]
    fn test_ids_are_bounded_per_category() {
        let mut registry = SchemaRegistry::new();
        let err = registry
            .register(SchemaCategory::Command, NetworkSchema::new(MAX_COMMAND_TYPES as u16))
            .unwrap_err();
        assert!(matches!(err, SchemaError::IdOutOfRange { capacity: 16, .. }));
        assert_eq!(SchemaCategory::Entity.id_bits(), 8);
        assert_eq!(SchemaCategory::Event.id_bits(), 6);
    }

    #[test]
    fn test_acked_schemas() {
        let mut acked = AckedSchemas::new();
        assert!(!acked.is_acked(SchemaCategory::Event, 5));
        acked.acknowledge(SchemaCategory::Event, 5);
        assert!(acked.is_acked(SchemaCategory::Event, 5));
        assert!(!acked.is_acked(SchemaCategory::Entity, 5));
        acked.reset();
        assert!(!acked.is_acked(SchemaCategory::Event, 5));
    }
}
