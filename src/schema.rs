use serde::{Deserialize, Serialize};

/// How a field's values are compared when diffing two snapshots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Scalar,
    /// A single reference to another entity, compared as one value.
    Reference,
    /// A collection of references, compared element-wise by identity key so
    /// that concurrent unrelated additions never read as a full replace.
    ReferenceList,
}

#[derive(Clone, Debug)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    /// Changing an identity field classifies the update as MAJOR.
    pub identity: bool,
    /// System-managed fields are recomputed, never diffed.
    pub system_managed: bool,
    /// Element identity key for `ReferenceList` values.
    pub key_field: String,
}

/// Declared field table for one entity type. Diffing walks this table in
/// declaration order instead of reflecting over whatever a snapshot happens
/// to contain.
#[derive(Clone, Debug)]
pub struct EntitySchema {
    entity_type: String,
    fields: Vec<FieldDescriptor>,
}

impl EntitySchema {
    pub fn builder(entity_type: impl Into<String>) -> EntitySchemaBuilder {
        EntitySchemaBuilder {
            entity_type: entity_type.into(),
            fields: Vec::new(),
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }
}

pub struct EntitySchemaBuilder {
    entity_type: String,
    fields: Vec<FieldDescriptor>,
}

impl EntitySchemaBuilder {
    fn push(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldDescriptor {
            name: name.into(),
            kind,
            identity: false,
            system_managed: false,
            key_field: "name".to_string(),
        });
        self
    }

    pub fn scalar(self, name: impl Into<String>) -> Self {
        self.push(name, FieldKind::Scalar)
    }

    pub fn reference(self, name: impl Into<String>) -> Self {
        self.push(name, FieldKind::Reference)
    }

    pub fn reference_list(self, name: impl Into<String>) -> Self {
        self.push(name, FieldKind::ReferenceList)
    }

    /// Marks the most recently added field as part of the identity set.
    pub fn identity(mut self) -> Self {
        if let Some(field) = self.fields.last_mut() {
            field.identity = true;
        }
        self
    }

    /// Marks the most recently added field as system-managed (excluded from
    /// diffing).
    pub fn system_managed(mut self) -> Self {
        if let Some(field) = self.fields.last_mut() {
            field.system_managed = true;
        }
        self
    }

    /// Overrides the element identity key of the most recently added
    /// reference-list field.
    pub fn keyed_by(mut self, key_field: impl Into<String>) -> Self {
        if let Some(field) = self.fields.last_mut() {
            field.key_field = key_field.into();
        }
        self
    }

    pub fn build(self) -> EntitySchema {
        EntitySchema {
            entity_type: self.entity_type,
            fields: self.fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_declares_fields_in_order() {
        let schema = EntitySchema::builder("user")
            .scalar("name")
            .identity()
            .scalar("displayName")
            .reference_list("teams")
            .reference_list("roles")
            .keyed_by("id")
            .scalar("inheritedRoles")
            .system_managed()
            .build();

        assert_eq!(schema.entity_type(), "user");
        let names: Vec<&str> = schema.fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["name", "displayName", "teams", "roles", "inheritedRoles"]
        );

        assert!(schema.field("name").unwrap().identity);
        assert!(!schema.field("displayName").unwrap().identity);
        assert_eq!(schema.field("teams").unwrap().key_field, "name");
        assert_eq!(schema.field("roles").unwrap().key_field, "id");
        assert!(schema.field("inheritedRoles").unwrap().system_managed);
        assert!(schema.field("missing").is_none());
    }
}
