//! Derivation of the implicit tables of a dataset: nested tables for
//! array-of-object fields and through tables for n-m relations and
//! compound foreign keys. Derivation is pure; the input dataset is never
//! mutated.

use crate::{DatasetSchema, FieldSchema, FieldType, Relation, TableSchema};
use names::{rel_table_identifier, to_snake_case};

impl DatasetSchema {
    /// The nested tables spawned by array-of-object fields without a
    /// relation.
    pub fn nested_tables(&self) -> Vec<TableSchema> {
        self.tables()
            .iter()
            .flat_map(|table| {
                table
                    .fields()
                    .iter()
                    .filter(|f| f.is_nested_table())
                    .map(|field| self.build_nested_table(table, field))
            })
            .collect()
    }

    /// The through tables spawned by n-m relations and compound foreign
    /// keys.
    pub fn through_tables(&self) -> Vec<TableSchema> {
        self.tables()
            .iter()
            .flat_map(|table| self.through_tables_of(table))
            .collect()
    }

    /// Through tables for a single declared table.
    pub fn through_tables_of(&self, table: &TableSchema) -> Vec<TableSchema> {
        table
            .fields()
            .iter()
            .filter(|f| f.is_through_table())
            .map(|field| self.build_through_table(table, field))
            .collect()
    }

    /// Declared, nested and through tables, in that order.
    pub fn tables_including_derived(&self) -> Vec<TableSchema> {
        let mut all: Vec<TableSchema> = self.tables().to_vec();
        all.extend(self.nested_tables());
        all.extend(self.through_tables());
        all
    }

    /// Synthesize the sub-table for an array-of-object field: an
    /// autoincrement `id`, a `parent` reference back to the owning table,
    /// and the item properties.
    pub fn build_nested_table(&self, table: &TableSchema, field: &FieldSchema) -> TableSchema {
        let prefix_len = self.id.len() + 1;
        let sub_table_id = rel_table_identifier(prefix_len, &table.id, &to_snake_case(&field.id));

        let mut fields = vec![
            FieldSchema::synthetic(
                "id",
                FieldType::Autoincrement,
                &self.id,
                &sub_table_id,
                None,
            ),
            FieldSchema::synthetic(
                "parent",
                FieldType::String,
                &self.id,
                &sub_table_id,
                Some(Relation {
                    dataset_id: self.id.clone(),
                    table_id: table.id.clone(),
                }),
            ),
        ];
        for subfield in field.subfields() {
            let mut subfield = subfield.clone();
            subfield.relocate(&sub_table_id);
            fields.push(subfield);
        }

        TableSchema::new_derived(
            sub_table_id,
            derived_shortname(self, table, field),
            self.context(),
            Some(table.id.clone()),
            None,
            true,
            false,
            vec!["id".to_string()],
            fields,
        )
    }

    /// Synthesize the join table for an n-m relation or compound foreign
    /// key: a foreign key per side, expanded into per-subkey columns when
    /// a side has a composite key.
    pub fn build_through_table(&self, table: &TableSchema, field: &FieldSchema) -> TableSchema {
        let prefix_len = self.id.len() + 1;
        let sub_table_id = rel_table_identifier(prefix_len, &table.id, &to_snake_case(&field.id));

        let target = field
            .any_relation()
            .cloned()
            .unwrap_or_else(|| Relation {
                dataset_id: self.id.clone(),
                table_id: table.id.clone(),
            });

        // The source side: a reference to the owning table, expanded per
        // identifier field when the source key is composite.
        let mut source = FieldSchema::synthetic(
            &table.id,
            FieldType::String,
            &self.id,
            &sub_table_id,
            Some(Relation {
                dataset_id: self.id.clone(),
                table_id: table.id.clone(),
            }),
        );
        source.required = false;
        source.set_shortname(if table.has_shortname() {
            Some(table.name().to_string())
        } else {
            None
        });
        if table.has_composite_key() {
            for key_field in table.identifier() {
                // Subkey columns keep the type of the parent's identifier
                // field.
                let key_type = table
                    .get_field_by_id(key_field)
                    .map(|f| f.field_type().clone())
                    .unwrap_or(FieldType::String);
                let mut subkey = FieldSchema::synthetic(
                    &format!("{}_{}", table.name(), key_field),
                    key_type,
                    &self.id,
                    &sub_table_id,
                    None,
                );
                subkey.required = false;
                source.push_subfield(subkey);
            }
        }

        // The destination side keeps the relation field's own subfields;
        // for temporal targets these carry the validity-range values that
        // were declared on the relation items.
        let mut destination = FieldSchema::synthetic(
            &field.id,
            FieldType::String,
            &self.id,
            &sub_table_id,
            Some(target),
        );
        destination.required = false;
        destination.set_shortname(if field.has_shortname() {
            Some(field.name().to_string())
        } else {
            None
        });
        for subfield in field.subfields() {
            let mut subfield = subfield.clone();
            subfield.relocate(&sub_table_id);
            destination.push_subfield(subfield);
        }

        let fields = vec![
            FieldSchema::synthetic(
                "id",
                FieldType::Autoincrement,
                &self.id,
                &sub_table_id,
                None,
            ),
            source,
            destination,
        ];

        TableSchema::new_derived(
            sub_table_id,
            derived_shortname(self, table, field),
            self.context(),
            Some(table.id.clone()),
            Some([table.id.clone(), field.id.clone()]),
            false,
            true,
            vec!["id".to_string()],
            fields,
        )
    }
}

/// Derived tables inherit a shortname when the parent table or the
/// spawning field carries one, so their physical names stay bounded.
fn derived_shortname(
    dataset: &DatasetSchema,
    table: &TableSchema,
    field: &FieldSchema,
) -> Option<String> {
    if field.has_shortname() || table.has_shortname() {
        Some(rel_table_identifier(
            dataset.id.len() + 1,
            table.name(),
            &to_snake_case(field.name()),
        ))
    } else {
        None
    }
}
