use models::{
    DatasetCollection, DatasetSchema, Error, FieldSchema, FieldType, TableSchema,
};
use names::{shorten_name, to_snake_case, TABLE_INDEX_POSTFIX};

/// PostgreSQL column types that fields map to.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlType {
    Varchar,
    BigInt,
    BigSerial,
    Double,
    Boolean,
    Date,
    Time,
    Timestamp,
    Jsonb,
    Geometry { geometry_type: String, srid: i32 },
}

impl SqlType {
    /// The type as spelled in DDL.
    pub fn ddl(&self) -> String {
        match self {
            SqlType::Varchar => "character varying".to_string(),
            SqlType::BigInt => "bigint".to_string(),
            SqlType::BigSerial => "bigserial".to_string(),
            SqlType::Double => "double precision".to_string(),
            SqlType::Boolean => "boolean".to_string(),
            SqlType::Date => "date".to_string(),
            SqlType::Time => "time without time zone".to_string(),
            SqlType::Timestamp => "timestamp without time zone".to_string(),
            SqlType::Jsonb => "jsonb".to_string(),
            SqlType::Geometry {
                geometry_type,
                srid,
            } => format!("geometry({geometry_type},{srid})"),
        }
    }

    pub fn is_geometry(&self) -> bool {
        matches!(self, SqlType::Geometry { .. })
    }
}

/// One physical column.
#[derive(Debug, Clone)]
pub struct ColumnDescriptor {
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub primary_key: bool,
    /// The camelCase field id this column carries, for provenance and
    /// row-building lookups.
    pub field_id: String,
}

impl ColumnDescriptor {
    /// The expression to use for a bound insert value. Geometry columns
    /// take EWKT text.
    pub fn insert_expression(&self, placeholder: &str) -> String {
        if self.sql_type.is_geometry() {
            format!("ST_GeomFromEWKT({placeholder})")
        } else {
            placeholder.to_string()
        }
    }
}

/// How a table index is accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMethod {
    BTree,
    Gist,
}

/// One index of the plan: identifier, foreign key, geometry or
/// through-table index. Names are bounded to PostgreSQL's limit.
#[derive(Debug, Clone)]
pub struct IndexDescriptor {
    pub name: String,
    pub columns: Vec<String>,
    pub method: IndexMethod,
}

impl IndexDescriptor {
    fn new(name: String, columns: Vec<String>, method: IndexMethod) -> IndexDescriptor {
        IndexDescriptor {
            name: shorten_name(&name, TABLE_INDEX_POSTFIX),
            columns,
            method,
        }
    }
}

/// Naming knobs for the physical table.
#[derive(Debug, Clone, Default)]
pub struct NamingOptions {
    /// Target database schema; `None` means `public` with the dataset
    /// prefix on the table name.
    pub db_schema: Option<String>,
    /// Override the derived table name entirely.
    pub db_table_name: Option<String>,
    /// Versioned datasets live in their own schema without the dataset
    /// prefix, suffixed with the major version.
    pub versioned: bool,
    /// Appended to the derived name and preserved under shortening
    /// (`_full_load`, `_new`).
    pub postfix: String,
}

impl NamingOptions {
    pub fn with_postfix(postfix: &str) -> NamingOptions {
        NamingOptions {
            postfix: postfix.to_string(),
            ..NamingOptions::default()
        }
    }
}

/// The complete physical shape of one table: name, columns and index
/// plan. This is a pure projection of the schema AST; nothing here talks
/// to a database.
#[derive(Debug, Clone)]
pub struct TableDescriptor {
    pub dataset_id: String,
    pub table_id: String,
    pub db_schema: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub columns: Vec<ColumnDescriptor>,
    pub indexes: Vec<IndexDescriptor>,
    pub has_composite_key: bool,
    pub identifier_columns: Vec<String>,
}

impl TableDescriptor {
    /// Map a declared or derived table to its physical shape.
    pub fn from_table(
        dataset: &DatasetSchema,
        table: &TableSchema,
        collection: &dyn DatasetCollection,
        options: &NamingOptions,
    ) -> Result<TableDescriptor, Error> {
        let name = match &options.db_table_name {
            Some(name) => format!("{name}{}", options.postfix),
            None if options.versioned => table.db_name_variant(false, true, &options.postfix),
            None => table.db_name_variant(true, false, &options.postfix),
        };
        let db_schema = match &options.db_schema {
            Some(schema) => Some(schema.clone()),
            None if options.versioned => Some(to_snake_case(&dataset.id)),
            None => None,
        };

        let srid = dataset.srid().unwrap_or(28992);
        let mut columns = Vec::new();
        for field in table.fields() {
            push_field_columns(&mut columns, field, table, srid)?;
        }

        // Through tables of temporal targets get the validity-range
        // bounds as nullable columns, when the dataset asks for them.
        if table.is_through_table() && dataset.use_dimension_fields() {
            push_dimension_columns(&mut columns, dataset, table, collection);
        }

        let identifier_columns: Vec<String> = table
            .identifier_fields()
            .map(|fields| fields.iter().map(|f| f.db_name()).collect())
            .unwrap_or_default();

        let indexes = build_indexes(table, &name, &columns, &identifier_columns);

        Ok(TableDescriptor {
            dataset_id: dataset.id.clone(),
            table_id: table.id.clone(),
            db_schema,
            name,
            description: table.description.clone(),
            columns,
            indexes,
            has_composite_key: table.has_composite_key(),
            identifier_columns,
        })
    }

    /// `schema.table` as used in SQL statements.
    pub fn qualified_name(&self) -> String {
        match &self.db_schema {
            Some(schema) => format!("{schema}.{}", self.name),
            None => self.name.clone(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// The column holding the row key: `id` for composite keys, the
    /// single identifier column otherwise.
    pub fn key_column(&self) -> &str {
        if self.has_composite_key || self.identifier_columns.is_empty() {
            "id"
        } else {
            &self.identifier_columns[0]
        }
    }

    /// Columns carrying data, i.e. everything except an autoincrement id.
    pub fn data_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns
            .iter()
            .filter(|c| c.sql_type != SqlType::BigSerial)
    }
}

fn scalar_sql_type(field: &FieldSchema, srid: i32) -> Result<SqlType, Error> {
    if let Some(geometry_type) = field.geometry_type() {
        return Ok(SqlType::Geometry {
            geometry_type: geometry_type.to_string(),
            srid,
        });
    }
    Ok(match field.field_type() {
        FieldType::String => match field.format.as_deref() {
            Some("date") => SqlType::Date,
            Some("date-time") => SqlType::Timestamp,
            Some("time") => SqlType::Time,
            _ => SqlType::Varchar,
        },
        FieldType::Integer => SqlType::BigInt,
        FieldType::Autoincrement => SqlType::BigSerial,
        FieldType::Number => SqlType::Double,
        FieldType::Boolean => SqlType::Boolean,
        FieldType::Object => SqlType::Jsonb,
        FieldType::Array | FieldType::Ref(_) => {
            // Arrays map to sub-tables and non-geometry refs are the row
            // schema pointer; callers filter both out beforehand.
            return Err(Error::InvalidSchema(format!(
                "field '{}' has no scalar column mapping",
                field.qualified_id()
            )));
        }
    })
}

fn push_field_columns(
    columns: &mut Vec<ColumnDescriptor>,
    field: &FieldSchema,
    table: &TableSchema,
    srid: i32,
) -> Result<(), Error> {
    // The row-schema pointer and array fields (nested and n-m sub-tables)
    // have no column in this table.
    if field.is_schema_ref() || field.is_array() || field.is_temporal {
        return Ok(());
    }

    let is_primary =
        field.id == "id" || (table.identifier().len() == 1 && table.identifier()[0] == field.id);

    // Fields with expanded subfields: declared objects, and the
    // composite-key sides of derived through tables.
    let expanded = !field.subfields().is_empty()
        && (field.is_object() || field.relation().is_some())
        && field.format.as_deref() != Some("json");
    if expanded {
        // One column per subfield. A compound foreign key additionally
        // gets the joined textual id column.
        for subfield in field.subfields() {
            if subfield.is_temporal {
                continue;
            }
            columns.push(ColumnDescriptor {
                name: subfield.db_name(),
                sql_type: scalar_sql_type(subfield, srid)?,
                nullable: true,
                primary_key: false,
                field_id: subfield.id.clone(),
            });
        }
        if field.relation().is_some() {
            columns.push(ColumnDescriptor {
                name: field.db_name(),
                sql_type: SqlType::Varchar,
                nullable: true,
                primary_key: false,
                field_id: field.id.clone(),
            });
        }
        return Ok(());
    }

    let sql_type = scalar_sql_type(field, srid)?;
    columns.push(ColumnDescriptor {
        name: field.db_name(),
        sql_type,
        nullable: !field.required && !is_primary,
        primary_key: is_primary,
        field_id: field.id.clone(),
    });
    Ok(())
}

fn push_dimension_columns(
    columns: &mut Vec<ColumnDescriptor>,
    dataset: &DatasetSchema,
    table: &TableSchema,
    collection: &dyn DatasetCollection,
) {
    // The validity-range fields live on the field that spawned this
    // through table; resolve it on the parent and let the model expand
    // the dimensions of the relation target.
    let (Some(parent_id), Some([_, field_id])) = (table.parent_table_id(), table.through_fields())
    else {
        return;
    };
    let Ok(parent) = dataset.get_declared_table(parent_id) else {
        return;
    };
    let Ok(field) = parent.get_field_by_id(field_id) else {
        return;
    };
    for subfield in field.subfields_with_dimensions(true, collection) {
        if !subfield.is_temporal {
            continue;
        }
        let name = to_snake_case(&subfield.id);
        if columns.iter().any(|c| c.name == name) {
            continue;
        }
        columns.push(ColumnDescriptor {
            name,
            sql_type: SqlType::Timestamp,
            nullable: true,
            primary_key: false,
            field_id: subfield.id.clone(),
        });
    }
}

fn build_indexes(
    table: &TableSchema,
    db_table_name: &str,
    columns: &[ColumnDescriptor],
    identifier_columns: &[String],
) -> Vec<IndexDescriptor> {
    let mut indexes = Vec::new();

    // Identifier index, except for plain autoincrement keys which are
    // covered by the primary key itself.
    if !identifier_columns.is_empty() && !table.is_autoincrement() {
        indexes.push(IndexDescriptor::new(
            format!("{db_table_name}_identifier{TABLE_INDEX_POSTFIX}"),
            identifier_columns.to_vec(),
            IndexMethod::BTree,
        ));
    }

    // One btree per foreign-key column; on through tables this covers
    // both sides of the relation.
    for field in table.fk_fields() {
        let column_name = field.db_name();
        if columns.iter().any(|c| c.name == column_name) {
            indexes.push(IndexDescriptor::new(
                format!("{db_table_name}_{column_name}{TABLE_INDEX_POSTFIX}"),
                vec![column_name],
                IndexMethod::BTree,
            ));
        }
    }

    // GiST per geometry column.
    for column in columns {
        if column.sql_type.is_geometry() {
            indexes.push(IndexDescriptor::new(
                format!("{db_table_name}_{}{TABLE_INDEX_POSTFIX}", column.name),
                vec![column.name.clone()],
                IndexMethod::Gist,
            ));
        }
    }

    indexes
}
