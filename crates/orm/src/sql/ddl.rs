//! DDL rendering for schema operations

use super::quote_ident;
use crate::migrations::{ColumnSchema, ConstraintSchema, NamedConstraint, Operation, TableSchema};
use crate::schema::FieldType;

pub fn sql_type(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Integer => "INTEGER",
        FieldType::BigInteger => "BIGINT",
        FieldType::Float => "DOUBLE PRECISION",
        FieldType::Boolean => "BOOLEAN",
        FieldType::Text => "TEXT",
        FieldType::Timestamp => "TIMESTAMPTZ",
        FieldType::Date => "DATE",
        FieldType::Uuid => "UUID",
        FieldType::Json => "JSONB",
    }
}

fn column_definition(column: &ColumnSchema) -> String {
    let type_sql = match (column.auto_increment, column.field_type) {
        (true, FieldType::Integer) => "SERIAL",
        (true, FieldType::BigInteger) => "BIGSERIAL",
        (_, other) => sql_type(other),
    };
    let mut sql = format!("{} {}", quote_ident(&column.name), type_sql);
    if column.primary_key {
        sql.push_str(" PRIMARY KEY");
    } else if !column.nullable {
        sql.push_str(" NOT NULL");
    }
    if let Some(default) = &column.db_default {
        sql.push_str(&format!(" DEFAULT {}", default));
    }
    sql
}

fn constraint_definition(constraint: &NamedConstraint) -> String {
    let body = match &constraint.constraint {
        ConstraintSchema::Unique { columns } => {
            let columns: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
            format!("UNIQUE ({})", columns.join(", "))
        }
        ConstraintSchema::ForeignKey { column, ref_table, ref_column, on_delete } => format!(
            "FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {}",
            quote_ident(column),
            quote_ident(ref_table),
            quote_ident(ref_column),
            on_delete.as_sql()
        ),
    };
    format!("CONSTRAINT {} {}", quote_ident(&constraint.name), body)
}

fn index_name(table: &str, column: &str) -> String {
    format!("ix_{}_{}", table, column)
}

fn create_index(table: &str, column: &ColumnSchema) -> String {
    format!(
        "CREATE INDEX {} ON {} ({})",
        quote_ident(&index_name(table, &column.name)),
        quote_ident(table),
        quote_ident(&column.name)
    )
}

fn create_table(table: &TableSchema) -> Vec<String> {
    let mut items: Vec<String> = table.columns.iter().map(column_definition).collect();
    items.extend(table.constraints.iter().map(constraint_definition));

    let mut statements = vec![format!(
        "CREATE TABLE {} ({})",
        quote_ident(&table.name),
        items.join(", ")
    )];
    statements.extend(
        table
            .columns
            .iter()
            .filter(|c| c.indexed)
            .map(|c| create_index(&table.name, c)),
    );
    statements
}

/// Statements performing one operation, in execution order
pub fn render_operation(operation: &Operation) -> Vec<String> {
    match operation {
        Operation::CreateTable { table } => create_table(table),
        Operation::DropTable { table } => vec![format!("DROP TABLE {}", quote_ident(&table.name))],
        Operation::AddColumn { table, column } => {
            let mut statements = vec![format!(
                "ALTER TABLE {} ADD COLUMN {}",
                quote_ident(table),
                column_definition(column)
            )];
            if column.indexed {
                statements.push(create_index(table, column));
            }
            statements
        }
        Operation::DropColumn { table, column } => vec![format!(
            "ALTER TABLE {} DROP COLUMN {}",
            quote_ident(table),
            quote_ident(&column.name)
        )],
        Operation::AddConstraint { table, constraint } => vec![format!(
            "ALTER TABLE {} ADD {}",
            quote_ident(table),
            constraint_definition(constraint)
        )],
        Operation::DropConstraint { table, constraint } => vec![format!(
            "ALTER TABLE {} DROP CONSTRAINT {}",
            quote_ident(table),
            quote_ident(&constraint.name)
        )],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::OnDelete;
    use sqlparser::dialect::PostgreSqlDialect;
    use sqlparser::parser::Parser;

    fn posts() -> TableSchema {
        let mut id = ColumnSchema::new("id", FieldType::BigInteger).primary_key();
        id.auto_increment = true;
        let mut created = ColumnSchema::new("created_at", FieldType::Timestamp).nullable();
        created.db_default = Some("CURRENT_TIMESTAMP".into());
        let mut author = ColumnSchema::new("author_id", FieldType::BigInteger).nullable();
        author.indexed = true;
        let mut table = TableSchema::new("posts")
            .column(id)
            .column(ColumnSchema::new("title", FieldType::Text))
            .column(created)
            .column(author);
        table.constraints.push(NamedConstraint::foreign_key(
            "posts",
            "author_id",
            "users",
            "id",
            OnDelete::Cascade,
        ));
        table
    }

    #[test]
    fn test_create_table() {
        let statements = render_operation(&Operation::CreateTable { table: posts() });
        assert_eq!(
            statements,
            vec![
                "CREATE TABLE \"posts\" (\"id\" BIGSERIAL PRIMARY KEY, \"title\" TEXT NOT NULL, \
                 \"created_at\" TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP, \"author_id\" BIGINT, \
                 CONSTRAINT \"fk_posts_author_id\" FOREIGN KEY (\"author_id\") REFERENCES \"users\" (\"id\") ON DELETE CASCADE)"
                    .to_string(),
                "CREATE INDEX \"ix_posts_author_id\" ON \"posts\" (\"author_id\")".to_string(),
            ]
        );
        for sql in &statements {
            Parser::parse_sql(&PostgreSqlDialect {}, sql).unwrap();
        }
    }

    #[test]
    fn test_every_operation_renders_valid_sql() {
        let table = posts();
        let unique = NamedConstraint::unique("posts", vec!["title".into()]);
        let operations = vec![
            Operation::AddColumn {
                table: "posts".into(),
                column: ColumnSchema::new("published", FieldType::Boolean),
            },
            Operation::DropColumn {
                table: "posts".into(),
                column: ColumnSchema::new("published", FieldType::Boolean),
            },
            Operation::AddConstraint { table: "posts".into(), constraint: unique.clone() },
            Operation::DropConstraint { table: "posts".into(), constraint: unique },
            Operation::DropTable { table },
        ];
        for operation in &operations {
            for sql in render_operation(operation) {
                Parser::parse_sql(&PostgreSqlDialect {}, &sql)
                    .unwrap_or_else(|e| panic!("{}: {}", sql, e));
            }
        }
    }
}
