//! Statement rendering

use super::quote_ident;
use crate::backends::core::{
    DeleteStatement, InsertStatement, Projection, SelectStatement, Statement, UpdateStatement,
};
use crate::error::OrmResult;
use crate::query::lookup::Lookup;
use crate::query::predicate::Predicate;
use crate::value::Value;

/// Base table alias in SELECT, UPDATE and DELETE
const BASE: &str = "t";

/// SQL text with its positional parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedSql {
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Default)]
struct SqlWriter {
    sql: String,
    params: Vec<Value>,
}

impl SqlWriter {
    fn push(&mut self, text: &str) {
        self.sql.push_str(text);
    }

    /// Bind a value, or write `NULL` inline
    fn value(&mut self, value: &Value) {
        if value.is_null() {
            self.sql.push_str("NULL");
        } else {
            self.params.push(value.clone());
            self.sql.push_str(&format!("${}", self.params.len()));
        }
    }

    fn finish(self) -> RenderedSql {
        RenderedSql {
            sql: self.sql,
            params: self.params,
        }
    }
}

/// Render a DML statement. Schema operations go through `ddl`.
pub fn render_statement(statement: &Statement) -> OrmResult<Vec<RenderedSql>> {
    Ok(match statement {
        Statement::Select(select) => vec![render_select(select)],
        Statement::Insert(insert) => vec![render_insert(insert)],
        Statement::Update(update) => vec![render_update(update)],
        Statement::Delete(delete) => vec![render_delete(delete)],
        Statement::Schema(operation) => super::ddl::render_operation(operation)
            .into_iter()
            .map(|sql| RenderedSql { sql, params: Vec::new() })
            .collect(),
    })
}

fn column(alias: &str, name: &str) -> String {
    format!("{}.{}", alias, quote_ident(name))
}

pub fn render_select(select: &SelectStatement) -> RenderedSql {
    let mut w = SqlWriter::default();
    w.push("SELECT ");

    if select.projection == Projection::Count {
        w.push("COUNT(*) AS \"count\"");
    } else {
        let mut items: Vec<String> = select
            .columns
            .iter()
            .map(|c| format!("{} AS {}", column(BASE, &c.name), quote_ident(&c.name)))
            .collect();
        for join in &select.joins {
            let alias = format!("j_{}", join.alias);
            items.extend(join.columns.iter().map(|c| {
                format!("{} AS {}", column(&alias, &c.name), quote_ident(&join.key(&c.name)))
            }));
        }
        w.push(&items.join(", "));
    }

    w.push(&format!(" FROM {} AS {}", quote_ident(&select.table), BASE));

    if select.projection == Projection::Rows {
        for join in &select.joins {
            let alias = format!("j_{}", join.alias);
            w.push(&format!(
                " LEFT JOIN {} AS {} ON {} = {}",
                quote_ident(&join.table),
                alias,
                column(&alias, &join.target_column),
                column(BASE, &join.local_column)
            ));
        }
    }

    if let Some(predicate) = &select.predicate {
        w.push(" WHERE ");
        predicate_sql(&mut w, predicate);
    }

    if select.projection == Projection::Rows {
        if !select.order_by.is_empty() {
            let terms: Vec<String> = select
                .order_by
                .iter()
                .map(|t| {
                    format!(
                        "{} {}",
                        column(BASE, &t.column),
                        if t.descending { "DESC" } else { "ASC" }
                    )
                })
                .collect();
            w.push(&format!(" ORDER BY {}", terms.join(", ")));
        }
        if let Some(limit) = select.limit {
            w.push(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = select.offset {
            w.push(&format!(" OFFSET {}", offset));
        }
    }

    w.finish()
}

pub fn render_insert(insert: &InsertStatement) -> RenderedSql {
    let mut w = SqlWriter::default();
    w.push(&format!("INSERT INTO {}", quote_ident(&insert.table)));

    if insert.values.is_empty() {
        w.push(" DEFAULT VALUES");
    } else {
        let columns: Vec<String> = insert.values.keys().map(|c| quote_ident(c)).collect();
        w.push(&format!(" ({}) VALUES (", columns.join(", ")));
        for (i, value) in insert.values.values().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            w.value(value);
        }
        w.push(")");
    }

    w.push(" RETURNING *");
    w.finish()
}

pub fn render_update(update: &UpdateStatement) -> RenderedSql {
    let mut w = SqlWriter::default();
    w.push(&format!("UPDATE {} AS {} SET ", quote_ident(&update.table), BASE));
    for (i, (name, value)) in update.values.iter().enumerate() {
        if i > 0 {
            w.push(", ");
        }
        w.push(&format!("{} = ", quote_ident(name)));
        w.value(value);
    }
    if let Some(predicate) = &update.predicate {
        w.push(" WHERE ");
        predicate_sql(&mut w, predicate);
    }
    w.finish()
}

pub fn render_delete(delete: &DeleteStatement) -> RenderedSql {
    let mut w = SqlWriter::default();
    w.push(&format!("DELETE FROM {} AS {}", quote_ident(&delete.table), BASE));
    if let Some(predicate) = &delete.predicate {
        w.push(" WHERE ");
        predicate_sql(&mut w, predicate);
    }
    w.finish()
}

/// Escape LIKE wildcards; backslash is the default escape character
fn like_pattern(needle: &str) -> String {
    let escaped = needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

fn predicate_sql(w: &mut SqlWriter, predicate: &Predicate) {
    match predicate {
        Predicate::Compare { column: name, lookup, value } => {
            let col = column(BASE, name);
            match lookup {
                Lookup::Exact if value.is_null() => w.push(&format!("{} IS NULL", col)),
                Lookup::Exact | Lookup::Gt | Lookup::Gte | Lookup::Lt | Lookup::Lte => {
                    w.push(&format!("{} {} ", col, lookup.operator().unwrap_or("=")));
                    w.value(value);
                }
                Lookup::IContains => {
                    w.push(&format!("{} ILIKE ", col));
                    let needle = value.as_str().unwrap_or_default();
                    w.value(&Value::Text(like_pattern(needle)));
                }
                Lookup::In => match value {
                    Value::List(items) if !items.is_empty() => {
                        w.push(&format!("{} IN (", col));
                        for (i, item) in items.iter().enumerate() {
                            if i > 0 {
                                w.push(", ");
                            }
                            w.value(item);
                        }
                        w.push(")");
                    }
                    _ => w.push("FALSE"),
                },
                Lookup::Range => match value {
                    Value::List(bounds) if bounds.len() == 2 => {
                        w.push(&format!("{} BETWEEN ", col));
                        w.value(&bounds[0]);
                        w.push(" AND ");
                        w.value(&bounds[1]);
                    }
                    _ => w.push("FALSE"),
                },
                Lookup::Year | Lookup::Month | Lookup::Day => {
                    let part = match lookup {
                        Lookup::Year => "YEAR",
                        Lookup::Month => "MONTH",
                        _ => "DAY",
                    };
                    w.push(&format!("EXTRACT({} FROM {}) = ", part, col));
                    w.value(value);
                }
            }
        }
        Predicate::And(children) if children.is_empty() => w.push("TRUE"),
        Predicate::Or(children) if children.is_empty() => w.push("FALSE"),
        Predicate::And(children) | Predicate::Or(children) => {
            let joiner = if matches!(predicate, Predicate::And(_)) { " AND " } else { " OR " };
            w.push("(");
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    w.push(joiner);
                }
                predicate_sql(w, child);
            }
            w.push(")");
        }
        // A comparison with NULL is unknown in SQL; coalescing keeps NOT the
        // exact complement of its child
        Predicate::Not(child) => {
            w.push("NOT COALESCE((");
            predicate_sql(w, child);
            w.push("), FALSE)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::core::{JoinSpec, SelectColumn};
    use crate::query::ordering::OrderTerm;
    use crate::schema::FieldType;
    use sqlparser::dialect::PostgreSqlDialect;
    use sqlparser::parser::Parser;

    fn parses(sql: &str) {
        Parser::parse_sql(&PostgreSqlDialect {}, sql)
            .unwrap_or_else(|e| panic!("invalid SQL {}: {}", sql, e));
    }

    fn posts_select() -> SelectStatement {
        SelectStatement::new(
            "posts",
            vec![
                SelectColumn::new("id", FieldType::BigInteger),
                SelectColumn::new("title", FieldType::Text),
            ],
        )
    }

    #[test]
    fn test_select_with_join_filter_order() {
        let mut select = posts_select();
        select.joins.push(JoinSpec {
            alias: "author".into(),
            table: "users".into(),
            columns: vec![SelectColumn::new("id", FieldType::BigInteger)],
            local_column: "author_id".into(),
            target_column: "id".into(),
        });
        let q = Predicate::Or(vec![
            Predicate::compare("title", Lookup::IContains, "50%_off"),
            Predicate::compare("author_id", Lookup::In, vec![1i64, 2]),
        ]);
        select.predicate = Some(q.negate());
        select.order_by = vec![OrderTerm::desc("created_at"), OrderTerm::asc("id")];
        select.limit = Some(5);
        select.offset = Some(10);

        let rendered = render_select(&select);
        assert_eq!(
            rendered.sql,
            "SELECT t.\"id\" AS \"id\", t.\"title\" AS \"title\", j_author.\"id\" AS \"author__id\" \
             FROM \"posts\" AS t LEFT JOIN \"users\" AS j_author ON j_author.\"id\" = t.\"author_id\" \
             WHERE NOT COALESCE(((t.\"title\" ILIKE $1 OR t.\"author_id\" IN ($2, $3))), FALSE) \
             ORDER BY t.\"created_at\" DESC, t.\"id\" ASC LIMIT 5 OFFSET 10"
        );
        assert_eq!(rendered.params[0], Value::Text("%50\\%\\_off%".into()));
        assert_eq!(rendered.params.len(), 3);
        parses(&rendered.sql);
    }

    #[test]
    fn test_count_ignores_order_and_limit() {
        let mut select = posts_select();
        select.projection = Projection::Count;
        select.order_by = vec![OrderTerm::asc("id")];
        select.limit = Some(1);
        select.predicate = Some(Predicate::compare("created_at", Lookup::Year, 2024));
        let rendered = render_select(&select);
        assert_eq!(
            rendered.sql,
            "SELECT COUNT(*) AS \"count\" FROM \"posts\" AS t WHERE EXTRACT(YEAR FROM t.\"created_at\") = $1"
        );
        parses(&rendered.sql);
    }

    #[test]
    fn test_empty_composites_and_in() {
        let mut select = posts_select();
        select.predicate = Some(Predicate::And(vec![
            Predicate::Or(vec![]),
            Predicate::And(vec![]),
            Predicate::any_of("id", vec![]),
        ]));
        let rendered = render_select(&select);
        assert!(rendered.sql.ends_with("WHERE (FALSE AND TRUE AND FALSE)"));
        parses(&rendered.sql);
    }

    #[test]
    fn test_insert_update_delete() {
        let insert = InsertStatement {
            table: "posts".into(),
            values: [
                ("title".to_string(), Value::from("Hello")),
                ("author_id".to_string(), Value::Null),
            ]
            .into_iter()
            .collect(),
            returning: Vec::new(),
        };
        let rendered = render_insert(&insert);
        assert_eq!(
            rendered.sql,
            "INSERT INTO \"posts\" (\"title\", \"author_id\") VALUES ($1, NULL) RETURNING *"
        );
        parses(&rendered.sql);

        let update = UpdateStatement {
            table: "posts".into(),
            values: [("published".to_string(), Value::Bool(true))].into_iter().collect(),
            predicate: Some(Predicate::compare("id", Lookup::Range, vec![1i64, 9])),
        };
        let rendered = render_update(&update);
        assert_eq!(
            rendered.sql,
            "UPDATE \"posts\" AS t SET \"published\" = $1 WHERE t.\"id\" BETWEEN $2 AND $3"
        );
        parses(&rendered.sql);

        let delete = DeleteStatement {
            table: "posts".into(),
            predicate: Some(Predicate::compare("author_id", Lookup::Exact, Value::Null)),
        };
        let rendered = render_delete(&delete);
        assert_eq!(rendered.sql, "DELETE FROM \"posts\" AS t WHERE t.\"author_id\" IS NULL");
        parses(&rendered.sql);
    }
}
