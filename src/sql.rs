use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::model::*;
use crate::time::parse_instant;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertEvent {
        title: String,
        start: Ms,
        end: Ms,
        description: String,
    },
    UpdateEvent {
        id: Id,
        patch: EventPatch,
    },
    DeleteEvent {
        id: Id,
    },
    InsertResource {
        name: String,
        kind: String,
    },
    UpdateResource {
        id: Id,
        patch: ResourcePatch,
    },
    DeleteResource {
        id: Id,
    },
    InsertAllocation {
        event_id: Id,
        resource_id: Id,
    },
    DeleteAllocation {
        id: Id,
    },
    SelectEvents {
        id: Option<Id>,
    },
    SelectResources {
        id: Option<Id>,
    },
    SelectAllocations {
        filter: AllocationFilter,
    },
    SelectConflicts,
    SelectUtilization {
        start: Ms,
        end: Ms,
        /// Evaluation instant for `upcoming`; wall clock when absent.
        now: Option<Ms>,
    },
}

/// Shape of the rows a statement answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Events,
    Resources,
    Allocations,
    Conflicts,
    Utilization,
}

const EVENT_COLUMNS: &[&str] = &["title", "start", "end", "description"];
const RESOURCE_COLUMNS: &[&str] = &["name", "type"];
const ALLOCATION_COLUMNS: &[&str] = &["event_id", "resource_id"];

fn parse_statements(sql: &str) -> Result<Vec<Statement>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    Ok(stmts)
}

fn parse_statement(sql: &str) -> Result<Statement, SqlError> {
    Ok(parse_statements(sql)?.swap_remove(0))
}

/// Parse the first statement of `sql`.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    to_command(parse_statement(sql)?)
}

/// Parse every `;`-separated statement of a simple-query message.
pub fn parse_script(sql: &str) -> Result<Vec<Command>, SqlError> {
    parse_statements(sql)?.into_iter().map(to_command).collect()
}

fn to_command(stmt: Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(&insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, &assignments, &selection),
        Statement::Delete(delete) => parse_delete(&delete),
        Statement::Query(query) => parse_select(&query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Result schema of `sql` without evaluating its values, so `$N`
/// placeholders are fine. `None` for statements answering with a tag.
pub fn result_kind(sql: &str) -> Option<ResultKind> {
    match parse_statement(sql).ok()? {
        Statement::Insert(insert) => {
            let table = insert_table_name(&insert).ok()?;
            (table == "allocations").then_some(ResultKind::Conflicts)
        }
        Statement::Query(query) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return None;
            };
            match table_factor_name(&select.from.first()?.relation).ok()?.as_str() {
                "events" => Some(ResultKind::Events),
                "resources" => Some(ResultKind::Resources),
                "allocations" => Some(ResultKind::Allocations),
                "conflicts" => Some(ResultKind::Conflicts),
                "utilization" => Some(ResultKind::Utilization),
                _ => None,
            }
        }
        _ => None,
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "events" => {
            let row = named_insert_row(insert, "events", EVENT_COLUMNS)?;
            Ok(Command::InsertEvent {
                title: parse_text(required(&row, "title")?)?,
                start: parse_instant_expr(required(&row, "start")?)?,
                end: parse_instant_expr(required(&row, "end")?)?,
                description: optional(&row, "description")
                    .map(parse_text_or_null)
                    .transpose()?
                    .flatten()
                    .unwrap_or_default(),
            })
        }
        "resources" => {
            let row = named_insert_row(insert, "resources", RESOURCE_COLUMNS)?;
            Ok(Command::InsertResource {
                name: parse_text(required(&row, "name")?)?,
                kind: optional(&row, "type")
                    .map(parse_text_or_null)
                    .transpose()?
                    .flatten()
                    .unwrap_or_default(),
            })
        }
        "allocations" => {
            let row = named_insert_row(insert, "allocations", ALLOCATION_COLUMNS)?;
            Ok(Command::InsertAllocation {
                event_id: parse_id(required(&row, "event_id")?)?,
                resource_id: parse_id(required(&row, "resource_id")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;

    let mut sets = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        sets.push((column, &assignment.value));
    }

    match table.as_str() {
        "events" => {
            let mut patch = EventPatch::default();
            for (column, value) in sets {
                match column.as_str() {
                    "title" => patch.title = Some(parse_text(value)?),
                    "start" => patch.start = Some(parse_instant_expr(value)?),
                    "end" => patch.end = Some(parse_instant_expr(value)?),
                    "description" => {
                        patch.description = Some(parse_text_or_null(value)?.unwrap_or_default())
                    }
                    _ => return Err(SqlError::UnknownColumn("events", column)),
                }
            }
            Ok(Command::UpdateEvent { id, patch })
        }
        "resources" => {
            let mut patch = ResourcePatch::default();
            for (column, value) in sets {
                match column.as_str() {
                    "name" => patch.name = Some(parse_text(value)?),
                    "type" => patch.kind = Some(parse_text_or_null(value)?.unwrap_or_default()),
                    _ => return Err(SqlError::UnknownColumn("resources", column)),
                }
            }
            Ok(Command::UpdateResource { id, patch })
        }
        "allocations" => Err(SqlError::Unsupported(
            "allocations cannot be updated; delete and allocate again".into(),
        )),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "events" => Ok(Command::DeleteEvent { id }),
        "resources" => Ok(Command::DeleteResource { id }),
        "allocations" => Ok(Command::DeleteAllocation { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    match table.as_str() {
        "events" => Ok(Command::SelectEvents {
            id: single_id_filter(&select.selection, "events")?,
        }),
        "resources" => Ok(Command::SelectResources {
            id: single_id_filter(&select.selection, "resources")?,
        }),
        "allocations" => {
            let mut filter = AllocationFilter::default();
            if let Some(selection) = &select.selection {
                for (column, value) in equality_filters(selection)? {
                    let id = Some(parse_id(value)?);
                    match column.as_str() {
                        "id" => filter.id = id,
                        "event_id" => filter.event_id = id,
                        "resource_id" => filter.resource_id = id,
                        _ => return Err(SqlError::UnknownColumn("allocations", column)),
                    }
                }
            }
            Ok(Command::SelectAllocations { filter })
        }
        "conflicts" => Ok(Command::SelectConflicts),
        "utilization" => {
            let (mut start, mut end, mut now) = (None, None, None);
            if let Some(selection) = &select.selection {
                extract_utilization_filters(selection, &mut start, &mut end, &mut now)?;
            }
            Ok(Command::SelectUtilization {
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                end: end.ok_or(SqlError::MissingFilter("end"))?,
                now,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_utilization_filters(
    expr: &Expr,
    start: &mut Option<Ms>,
    end: &mut Option<Ms>,
    now: &mut Option<Ms>,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_utilization_filters(left, start, end, now)?;
                extract_utilization_filters(right, start, end, now)?;
            }
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    *start = Some(parse_instant_expr(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    *end = Some(parse_instant_expr(right)?);
                }
            }
            ast::BinaryOperator::Eq => {
                if expr_column_name(left).as_deref() == Some("now") {
                    *now = Some(parse_instant_expr(right)?);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

/// The single VALUES row of `insert`, keyed by column name. Without a column
/// list, values are taken positionally in `default_columns` order.
fn named_insert_row(
    insert: &ast::Insert,
    table: &'static str,
    default_columns: &[&str],
) -> Result<Vec<(String, Expr)>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let values = match body.body.as_ref() {
        SetExpr::Values(values) => &values.rows,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let row = match values.as_slice() {
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        [row] => row,
        _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if insert.columns.is_empty() {
        if row.len() > columns.len() {
            return Err(SqlError::WrongArity(table, columns.len(), row.len()));
        }
    } else if row.len() != columns.len() {
        return Err(SqlError::WrongArity(table, columns.len(), row.len()));
    }
    for column in &columns {
        if column == "id" {
            return Err(SqlError::Unsupported(format!("{table}.id is assigned by the server")));
        }
        if !default_columns.contains(&column.as_str()) {
            return Err(SqlError::UnknownColumn(table, column.clone()));
        }
    }

    Ok(columns.into_iter().zip(row.iter().cloned()).collect())
}

fn optional<'a>(row: &'a [(String, Expr)], column: &str) -> Option<&'a Expr> {
    row.iter().find(|(c, _)| c == column).map(|(_, e)| e)
}

fn required<'a>(row: &'a [(String, Expr)], column: &'static str) -> Result<&'a Expr, SqlError> {
    optional(row, column).ok_or(SqlError::MissingValue(column))
}

/// Flatten `a = 1 AND b = 2` into `[(a, 1), (b, 2)]`.
fn equality_filters(expr: &Expr) -> Result<Vec<(String, &Expr)>, SqlError> {
    let mut out = Vec::new();
    collect_equalities(expr, &mut out)?;
    Ok(out)
}

fn collect_equalities<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_equalities(left, out)?;
            collect_equalities(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((column, right.as_ref()));
            Ok(())
        }
        Expr::Nested(inner) => collect_equalities(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn single_id_filter(selection: &Option<Expr>, table: &'static str) -> Result<Option<Id>, SqlError> {
    let Some(selection) = selection else {
        return Ok(None);
    };
    let mut id = None;
    for (column, value) in equality_filters(selection)? {
        if column != "id" {
            return Err(SqlError::UnknownColumn(table, column));
        }
        id = Some(parse_id(value)?);
    }
    Ok(id)
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Id, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_id(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_id(expr: &Expr) -> Result<Id, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad id {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected id, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

/// ISO-8601 text, or a bare number of milliseconds.
fn parse_instant_expr(expr: &Expr) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        // Bound parameters arrive quoted, so quoted ms are accepted too.
        Some(Value::SingleQuotedString(s)) => parse_instant(s)
            .or_else(|e| s.trim().parse::<Ms>().map_err(|_| SqlError::Parse(e))),
        Some(Value::Null) => Err(SqlError::Parse("timestamp cannot be NULL".into())),
        _ => parse_i64_expr(expr),
    }
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_text(expr).map(Some),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingValue(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "unknown column: {t}.{c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingValue(col) => write!(f, "missing value: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
