use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, Ident, ObjectNamePart, OrderByKind, SetExpr,
    Statement, TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;
use crate::time::parse_timestamp;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertEvent(NewEvent),
    UpdateEvent {
        id: Ulid,
        patch: EventPatch,
    },
    DeleteEvent {
        id: Ulid,
    },
    SelectEvents(EventFilter),
    SelectTags,
    SelectStages,
    SelectTalents,
    /// References stay raw: a malformed id is a negative answer, not an error.
    SelectEventExists {
        event_id: Option<String>,
        talent_id: Option<String>,
        stage_id: Option<String>,
    },
    InsertStage {
        id: Ulid,
        name: String,
    },
    InsertTalent {
        id: Ulid,
        name: String,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.to_uppercase().starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }
    if trimmed.to_uppercase().starts_with("UNLISTEN ") {
        let channel = trimmed[9..].trim().trim_matches(';').trim();
        if channel == "*" {
            return Ok(Command::UnlistenAll);
        }
        return Ok(Command::Unlisten {
            channel: channel.to_string(),
        });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let columns = insert_columns(&insert.columns)?;
    let values = extract_insert_values(insert)?;
    if values.len() != columns.len() {
        return Err(SqlError::WrongArity(columns.len(), values.len()));
    }
    let row = columns.iter().map(String::as_str).zip(values.iter());

    match table.as_str() {
        "events" => {
            let mut new = NewEvent::default();
            let mut has_name = false;
            for (col, expr) in row {
                match col {
                    "id" => new.id = parse_ulid_or_null(expr)?,
                    "name" => {
                        new.name = parse_string_expr(expr)?;
                        has_name = true;
                    }
                    "stage_id" => new.stage_id = parse_ulid_or_null(expr)?,
                    "start" => new.start = parse_timestamp_or_null(expr)?,
                    "end" => new.end = parse_timestamp_or_null(expr)?,
                    "tags" => new.tags = parse_list_expr(expr)?,
                    "talent_ids" => new.talent_ids = parse_ulid_list_expr(expr)?,
                    "collaborator_ids" => new.collaborator_ids = parse_ulid_list_expr(expr)?,
                    "kind" => new.kind = parse_string_or_null(expr)?,
                    "description" => new.description = parse_string_or_null(expr)?,
                    other => return Err(SqlError::UnknownColumn(other.to_string())),
                }
            }
            if !has_name {
                return Err(SqlError::MissingColumn("name"));
            }
            Ok(Command::InsertEvent(new))
        }
        "stages" | "talents" => {
            let (mut id, mut name) = (None, None);
            for (col, expr) in row {
                match col {
                    "id" => id = Some(parse_ulid_expr(expr)?),
                    "name" => name = Some(parse_string_expr(expr)?),
                    other => return Err(SqlError::UnknownColumn(other.to_string())),
                }
            }
            let id = id.ok_or(SqlError::MissingColumn("id"))?;
            let name = name.ok_or(SqlError::MissingColumn("name"))?;
            if table == "stages" {
                Ok(Command::InsertStage { id, name })
            } else {
                Ok(Command::InsertTalent { id, name })
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&table.relation)?;
    if name != "events" {
        return Err(SqlError::UnknownTable(name));
    }
    let id = extract_where_id(selection)?;

    let mut patch = EventPatch::default();
    for assignment in assignments {
        let col = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        let expr = &assignment.value;
        match col.as_str() {
            "name" => patch.name = Some(parse_string_expr(expr)?),
            "stage_id" => patch.stage_id = Some(parse_ulid_or_null(expr)?),
            "start" => patch.start = Some(parse_timestamp_or_null(expr)?),
            "end" => patch.end = Some(parse_timestamp_or_null(expr)?),
            "tags" => patch.tags = Some(parse_list_expr(expr)?),
            "talent_ids" => patch.talent_ids = Some(parse_ulid_list_expr(expr)?),
            "collaborator_ids" => patch.collaborator_ids = Some(parse_ulid_list_expr(expr)?),
            "kind" => patch.kind = Some(parse_string_or_null(expr)?),
            "description" => patch.description = Some(parse_string_or_null(expr)?),
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        }
    }
    Ok(Command::UpdateEvent { id, patch })
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "events" => Ok(Command::DeleteEvent { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

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
        "events" => {
            let mut filter = EventFilter::default();
            if let Some(selection) = &select.selection {
                extract_event_filters(selection, &mut filter)?;
            }
            if let Some(order_by) = &query.order_by {
                filter.order = parse_order(order_by)?;
            }
            Ok(Command::SelectEvents(filter))
        }
        "tags" => Ok(Command::SelectTags),
        "stages" => Ok(Command::SelectStages),
        "talents" => Ok(Command::SelectTalents),
        "event_exists" => {
            let (mut event_id, mut talent_id, mut stage_id) = (None, None, None);
            if let Some(selection) = &select.selection {
                for (col, expr) in equality_terms(selection)? {
                    let value = parse_string_or_null(expr)?;
                    match col.as_str() {
                        "id" | "event_id" => event_id = value,
                        "talent_id" => talent_id = value,
                        "stage_id" => stage_id = value,
                        other => return Err(SqlError::UnknownColumn(other.to_string())),
                    }
                }
            }
            Ok(Command::SelectEventExists {
                event_id,
                talent_id,
                stage_id,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_event_filters(expr: &Expr, filter: &mut EventFilter) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_event_filters(inner, filter),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_event_filters(left, filter)?;
                extract_event_filters(right, filter)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left).ok_or_else(|| unsupported_filter(expr))?;
                apply_event_filter(&col, std::slice::from_ref(right.as_ref()), filter)
            }
            ast::BinaryOperator::GtEq => {
                match expr_column_name(left).as_deref() {
                    Some("end") => filter.end_from = Some(parse_timestamp_expr(right)?),
                    Some("last_modified") => {
                        filter.modified_since = Some(parse_timestamp_expr(right)?)
                    }
                    _ => return Err(unsupported_filter(expr)),
                }
                Ok(())
            }
            ast::BinaryOperator::LtEq => {
                match expr_column_name(left).as_deref() {
                    Some("end") => filter.end_to = Some(parse_timestamp_expr(right)?),
                    _ => return Err(unsupported_filter(expr)),
                }
                Ok(())
            }
            _ => Err(unsupported_filter(expr)),
        },
        Expr::InList {
            expr: column,
            list,
            negated: false,
        } => {
            let col = expr_column_name(column).ok_or_else(|| unsupported_filter(expr))?;
            apply_event_filter(&col, list, filter)
        }
        _ => Err(unsupported_filter(expr)),
    }
}

/// Equality or IN-list criterion on an events column.
fn apply_event_filter(col: &str, values: &[Expr], filter: &mut EventFilter) -> Result<(), SqlError> {
    match col {
        "id" => {
            for v in values {
                filter.ids.push(parse_ulid_expr(v)?);
            }
        }
        "stage_id" => {
            for v in values {
                filter.stage_ids.push(parse_ulid_expr(v)?);
            }
        }
        "talent_id" => {
            for v in values {
                filter.talent_ids.push(parse_ulid_expr(v)?);
            }
        }
        "tag" | "tags" => {
            for v in values {
                filter.tags.push(parse_string_expr(v)?);
            }
        }
        "kind" => match values {
            [v] => filter.kind = Some(parse_string_expr(v)?),
            _ => return Err(SqlError::Unsupported("kind takes a single value".into())),
        },
        "q" => match values {
            [v] => filter.q = Some(parse_string_expr(v)?),
            _ => return Err(SqlError::Unsupported("q takes a single value".into())),
        },
        other => return Err(SqlError::UnknownColumn(other.to_string())),
    }
    Ok(())
}

fn parse_order(order_by: &ast::OrderBy) -> Result<SortOrder, SqlError> {
    let exprs = match &order_by.kind {
        OrderByKind::Expressions(exprs) => exprs,
        OrderByKind::All(_) => return Err(SqlError::Unsupported("ORDER BY ALL".into())),
    };
    match exprs.as_slice() {
        [] => Ok(SortOrder::default()),
        [only] if expr_column_name(&only.expr).as_deref() == Some("start") => {
            Ok(match only.options.asc {
                Some(false) => SortOrder::StartDesc,
                _ => SortOrder::StartAsc,
            })
        }
        _ => Err(SqlError::Unsupported("events can only be ordered by start".into())),
    }
}

/// Flatten `a = x AND b = y ...` into column/value pairs.
fn equality_terms(expr: &Expr) -> Result<Vec<(String, &Expr)>, SqlError> {
    match expr {
        Expr::Nested(inner) => equality_terms(inner),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            let mut terms = equality_terms(left)?;
            terms.extend(equality_terms(right)?);
            Ok(terms)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left).ok_or_else(|| unsupported_filter(expr))?;
            Ok(vec![(col, right.as_ref())])
        }
        _ => Err(unsupported_filter(expr)),
    }
}

fn unsupported_filter(expr: &Expr) -> SqlError {
    SqlError::Unsupported(format!("filter: {expr}"))
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

fn insert_columns(columns: &[Ident]) -> Result<Vec<String>, SqlError> {
    if columns.is_empty() {
        return Err(SqlError::Parse("INSERT requires a column list".into()));
    }
    Ok(columns.iter().map(|c| c.value.to_lowercase()).collect())
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string_expr(expr).map(Some)
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid_expr(expr).map(Some)
}

fn parse_timestamp_expr(expr: &Expr) -> Result<Ms, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return parse_timestamp_expr(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Parse(format!("timestamp out of range: -{expr}")));
    }
    let s = parse_string_expr(expr)?;
    parse_timestamp(&s).map_err(|e| SqlError::Parse(e.to_string()))
}

fn parse_timestamp_or_null(expr: &Expr) -> Result<Option<Ms>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_timestamp_expr(expr).map(Some)
}

/// Comma-separated list column. NULL and `''` are both the empty list.
fn parse_list_expr(expr: &Expr) -> Result<Vec<String>, SqlError> {
    let Some(s) = parse_string_or_null(expr)? else {
        return Ok(Vec::new());
    };
    Ok(s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect())
}

fn parse_ulid_list_expr(expr: &Expr) -> Result<Vec<Ulid>, SqlError> {
    parse_list_expr(expr)?
        .iter()
        .map(|s| Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s}: {e}"))))
        .collect()
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
