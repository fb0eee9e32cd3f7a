use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::limits::MAX_PAYLOAD_LEN;
use crate::model::*;

const CALENDAR_TABLE: &str = "calendar_events";
const CALENDAR_COLUMNS: [&str; 3] = ["id", "start_date_time", "start_date"];
const DOCUMENT_COLUMNS: [&str; 2] = ["id", "client"];

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    UpsertCalendarEvents {
        events: Vec<CalendarEvent>,
    },
    DeleteCalendarEvent {
        id: Ulid,
    },
    SelectCalendarEvents,
    SelectBusySlots {
        date: String,
    },
    SelectOpenSlots {
        date: String,
    },
    IssueDocument {
        kind: DocumentKind,
        id: Ulid,
        client: Option<String>,
        returning: bool,
    },
    DeleteDocument {
        kind: DocumentKind,
        id: Ulid,
    },
    SelectDocuments {
        kind: DocumentKind,
        year: Option<i32>,
    },
    SelectNextNumber {
        kind: DocumentKind,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_all_insert_rows(insert)?;

    if table == CALENDAR_TABLE {
        let columns = insert_columns(insert, &CALENDAR_COLUMNS);
        let mut events = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            let event = parse_calendar_row(&columns, row)
                .map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
            events.push(event);
        }
        return Ok(Command::UpsertCalendarEvents { events });
    }

    let kind = DocumentKind::from_table(&table).ok_or_else(|| SqlError::UnknownTable(table.clone()))?;
    if rows.len() > 1 {
        return Err(SqlError::Unsupported(format!(
            "multi-row INSERT into {table}"
        )));
    }
    let columns = insert_columns(insert, &DOCUMENT_COLUMNS);
    let row = &rows[0];
    if row.len() != columns.len() {
        return Err(SqlError::WrongArity(kind.table(), columns.len(), row.len()));
    }

    let (mut id, mut client) = (None, None);
    for (column, expr) in columns.iter().zip(row) {
        match column.as_str() {
            "id" => id = parse_ulid_or_null(expr)?,
            "client" => client = parse_string_or_null(expr)?,
            "number" => {
                return Err(SqlError::Unsupported(
                    "number is assigned by the server".into(),
                ));
            }
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        }
    }

    Ok(Command::IssueDocument {
        kind,
        id: id.unwrap_or_else(Ulid::new),
        client,
        returning: insert.returning.is_some(),
    })
}

fn parse_calendar_row(columns: &[String], row: &[Expr]) -> Result<CalendarEvent, SqlError> {
    if row.len() != columns.len() {
        return Err(SqlError::WrongArity(CALENDAR_TABLE, columns.len(), row.len()));
    }

    let (mut id, mut payload, mut date_time, mut date) = (None, None, None, None);
    for (column, expr) in columns.iter().zip(row) {
        match column.as_str() {
            "id" => id = Some(parse_ulid(expr)?),
            "payload" => payload = parse_string_or_null(expr)?,
            "start_date_time" => date_time = parse_string_or_null(expr)?,
            "start_date" => date = parse_string_or_null(expr)?,
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        }
    }
    let id = id.ok_or(SqlError::MissingColumn("id"))?;

    let mut event = match payload {
        Some(json) => {
            if json.len() > MAX_PAYLOAD_LEN {
                return Err(SqlError::Payload(format!(
                    "{} bytes exceeds {MAX_PAYLOAD_LEN}",
                    json.len()
                )));
            }
            CalendarEvent::from_provider_json(id, &json)
                .map_err(|e| SqlError::Payload(e.to_string()))?
        }
        None => CalendarEvent {
            id,
            start_date_time: None,
            start_date: None,
        },
    };
    // Explicit columns win over the payload.
    if date_time.is_some() {
        event.start_date_time = date_time;
    }
    if date.is_some() {
        event.start_date = date;
    }
    Ok(event)
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    if table == CALENDAR_TABLE {
        return Ok(Command::DeleteCalendarEvent { id });
    }
    let kind = DocumentKind::from_table(&table).ok_or(SqlError::UnknownTable(table))?;
    Ok(Command::DeleteDocument { kind, id })
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_equality_filters(selection, &mut filters);
    }
    let filter = |column: &str| {
        filters
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, expr)| *expr)
    };

    match table.as_str() {
        CALENDAR_TABLE => Ok(Command::SelectCalendarEvents),
        "busy_slots" | "open_slots" => {
            let expr = filter("date").ok_or(SqlError::MissingFilter("date"))?;
            let date = parse_string_or_null(expr)?.unwrap_or_default();
            if table == "busy_slots" {
                Ok(Command::SelectBusySlots { date })
            } else {
                Ok(Command::SelectOpenSlots { date })
            }
        }
        "next_number" => {
            let expr = filter("kind").ok_or(SqlError::MissingFilter("kind"))?;
            let label = parse_string_or_null(expr)?.unwrap_or_default();
            let kind = DocumentKind::from_label(&label)
                .ok_or_else(|| SqlError::Parse(format!("unknown document kind: {label}")))?;
            Ok(Command::SelectNextNumber { kind })
        }
        _ => {
            let kind = DocumentKind::from_table(&table)
                .ok_or_else(|| SqlError::UnknownTable(table.clone()))?;
            let year = filter("year").map(parse_i32_expr).transpose()?;
            Ok(Command::SelectDocuments { kind, year })
        }
    }
}

/// Every `column = value` reachable through ANDs. Other predicates are
/// ignored.
fn collect_equality_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_equality_filters(left, out);
            collect_equality_filters(right, out);
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if let Some(col) = expr_column_name(left) {
                out.push((col, right));
            }
        }
        Expr::Nested(inner) => collect_equality_filters(inner, out),
        _ => {}
    }
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

/// Listed columns, lowercased, or `defaults` when the INSERT names none.
fn insert_columns(insert: &ast::Insert, defaults: &[&str]) -> Vec<String> {
    if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert
            .columns
            .iter()
            .map(|ident| ident.value.to_lowercase())
            .collect()
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    let mut filters = Vec::new();
    collect_equality_filters(sel, &mut filters);
    match filters.iter().find(|(col, _)| col == "id") {
        Some((_, expr)) => parse_ulid(expr),
        None => Err(SqlError::MissingFilter("id")),
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid(expr).map(Some),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(
            Value::SingleQuotedString(s)
            | Value::EscapedStringLiteral(s)
            | Value::DoubleQuotedString(s),
        ) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i32_expr(expr: &Expr) -> Result<i32, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("bad payload: {0}")]
    Payload(String),
}
