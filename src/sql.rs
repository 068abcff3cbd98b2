use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, LimitClause, ObjectNamePart, SetExpr,
    Statement, TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    InsertSlot {
        id: Ulid,
        provider_id: Ulid,
        start: Ms,
        end: Ms,
    },
    DeleteSlot {
        id: Ulid,
    },
    /// Slots overlapping `[from, to)`.
    SelectSlots {
        provider_id: Ulid,
        from: Option<Ms>,
        to: Option<Ms>,
    },
    InsertAppointment {
        id: Ulid,
        slot_id: Ulid,
        purpose: String,
    },
    UpdateAppointment {
        id: Ulid,
        status: AppointmentStatus,
        notes: Option<String>,
    },
    /// Cancels; appointments are never removed.
    DeleteAppointment {
        id: Ulid,
    },
    SelectAppointments {
        provider_id: Option<Ulid>,
        requester_id: Option<Ulid>,
        status: Option<AppointmentStatus>,
    },
    SelectAppointmentCounts,
    SelectUpcoming {
        limit: Option<usize>,
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
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "slots" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("slots", 4, values.len()));
            }
            Ok(Command::InsertSlot {
                id: parse_ulid_expr(&values[0])?,
                provider_id: parse_ulid_expr(&values[1])?,
                start: parse_i64_expr(&values[2])?,
                end: parse_i64_expr(&values[3])?,
            })
        }
        "appointments" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("appointments", 2, values.len()));
            }
            let purpose = match values.get(2) {
                Some(expr) => parse_string_or_null(expr)?.unwrap_or_default(),
                None => String::new(),
            };
            Ok(Command::InsertAppointment {
                id: parse_ulid_expr(&values[0])?,
                slot_id: parse_ulid_expr(&values[1])?,
                purpose,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "slots" => Ok(Command::DeleteSlot { id }),
        "appointments" => Ok(Command::DeleteAppointment { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "appointments" {
        return Err(SqlError::UnknownTable(table));
    }

    let (mut status, mut notes) = (None, None);
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        };
        match column.as_deref() {
            Some("status") => status = Some(parse_status_expr(&assignment.value)?),
            Some("notes") => notes = parse_string_or_null(&assignment.value)?,
            Some(other) => return Err(SqlError::ReadOnlyColumn(other.to_string())),
            None => return Err(SqlError::Unsupported("tuple assignment".into())),
        }
    }

    Ok(Command::UpdateAppointment {
        id: extract_where_id(selection)?,
        status: status.ok_or(SqlError::MissingAssignment("status"))?,
        notes,
    })
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
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "slots" => {
            let (mut provider_id, mut from, mut to) = (None, None, None);
            for (column, op, value) in &filters {
                match (column.as_str(), op) {
                    ("provider_id", BinaryOperator::Eq) => provider_id = Some(parse_ulid_expr(value)?),
                    // The window is half-open overlap: end > from, start < to.
                    ("end", BinaryOperator::Gt) => from = Some(parse_i64_expr(value)?),
                    ("end", BinaryOperator::GtEq) => {
                        from = Some(parse_i64_expr(value)?.saturating_sub(1))
                    }
                    ("start", BinaryOperator::Lt) => to = Some(parse_i64_expr(value)?),
                    ("start", BinaryOperator::LtEq) => {
                        to = Some(parse_i64_expr(value)?.saturating_add(1))
                    }
                    _ => return Err(SqlError::UnsupportedFilter(column.clone())),
                }
            }
            Ok(Command::SelectSlots {
                provider_id: provider_id.ok_or(SqlError::MissingFilter("provider_id"))?,
                from,
                to,
            })
        }
        "appointments" => {
            let (mut provider_id, mut requester_id, mut status) = (None, None, None);
            for (column, op, value) in &filters {
                match (column.as_str(), op) {
                    ("provider_id", BinaryOperator::Eq) => provider_id = Some(parse_ulid_expr(value)?),
                    ("requester_id", BinaryOperator::Eq) => {
                        requester_id = Some(parse_ulid_expr(value)?)
                    }
                    ("status", BinaryOperator::Eq) => status = Some(parse_status_expr(value)?),
                    _ => return Err(SqlError::UnsupportedFilter(column.clone())),
                }
            }
            Ok(Command::SelectAppointments {
                provider_id,
                requester_id,
                status,
            })
        }
        "appointment_counts" => Ok(Command::SelectAppointmentCounts),
        "upcoming_appointments" => Ok(Command::SelectUpcoming {
            limit: query_limit(query)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten an AND-chain of `column <op> value` comparisons.
fn collect_filters(
    expr: &Expr,
    out: &mut Vec<(String, BinaryOperator, Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push((column, op.clone(), right.as_ref().clone()));
            Ok(())
        }
        Expr::Nested(inner) => collect_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn query_limit(query: &ast::Query) -> Result<Option<usize>, SqlError> {
    let limit = match &query.limit_clause {
        Some(LimitClause::LimitOffset { limit, .. }) => limit.as_ref(),
        Some(LimitClause::OffsetCommaLimit { limit, .. }) => Some(limit),
        None => None,
    };
    limit
        .map(|expr| {
            let n = parse_i64_expr(expr)?;
            usize::try_from(n).map_err(|_| SqlError::Parse(format!("bad LIMIT {n}")))
        })
        .transpose()
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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
            [row] => Ok(row.clone()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64_expr(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_status_expr(expr: &Expr) -> Result<AppointmentStatus, SqlError> {
    match parse_string_or_null(expr)? {
        Some(s) => s.parse().map_err(SqlError::Parse),
        None => Err(SqlError::Parse("status cannot be NULL".into())),
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
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("unsupported filter on column: {0}")]
    UnsupportedFilter(String),
    #[error("missing assignment: {0}")]
    MissingAssignment(&'static str),
    #[error("column is read-only: {0}")]
    ReadOnlyColumn(String),
}
