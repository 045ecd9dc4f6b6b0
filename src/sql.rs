use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime};
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Which appointments a `SELECT … FROM appointments` asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppointmentFilter {
    Id(Ulid),
    Client(Ulid),
    Establishment {
        id: Ulid,
        date: Option<NaiveDate>,
    },
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertEstablishment {
        id: Ulid,
        name: String,
        owner_id: Ulid,
        utc_offset_minutes: i16,
    },
    InsertStaff {
        id: Ulid,
        establishment_id: Ulid,
        name: String,
    },
    InsertServiceAssignment {
        staff_id: Ulid,
        service_id: Ulid,
    },
    InsertService {
        id: Ulid,
        establishment_id: Ulid,
        name: String,
        duration_minutes: u32,
        price_minor_units: u64,
    },
    DeleteService {
        id: Ulid,
    },
    InsertWindow {
        id: Ulid,
        establishment_id: Ulid,
        day_of_week: u8,
        start: TimeOfDay,
        end: TimeOfDay,
    },
    DeleteWindow {
        id: Ulid,
    },
    InsertAppointment {
        id: Ulid,
        establishment_id: Ulid,
        service_id: Ulid,
        staff_id: Option<Ulid>,
        client_id: Ulid,
        start: Ms,
    },
    /// Soft delete: the row stays with status `cancelled`.
    CancelAppointment {
        id: Ulid,
        actor_id: Ulid,
    },
    SelectSlots {
        establishment_id: Ulid,
        service_id: Ulid,
        staff_id: Option<Ulid>,
        date: NaiveDate,
    },
    SelectAvailability {
        establishment_id: Ulid,
        staff_id: Option<Ulid>,
        date: NaiveDate,
    },
    SelectAppointments(AppointmentFilter),
    SelectEstablishments,
    SelectWindows {
        establishment_id: Ulid,
    },
    SelectServices {
        establishment_id: Ulid,
    },
    SelectStaff {
        establishment_id: Ulid,
    },
}

/// Parse a single statement. Anything after the first is ignored.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let stmts = parse_statements(sql)?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };
    parse_statement(first)
}

/// Parse every `;`-separated statement of a simple-protocol query string.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    let stmts = parse_statements(sql)?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

fn parse_statements(sql: &str) -> Result<Vec<Statement>, SqlError> {
    Parser::parse_sql(&PostgreSqlDialect {}, sql).map_err(|e| SqlError::Parse(e.to_string()))
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table a SELECT reads from, for describing result columns before the
/// statement runs. `None` for anything that returns no rows.
pub fn select_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let Some(Statement::Query(query)) = stmts.first() else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
}

// ── INSERT ────────────────────────────────────────────────────

/// Column order assumed when an INSERT lists no columns.
fn default_columns(table: &str) -> Option<&'static [&'static str]> {
    Some(match table {
        "establishments" => &["id", "name", "owner_id"],
        "staff" => &["id", "establishment_id", "name"],
        "service_assignments" => &["staff_id", "service_id"],
        "services" => &["id", "establishment_id", "name", "duration_minutes", "price"],
        "windows" => &["id", "establishment_id", "day_of_week", "start_time", "end_time"],
        "appointments" => &["id", "establishment_id", "service_id", "staff_id", "client_id", "start"],
        _ => return None,
    })
}

/// One VALUES row keyed by column name.
struct Row {
    table: &'static str,
    values: HashMap<String, Expr>,
}

impl Row {
    fn get(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.values.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }

    fn optional(&self, column: &str) -> Option<&Expr> {
        self.values.get(column).filter(|e| !is_null(e))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let (table, defaults) = match default_columns(&table) {
        Some(cols) => (static_table_name(&table), cols),
        None => return Err(SqlError::UnknownTable(table)),
    };
    let row = extract_row(insert, table, defaults)?;

    match table {
        "establishments" => Ok(Command::InsertEstablishment {
            id: parse_ulid_expr(row.get("id")?)?,
            name: parse_string_expr(row.get("name")?)?,
            owner_id: parse_ulid_expr(row.get("owner_id")?)?,
            utc_offset_minutes: match row.optional("utc_offset_minutes") {
                Some(expr) => parse_i16(expr)?,
                None => 0,
            },
        }),
        "staff" => Ok(Command::InsertStaff {
            id: parse_ulid_expr(row.get("id")?)?,
            establishment_id: parse_ulid_expr(row.get("establishment_id")?)?,
            name: parse_string_expr(row.get("name")?)?,
        }),
        "service_assignments" => Ok(Command::InsertServiceAssignment {
            staff_id: parse_ulid_expr(row.get("staff_id")?)?,
            service_id: parse_ulid_expr(row.get("service_id")?)?,
        }),
        "services" => Ok(Command::InsertService {
            id: parse_ulid_expr(row.get("id")?)?,
            establishment_id: parse_ulid_expr(row.get("establishment_id")?)?,
            name: parse_string_expr(row.get("name")?)?,
            duration_minutes: parse_u32(row.get("duration_minutes")?)?,
            price_minor_units: match row.optional("price") {
                Some(expr) => parse_u64(expr)?,
                None => 0,
            },
        }),
        "windows" => Ok(Command::InsertWindow {
            id: parse_ulid_expr(row.get("id")?)?,
            establishment_id: parse_ulid_expr(row.get("establishment_id")?)?,
            day_of_week: parse_u8(row.get("day_of_week")?)?,
            start: parse_time_of_day(row.get("start_time")?)?,
            end: parse_time_of_day(row.get("end_time")?)?,
        }),
        "appointments" => Ok(Command::InsertAppointment {
            id: parse_ulid_expr(row.get("id")?)?,
            establishment_id: parse_ulid_expr(row.get("establishment_id")?)?,
            service_id: parse_ulid_expr(row.get("service_id")?)?,
            staff_id: row.optional("staff_id").map(parse_ulid_expr).transpose()?,
            client_id: parse_ulid_expr(row.get("client_id")?)?,
            start: parse_instant(row.get("start")?)?,
        }),
        other => Err(SqlError::UnknownTable(other.to_string())),
    }
}

/// The `&'static` spelling of a known table name.
fn static_table_name(table: &str) -> &'static str {
    match table {
        "establishments" => "establishments",
        "staff" => "staff",
        "service_assignments" => "service_assignments",
        "services" => "services",
        "windows" => "windows",
        _ => "appointments",
    }
}

fn extract_row(
    insert: &ast::Insert,
    table: &'static str,
    defaults: &[&str],
) -> Result<Row, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let rows = match body.body.as_ref() {
        SetExpr::Values(values) => &values.rows,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let values = match rows.as_slice() {
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        [single] => single,
        _ => return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}"))),
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() > columns.len() || (insert.columns.is_empty() && values.len() < columns.len()) {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }

    Ok(Row {
        table,
        values: columns.into_iter().zip(values.iter().cloned()).collect(),
    })
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = collect_filters(delete.selection.as_ref())?;
    let require = |column: &'static str| -> Result<Ulid, SqlError> {
        filters
            .get(column)
            .ok_or(SqlError::MissingFilter(column))
            .and_then(parse_ulid_expr)
    };

    match table.as_str() {
        "services" => Ok(Command::DeleteService { id: require("id")? }),
        "windows" => Ok(Command::DeleteWindow { id: require("id")? }),
        "appointments" => Ok(Command::CancelAppointment {
            id: require("id")?,
            actor_id: require("actor_id")?,
        }),
        "establishments" | "staff" | "service_assignments" => {
            Err(SqlError::Unsupported(format!("DELETE FROM {table}")))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = collect_filters(select.selection.as_ref())?;

    let ulid = |column: &'static str| -> Result<Ulid, SqlError> {
        filters
            .get(column)
            .ok_or(SqlError::MissingFilter(column))
            .and_then(parse_ulid_expr)
    };
    let optional_ulid = |column: &str| -> Result<Option<Ulid>, SqlError> {
        filters
            .get(column)
            .filter(|e| !is_null(e))
            .map(parse_ulid_expr)
            .transpose()
    };
    let date = |required: bool| -> Result<Option<NaiveDate>, SqlError> {
        match filters.get("date") {
            Some(expr) => parse_date(expr).map(Some),
            None if required => Err(SqlError::MissingFilter("date")),
            None => Ok(None),
        }
    };

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            establishment_id: ulid("establishment_id")?,
            service_id: ulid("service_id")?,
            staff_id: optional_ulid("staff_id")?,
            date: date(true)?.ok_or(SqlError::MissingFilter("date"))?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            establishment_id: ulid("establishment_id")?,
            staff_id: optional_ulid("staff_id")?,
            date: date(true)?.ok_or(SqlError::MissingFilter("date"))?,
        }),
        "appointments" => {
            let filter = if let Some(id) = optional_ulid("id")? {
                AppointmentFilter::Id(id)
            } else if let Some(client_id) = optional_ulid("client_id")? {
                AppointmentFilter::Client(client_id)
            } else if let Some(id) = optional_ulid("establishment_id")? {
                AppointmentFilter::Establishment { id, date: date(false)? }
            } else {
                return Err(SqlError::MissingFilter("id, client_id or establishment_id"));
            };
            Ok(Command::SelectAppointments(filter))
        }
        "establishments" => Ok(Command::SelectEstablishments),
        "windows" => Ok(Command::SelectWindows {
            establishment_id: ulid("establishment_id")?,
        }),
        "services" => Ok(Command::SelectServices {
            establishment_id: ulid("establishment_id")?,
        }),
        "staff" => Ok(Command::SelectStaff {
            establishment_id: ulid("establishment_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Gather `column = value` terms joined by AND.
fn collect_filters(selection: Option<&Expr>) -> Result<HashMap<String, Expr>, SqlError> {
    fn walk(expr: &Expr, out: &mut HashMap<String, Expr>) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => walk(inner, out),
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::And,
                right,
            } => {
                walk(left, out)?;
                walk(right, out)
            }
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::Eq,
                right,
            } => {
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.insert(column, right.as_ref().clone());
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!(
                "WHERE supports only AND-joined equality filters, got {other}"
            ))),
        }
    }

    let mut filters = HashMap::new();
    if let Some(expr) = selection {
        walk(expr, &mut filters)?;
    }
    Ok(filters)
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

/// String literal, or the text of a number literal.
fn literal_text(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s),
        Some(value) => Err(SqlError::Parse(format!("expected literal, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = literal_text(expr)?;
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        _ => Err(SqlError::Parse(format!("expected string, got {expr}"))),
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
    let s = literal_text(expr)?;
    s.trim()
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
}

fn parse_i16(expr: &Expr) -> Result<i16, SqlError> {
    let v = parse_i64_expr(expr)?;
    i16::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64_expr(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64_expr(expr)?;
    u64::try_from(v).map_err(|_| SqlError::Parse(format!("{v} must not be negative")))
}

fn parse_time_of_day(expr: &Expr) -> Result<TimeOfDay, SqlError> {
    let s = literal_text(expr)?;
    TimeOfDay::parse(s).ok_or_else(|| SqlError::Parse(format!("bad time of day {s:?}, expected HH:MM")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = literal_text(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

/// Milliseconds, or a wall-clock timestamp such as `2030-01-07 09:30`.
fn parse_instant(expr: &Expr) -> Result<Ms, SqlError> {
    if let Ok(ms) = parse_i64_expr(expr) {
        return Ok(ms);
    }
    let s = literal_text(expr)?.trim();
    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|dt| dt.and_utc().timestamp_millis())
        .ok_or_else(|| SqlError::Parse(format!("bad timestamp {s:?}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing column {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const B: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";
    const C: &str = "01BX5ZZKBKACTAV9WEVGEMMVS0";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 1, 7).unwrap()
    }

    #[test]
    fn parse_insert_establishment() {
        let sql = format!("INSERT INTO establishments (id, name, owner_id) VALUES ('{A}', 'Studio Bela', '{B}')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertEstablishment {
                id: ulid(A),
                name: "Studio Bela".into(),
                owner_id: ulid(B),
                utc_offset_minutes: 0,
            }
        );
    }

    #[test]
    fn parse_insert_establishment_with_offset() {
        let sql = format!(
            "INSERT INTO establishments (id, name, owner_id, utc_offset_minutes) VALUES ('{A}', 'Studio Bela', '{B}', -180)"
        );
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::InsertEstablishment { utc_offset_minutes: -180, .. }
        ));
    }

    #[test]
    fn parse_insert_without_column_list_is_positional() {
        let sql = format!("INSERT INTO staff VALUES ('{A}', '{B}', 'Ana')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertStaff {
                id: ulid(A),
                establishment_id: ulid(B),
                name: "Ana".into(),
            }
        );
    }

    #[test]
    fn parse_insert_columns_in_any_order() {
        let sql = format!(
            "INSERT INTO services (name, duration_minutes, establishment_id, id) VALUES ('Corte', 60, '{B}', '{A}')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertService {
                id: ulid(A),
                establishment_id: ulid(B),
                name: "Corte".into(),
                duration_minutes: 60,
                price_minor_units: 0,
            }
        );
    }

    #[test]
    fn parse_insert_service_with_price() {
        let sql = format!("INSERT INTO services VALUES ('{A}', '{B}', 'Barba', 30, 4500)");
        match parse_sql(&sql).unwrap() {
            Command::InsertService {
                duration_minutes,
                price_minor_units,
                ..
            } => {
                assert_eq!(duration_minutes, 30);
                assert_eq!(price_minor_units, 4500);
            }
            other => panic!("expected InsertService, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_service_negative_price_errors() {
        let sql = format!("INSERT INTO services VALUES ('{A}', '{B}', 'Barba', 30, -1)");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_insert_service_assignment() {
        let sql = format!("INSERT INTO service_assignments (staff_id, service_id) VALUES ('{A}', '{B}')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertServiceAssignment {
                staff_id: ulid(A),
                service_id: ulid(B),
            }
        );
    }

    #[test]
    fn parse_insert_window() {
        let sql = format!(
            "INSERT INTO windows (id, establishment_id, day_of_week, start_time, end_time) VALUES ('{A}', '{B}', 1, '09:00', '12:00')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertWindow {
                id: ulid(A),
                establishment_id: ulid(B),
                day_of_week: 1,
                start: TimeOfDay::from_hm(9, 0).unwrap(),
                end: TimeOfDay::from_hm(12, 0).unwrap(),
            }
        );
    }

    #[test]
    fn parse_insert_window_bad_time_errors() {
        let sql = format!("INSERT INTO windows VALUES ('{A}', '{B}', 1, '9am', '12:00')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_insert_appointment_with_timestamp() {
        let sql = format!(
            "INSERT INTO appointments (id, establishment_id, service_id, client_id, start) VALUES ('{A}', '{B}', '{C}', '{A}', '2030-01-07 09:30')"
        );
        let expected_start = day_start(monday()) + 9 * 3_600_000 + 30 * 60_000;
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertAppointment {
                id: ulid(A),
                establishment_id: ulid(B),
                service_id: ulid(C),
                staff_id: None,
                client_id: ulid(A),
                start: expected_start,
            }
        );
    }

    #[test]
    fn parse_insert_appointment_with_millis_and_staff() {
        let sql = format!("INSERT INTO appointments VALUES ('{A}', '{B}', '{C}', '{B}', '{A}', 1893920400000)");
        match parse_sql(&sql).unwrap() {
            Command::InsertAppointment { staff_id, start, .. } => {
                assert_eq!(staff_id, Some(ulid(B)));
                assert_eq!(start, 1_893_920_400_000);
            }
            other => panic!("expected InsertAppointment, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_appointment_null_staff() {
        let sql = format!("INSERT INTO appointments VALUES ('{A}', '{B}', '{C}', NULL, '{A}', 0)");
        match parse_sql(&sql).unwrap() {
            Command::InsertAppointment { staff_id, .. } => assert_eq!(staff_id, None),
            other => panic!("expected InsertAppointment, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_missing_column_errors() {
        let sql = format!("INSERT INTO appointments (id, establishment_id) VALUES ('{A}', '{B}')");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingColumn("appointments", "service_id"))
        ));
    }

    #[test]
    fn parse_insert_positional_short_row_errors() {
        let sql = format!("INSERT INTO staff VALUES ('{A}', '{B}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity("staff", 3, 2))));
    }

    #[test]
    fn parse_multi_row_insert_is_unsupported() {
        let sql = format!("INSERT INTO staff VALUES ('{A}', '{B}', 'Ana'), ('{C}', '{B}', 'Rui')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_cancel_appointment() {
        let sql = format!("DELETE FROM appointments WHERE id = '{A}' AND actor_id = '{B}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::CancelAppointment {
                id: ulid(A),
                actor_id: ulid(B),
            }
        );
    }

    #[test]
    fn parse_cancel_without_actor_errors() {
        let sql = format!("DELETE FROM appointments WHERE id = '{A}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("actor_id"))));
    }

    #[test]
    fn parse_delete_window_and_service() {
        let sql = format!("DELETE FROM windows WHERE id = '{A}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteWindow { id: ulid(A) });
        let sql = format!("DELETE FROM services WHERE id = '{A}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteService { id: ulid(A) });
    }

    #[test]
    fn parse_delete_establishment_is_unsupported() {
        let sql = format!("DELETE FROM establishments WHERE id = '{A}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_select_slots() {
        let sql = format!(
            "SELECT * FROM slots WHERE establishment_id = '{A}' AND service_id = '{B}' AND date = '2030-01-07'"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectSlots {
                establishment_id: ulid(A),
                service_id: ulid(B),
                staff_id: None,
                date: monday(),
            }
        );
    }

    #[test]
    fn parse_select_slots_for_staff_member() {
        let sql = format!(
            "SELECT * FROM slots WHERE (establishment_id = '{A}' AND staff_id = '{C}') AND service_id = '{B}' AND \"date\" = '2030-01-07'"
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectSlots { staff_id, .. } => assert_eq!(staff_id, Some(ulid(C))),
            other => panic!("expected SelectSlots, got {other:?}"),
        }
    }

    #[test]
    fn parse_select_slots_requires_date() {
        let sql = format!("SELECT * FROM slots WHERE establishment_id = '{A}' AND service_id = '{B}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("date"))));
    }

    #[test]
    fn parse_select_slots_rejects_range_filters() {
        let sql = format!("SELECT * FROM slots WHERE establishment_id = '{A}' OR service_id = '{B}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_select_availability() {
        let sql = format!("SELECT * FROM availability WHERE establishment_id = '{A}' AND date = '2030-01-07'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAvailability {
                establishment_id: ulid(A),
                staff_id: None,
                date: monday(),
            }
        );
    }

    #[test]
    fn parse_select_appointments_filters() {
        let by_id = format!("SELECT * FROM appointments WHERE id = '{A}'");
        assert_eq!(
            parse_sql(&by_id).unwrap(),
            Command::SelectAppointments(AppointmentFilter::Id(ulid(A)))
        );

        let by_client = format!("SELECT * FROM appointments WHERE client_id = '{B}'");
        assert_eq!(
            parse_sql(&by_client).unwrap(),
            Command::SelectAppointments(AppointmentFilter::Client(ulid(B)))
        );

        let by_day = format!("SELECT * FROM appointments WHERE establishment_id = '{C}' AND date = '2030-01-07'");
        assert_eq!(
            parse_sql(&by_day).unwrap(),
            Command::SelectAppointments(AppointmentFilter::Establishment {
                id: ulid(C),
                date: Some(monday()),
            })
        );

        let unfiltered = "SELECT * FROM appointments";
        assert!(matches!(parse_sql(unfiltered), Err(SqlError::MissingFilter(_))));
    }

    #[test]
    fn parse_select_catalog_listings() {
        assert_eq!(
            parse_sql("SELECT * FROM establishments").unwrap(),
            Command::SelectEstablishments
        );
        let sql = format!("SELECT * FROM windows WHERE establishment_id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectWindows {
                establishment_id: ulid(A)
            }
        );
        let sql = format!("SELECT id, name FROM services WHERE establishment_id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectServices {
                establishment_id: ulid(A)
            }
        );
        let sql = format!("SELECT * FROM staff WHERE establishment_id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectStaff {
                establishment_id: ulid(A)
            }
        );
    }

    #[test]
    fn parse_bad_ulid_errors() {
        let sql = "SELECT * FROM windows WHERE establishment_id = 'not-a-ulid'";
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO bookings (id) VALUES ('{A}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
        assert!(matches!(parse_batch(""), Err(SqlError::Empty)));
    }

    #[test]
    fn parse_batch_keeps_statement_order() {
        let sql = format!(
            "INSERT INTO establishments VALUES ('{A}', 'Studio', '{B}'); SELECT * FROM establishments;"
        );
        let cmds = parse_batch(&sql).unwrap();
        assert_eq!(cmds.len(), 2);
        assert!(matches!(cmds[0], Command::InsertEstablishment { .. }));
        assert_eq!(cmds[1], Command::SelectEstablishments);
    }

    #[test]
    fn parse_batch_fails_on_any_bad_statement() {
        let sql = format!("SELECT * FROM establishments; DELETE FROM staff WHERE id = '{A}'");
        assert!(matches!(parse_batch(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn select_table_for_describe() {
        assert_eq!(
            select_table("SELECT * FROM slots WHERE establishment_id = $1 AND service_id = $2 AND date = $3"),
            Some("slots".to_string())
        );
        assert_eq!(select_table("INSERT INTO staff VALUES ($1, $2, $3)"), None);
        assert_eq!(select_table("garbage"), None);
    }
}
