use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::engine::{Engine, EngineError, ReserveRequest, SlotQuery, now_ms};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, AppointmentFilter, Command, SqlError};
use crate::tenant::TenantManager;

/// Single shared password for every user and partition.
#[derive(Debug)]
pub struct SlotdAuthSource {
    password: String,
}

impl SlotdAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SlotdAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

pub struct SlotdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotdQueryParser>,
}

impl SlotdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotdQueryParser),
        }
    }

    /// The partition is the database name the client connected with.
    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("partition error: {e}"),
            )))
        })
    }

    async fn run(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let now = now_ms();
        match cmd {
            Command::InsertEstablishment {
                id,
                name,
                owner_id,
                utc_offset_minutes,
            } => {
                engine
                    .create_establishment(id, name, owner_id, utc_offset_minutes)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertStaff {
                id,
                establishment_id,
                name,
            } => {
                engine
                    .add_staff(id, establishment_id, name)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertServiceAssignment {
                staff_id,
                service_id,
            } => {
                engine
                    .assign_service(staff_id, service_id)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertService {
                id,
                establishment_id,
                name,
                duration_minutes,
                price_minor_units,
            } => {
                engine
                    .create_service(id, establishment_id, name, duration_minutes, price_minor_units)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::DeleteService { id } => {
                engine.remove_service(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::InsertWindow {
                id,
                establishment_id,
                day_of_week,
                start,
                end,
            } => {
                engine
                    .add_window(id, establishment_id, day_of_week, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::DeleteWindow { id } => {
                engine.remove_window(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::InsertAppointment {
                id,
                establishment_id,
                service_id,
                staff_id,
                client_id,
                start,
            } => {
                let req = ReserveRequest {
                    id,
                    establishment_id,
                    service_id,
                    staff_id,
                    client_id,
                    start,
                };
                engine.reserve(req, now).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::CancelAppointment { id, actor_id } => {
                engine.cancel(id, actor_id, now).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::SelectSlots {
                establishment_id,
                service_id,
                staff_id,
                date,
            } => {
                let query = SlotQuery {
                    establishment_id,
                    service_id,
                    staff_id,
                    date,
                };
                let slots = engine.available_slots(&query, now).await.map_err(engine_err)?;
                let est = establishment_id.to_string();
                let service = service_id.to_string();
                let staff = staff_id.map(|s| s.to_string());
                rows("slots", slots, |enc, slot| {
                    enc.encode_field(&est)?;
                    enc.encode_field(&service)?;
                    enc.encode_field(&staff)?;
                    enc.encode_field(&slot.start)?;
                    enc.encode_field(&slot.end)?;
                    enc.encode_field(&wall_clock(slot.start))
                })
            }
            Command::SelectAvailability {
                establishment_id,
                staff_id,
                date,
            } => {
                let spans = engine
                    .free_spans(establishment_id, staff_id, date)
                    .await
                    .map_err(engine_err)?;
                let est = establishment_id.to_string();
                let staff = staff_id.map(|s| s.to_string());
                rows("availability", spans, |enc, span| {
                    enc.encode_field(&est)?;
                    enc.encode_field(&staff)?;
                    enc.encode_field(&span.start)?;
                    enc.encode_field(&span.end)
                })
            }
            Command::SelectAppointments(filter) => {
                let list = match filter {
                    AppointmentFilter::Id(id) => match engine.appointment(id, now).await {
                        Ok(info) => vec![info],
                        Err(EngineError::NotFound(_)) => Vec::new(),
                        Err(e) => return Err(engine_err(e)),
                    },
                    AppointmentFilter::Client(client_id) => {
                        engine.appointments_for_client(client_id, now).await
                    }
                    AppointmentFilter::Establishment { id, date } => engine
                        .appointments_for_establishment(id, date, now)
                        .await
                        .map_err(engine_err)?,
                };
                rows("appointments", list, |enc, a| {
                    enc.encode_field(&a.id.to_string())?;
                    enc.encode_field(&a.establishment_id.to_string())?;
                    enc.encode_field(&a.staff_id.map(|s| s.to_string()))?;
                    enc.encode_field(&a.service_id.to_string())?;
                    enc.encode_field(&a.client_id.to_string())?;
                    enc.encode_field(&a.start)?;
                    enc.encode_field(&a.end)?;
                    enc.encode_field(&a.status.as_str())
                })
            }
            Command::SelectEstablishments => {
                let list = engine.list_establishments().await;
                rows("establishments", list, |enc, e| {
                    enc.encode_field(&e.id.to_string())?;
                    enc.encode_field(&e.name)?;
                    enc.encode_field(&e.owner_id.to_string())?;
                    enc.encode_field(&e.utc_offset_minutes)
                })
            }
            Command::SelectWindows { establishment_id } => {
                let list = engine.windows(establishment_id).await.map_err(engine_err)?;
                rows("windows", list, |enc, w| {
                    enc.encode_field(&w.id.to_string())?;
                    enc.encode_field(&w.establishment_id.to_string())?;
                    enc.encode_field(&i16::from(w.day_of_week))?;
                    enc.encode_field(&w.start.to_string())?;
                    enc.encode_field(&w.end.to_string())
                })
            }
            Command::SelectServices { establishment_id } => {
                let list = engine.services(establishment_id).await.map_err(engine_err)?;
                rows("services", list, |enc, s| {
                    enc.encode_field(&s.id.to_string())?;
                    enc.encode_field(&s.establishment_id.to_string())?;
                    enc.encode_field(&s.name)?;
                    enc.encode_field(&i64::from(s.duration_minutes))?;
                    enc.encode_field(&i64::try_from(s.price_minor_units).unwrap_or(i64::MAX))
                })
            }
            Command::SelectStaff { establishment_id } => {
                let list = engine.staff(establishment_id).await.map_err(engine_err)?;
                rows("staff", list, |enc, m| {
                    let mut services: Vec<String> = m.services.iter().map(|s| s.to_string()).collect();
                    services.sort();
                    enc.encode_field(&m.id.to_string())?;
                    enc.encode_field(&m.establishment_id.to_string())?;
                    enc.encode_field(&m.name)?;
                    enc.encode_field(&services.join(","))
                })
            }
        }
    }
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn deleted() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

fn rows<T>(
    table: &str,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema_for(table));
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// `2030-01-07 09:30` for a wall-clock millisecond instant.
fn wall_clock(ms: Ms) -> Option<String> {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.naive_utc().format("%Y-%m-%d %H:%M").to_string())
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

/// Result columns of `SELECT … FROM <table>`. Empty for unknown tables.
fn schema_for(table: &str) -> Vec<FieldInfo> {
    match table {
        "slots" => vec![
            field("establishment_id", Type::VARCHAR),
            field("service_id", Type::VARCHAR),
            field("staff_id", Type::VARCHAR),
            field("start", Type::INT8),
            field("end", Type::INT8),
            field("start_time", Type::VARCHAR),
        ],
        "availability" => vec![
            field("establishment_id", Type::VARCHAR),
            field("staff_id", Type::VARCHAR),
            field("start", Type::INT8),
            field("end", Type::INT8),
        ],
        "appointments" => vec![
            field("id", Type::VARCHAR),
            field("establishment_id", Type::VARCHAR),
            field("staff_id", Type::VARCHAR),
            field("service_id", Type::VARCHAR),
            field("client_id", Type::VARCHAR),
            field("start", Type::INT8),
            field("end", Type::INT8),
            field("status", Type::VARCHAR),
        ],
        "establishments" => vec![
            field("id", Type::VARCHAR),
            field("name", Type::VARCHAR),
            field("owner_id", Type::VARCHAR),
            field("utc_offset_minutes", Type::INT2),
        ],
        "windows" => vec![
            field("id", Type::VARCHAR),
            field("establishment_id", Type::VARCHAR),
            field("day_of_week", Type::INT2),
            field("start_time", Type::VARCHAR),
            field("end_time", Type::VARCHAR),
        ],
        "services" => vec![
            field("id", Type::VARCHAR),
            field("establishment_id", Type::VARCHAR),
            field("name", Type::VARCHAR),
            field("duration_minutes", Type::INT8),
            field("price", Type::INT8),
        ],
        "staff" => vec![
            field("id", Type::VARCHAR),
            field("establishment_id", Type::VARCHAR),
            field("name", Type::VARCHAR),
            field("services", Type::VARCHAR),
        ],
        _ => Vec::new(),
    }
}

fn statement_schema(sql: &str) -> Vec<FieldInfo> {
    sql::select_table(sql)
        .map(|table| schema_for(&table))
        .unwrap_or_default()
}

#[async_trait]
impl SimpleQueryHandler for SlotdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let commands = sql::parse_batch(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(commands.len());
        for cmd in commands {
            responses.push(self.run(&engine, cmd).await?);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotdQueryParser;

#[async_trait]
impl QueryParser for SlotdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(statement_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotdHandler {
    type Statement = String;
    type QueryParser = SlotdQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(&engine, cmd).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            statement_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

fn substitute_params(portal: &Portal<String>) -> String {
    inline_params(&portal.statement.statement, &portal.parameters)
}

/// Inline bound parameters (text format) as quoted literals in one pass, so
/// text inside a bound value is never taken for a placeholder.
fn inline_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let param = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match param {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&rest[pos..=pos + digits]),
        }
        rest = &after[digits..];
    }
    out.push_str(rest);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotdFactory {
    handler: Arc<SlotdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(SlotdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SlotdAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotdFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(SlotdFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

/// SQLSTATE for an engine error. `40001` tells clients the call is safe to
/// retry as a whole.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) | EngineError::NotAssigned { .. } => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Conflict(_) => "23P01",
        EngineError::InvalidRange(_) | EngineError::OutsideOpeningHours(_) => "22023",
        EngineError::Forbidden { .. } => "42501",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Storage(_) | EngineError::CommitTimeout => "40001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn count_params_finds_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM staff"), 0);
        assert_eq!(count_params("INSERT INTO staff VALUES ($1, $2, $3)"), 3);
        assert_eq!(count_params("SELECT $12, $3"), 12);
        assert_eq!(count_params("SELECT '$' || $2"), 2);
    }

    #[test]
    fn inline_params_substitutes_each_placeholder_once() {
        let params = [Some(b"Ana $2".to_vec()), Some(b"it's".to_vec()), None];
        assert_eq!(
            inline_params("VALUES ($1, $2, $3)", &params),
            "VALUES ('Ana $2', 'it''s', NULL)"
        );
        let many: Vec<Option<Vec<u8>>> = (1..=12).map(|i| Some(i.to_string().into_bytes())).collect();
        assert_eq!(inline_params("$12 $1", &many), "'12' '1'");
        assert_eq!(inline_params("cost $ and $9", &params), "cost $ and $9");
    }

    #[test]
    fn retryable_errors_map_to_serialization_failure() {
        for e in [EngineError::Storage("disk full".into()), EngineError::CommitTimeout] {
            assert!(e.is_retryable());
            assert_eq!(sqlstate(&e), "40001");
        }
        assert_eq!(sqlstate(&EngineError::Conflict(Ulid::new())), "23P01");
        assert_eq!(sqlstate(&EngineError::NotFound(Ulid::new())), "P0002");
        assert_eq!(
            sqlstate(&EngineError::OutsideOpeningHours(Span::new(0, 1))),
            "22023"
        );
    }

    #[test]
    fn describe_uses_select_table() {
        let schema = statement_schema(
            "SELECT * FROM slots WHERE establishment_id = $1 AND service_id = $2 AND date = $3",
        );
        let names: Vec<String> = schema.iter().map(|f| f.name().to_string()).collect();
        assert_eq!(
            names,
            ["establishment_id", "service_id", "staff_id", "start", "end", "start_time"]
        );
        assert!(statement_schema("INSERT INTO staff VALUES ($1, $2, $3)").is_empty());
    }

    #[test]
    fn wall_clock_formats_minutes() {
        let date = chrono::NaiveDate::from_ymd_opt(2030, 1, 7).unwrap();
        let ms = day_start(date) + 9 * 3_600_000 + 30 * 60_000;
        assert_eq!(wall_clock(ms).as_deref(), Some("2030-01-07 09:30"));
    }
}
