use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
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
use tracing::debug;

use crate::auth::{self, SharedPasswordAuthSource};
use crate::engine::conflict::make_range;
use crate::engine::{AppointmentFilter, EngineError, ErrorKind, Scheduler};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};

pub struct SlotkeeperHandler {
    scheduler: Arc<Scheduler>,
    query_parser: Arc<SlotkeeperQueryParser>,
}

impl SlotkeeperHandler {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            query_parser: Arc::new(SlotkeeperQueryParser),
        }
    }

    /// The login user name is the caller's identity for the whole session.
    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<Actor> {
        let user = client.metadata().get("user").cloned().unwrap_or_default();
        auth::parse_actor(&user).map_err(|e| user_error("28000", e.to_string()))
    }

    async fn run(&self, actor: &Actor, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();

        let result = self.execute_command(actor, cmd).await;

        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = match &result {
            Ok(_) => "ok",
            Err(_) => "error",
        };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        debug!("{actor} {label}: {status}");

        result.map_err(engine_err)
    }

    async fn execute_command(
        &self,
        actor: &Actor,
        cmd: Command,
    ) -> Result<Vec<Response>, EngineError> {
        let scheduler = &self.scheduler;
        match cmd {
            Command::InsertSlot {
                id,
                provider_id,
                start,
                end,
            } => {
                let range = make_range(start, end)?;
                scheduler
                    .add_slot_with_id(id, actor, provider_id, range)
                    .await?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteSlot { id } => {
                scheduler.remove_slot(id, actor).await?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectSlots {
                provider_id,
                from,
                to,
            } => {
                let slots = scheduler.list_slots(provider_id, from, to).await?;
                Ok(vec![slot_rows(slots)])
            }
            Command::InsertAppointment {
                id,
                slot_id,
                purpose,
            } => {
                scheduler.book_with_id(id, slot_id, actor, &purpose).await?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateAppointment { id, status, notes } => {
                // Cancelling by UPDATE takes the same path as DELETE; notes become the reason.
                if status == AppointmentStatus::Cancelled {
                    scheduler.cancel(id, actor, notes.as_deref()).await?;
                } else {
                    scheduler
                        .update_status(id, status, actor, notes.as_deref())
                        .await?;
                }
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteAppointment { id } => {
                scheduler.cancel(id, actor, None).await?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectAppointments {
                provider_id,
                requester_id,
                status,
            } => {
                let filter = AppointmentFilter {
                    provider_id,
                    requester_id,
                    status,
                };
                let appointments = scheduler.list_appointments(actor, filter).await?;
                Ok(vec![appointment_rows(appointments)])
            }
            Command::SelectAppointmentCounts => {
                let counts = scheduler.appointment_counts(actor).await?;
                Ok(vec![count_rows(counts)])
            }
            Command::SelectUpcoming { limit } => {
                let appointments = scheduler
                    .upcoming_appointments(actor, limit.unwrap_or(0))
                    .await?;
                Ok(vec![appointment_rows(appointments)])
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("provider_id"),
        int_field("start"),
        int_field("end"),
        text_field("status"),
    ]
}

fn appointment_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("slot_id"),
        text_field("provider_id"),
        text_field("requester_id"),
        int_field("start"),
        int_field("end"),
        text_field("status"),
        text_field("purpose"),
        text_field("notes"),
        int_field("created_at"),
    ]
}

fn count_schema() -> Vec<FieldInfo> {
    vec![
        int_field("pending"),
        int_field("confirmed"),
        int_field("completed"),
        int_field("cancelled"),
        int_field("total"),
    ]
}

fn slot_rows(slots: Vec<Slot>) -> Response {
    let schema = Arc::new(slot_schema());
    let rows: Vec<PgWireResult<_>> = slots
        .into_iter()
        .map(|slot| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&slot.id.to_string())?;
            encoder.encode_field(&slot.provider_id.to_string())?;
            encoder.encode_field(&slot.range.start)?;
            encoder.encode_field(&slot.range.end)?;
            encoder.encode_field(&slot.status.as_str())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn appointment_rows(appointments: Vec<Appointment>) -> Response {
    let schema = Arc::new(appointment_schema());
    let rows: Vec<PgWireResult<_>> = appointments
        .into_iter()
        .map(|appt| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&appt.id.to_string())?;
            encoder.encode_field(&appt.slot_id.to_string())?;
            encoder.encode_field(&appt.provider_id.to_string())?;
            encoder.encode_field(&appt.requester_id.to_string())?;
            encoder.encode_field(&appt.range.start)?;
            encoder.encode_field(&appt.range.end)?;
            encoder.encode_field(&appt.status.as_str())?;
            encoder.encode_field(&appt.purpose)?;
            encoder.encode_field(&appt.notes)?;
            encoder.encode_field(&appt.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn count_rows(counts: StatusCounts) -> Response {
    let schema = Arc::new(count_schema());
    let encode = || {
        let mut encoder = DataRowEncoder::new(schema.clone());
        for n in [
            counts.pending,
            counts.confirmed,
            counts.completed,
            counts.cancelled,
            counts.total,
        ] {
            encoder.encode_field(&(n as i64))?;
        }
        Ok(encoder.take_row())
    };
    let row: PgWireResult<_> = encode();
    Response::Query(QueryResponse::new(schema, stream::iter(vec![row])))
}

/// Result columns for a statement, judged from its text since parameters are unbound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return vec![];
    }
    if lower.contains("appointment_counts") {
        count_schema()
    } else if lower.contains("appointments") {
        appointment_schema()
    } else if lower.contains("slots") {
        slot_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotkeeperHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.resolve_actor(client)?;
        self.run(&actor, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotkeeperQueryParser;

#[async_trait]
impl QueryParser for SlotkeeperQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotkeeperHandler {
    type Statement = String;
    type QueryParser = SlotkeeperQueryParser;

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
        let actor = self.resolve_actor(client)?;
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        let mut responses = self.run(&actor, &sql).await?;
        Ok(responses.remove(0))
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Walk `sql` once, handing every `$N` placeholder outside quotes to `on_param` along
/// with the byte range it occupies. Quoted literals and identifiers are passed over whole.
fn scan_params(sql: &str, mut on_param: impl FnMut(usize, std::ops::Range<usize>)) {
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                // A doubled quote is an escaped quote and stays inside the literal.
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == quote {
                        if bytes.get(i + 1) == Some(&quote) {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'$' => {
                let start = i;
                i += 1;
                let digits = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[digits..i].parse::<usize>() {
                    on_param(n, start..i);
                }
            }
            _ => i += 1,
        }
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    scan_params(sql, |n, _| max = max.max(n));
    max
}

/// Inline bound text parameters as quoted literals in a single pass over the statement,
/// so text inside a bound value is never taken for a placeholder.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    scan_params(sql, |n, span| {
        let Some(param) = n.checked_sub(1).and_then(|idx| params.get(idx)) else {
            return;
        };
        result.push_str(&sql[copied..span.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = span.end;
    });
    result.push_str(&sql[copied..]);
    result
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for each error class. Clients retry 40001 by re-reading, never blindly.
pub fn sqlstate(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Validation => "22023",
        ErrorKind::Conflict => "40001",
        ErrorKind::Authorization => "42501",
        ErrorKind::NotFound => "P0002",
        ErrorKind::InvalidTransition | ErrorKind::State => "55000",
        ErrorKind::Limit => "54000",
        ErrorKind::Transport => "58000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(e.kind()), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

// ── Factory ──────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SlotkeeperFactory {
    handler: Arc<SlotkeeperHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SharedPasswordAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotkeeperFactory {
    pub fn new(scheduler: Arc<Scheduler>, password: String) -> Self {
        let auth_source = SharedPasswordAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotkeeperHandler::new(scheduler)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotkeeperFactory {
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

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<SlotkeeperFactory>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory.as_ref().clone()).await
}
