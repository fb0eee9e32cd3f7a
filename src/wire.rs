use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{
    AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler,
};
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

use crate::engine::{AllocError, Engine, EngineError, StoreError};
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(OrcdeskFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Auth ─────────────────────────────────────────────────────────

/// One shared cleartext password for every user and tenant.
#[derive(Debug)]
pub struct OrcdeskAuthSource {
    password: String,
}

impl OrcdeskAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for OrcdeskAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Handler ──────────────────────────────────────────────────────

pub struct OrcdeskHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<OrcdeskQueryParser>,
}

impl OrcdeskHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(OrcdeskQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            user_error("08006", format!("tenant error: {e}"))
        })
    }

    /// Parse, run and record metrics for one statement.
    async fn run(&self, engine: &Engine, sql: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();

        let result = self.execute_command(engine, cmd).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::UpsertCalendarEvents { events } => {
                let count = engine
                    .upsert_calendar_events(events)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(count))])
            }
            Command::DeleteCalendarEvent { id } => {
                engine.remove_calendar_event(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectCalendarEvents => {
                let schema = Arc::new(calendar_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .calendar_events()
                    .into_iter()
                    .map(|event| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&event.id.to_string())?;
                        encoder.encode_field(&event.start_date_time)?;
                        encoder.encode_field(&event.start_date)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectBusySlots { date } => Ok(vec![slot_response(engine.busy_slots(&date))]),
            Command::SelectOpenSlots { date } => Ok(vec![slot_response(engine.open_slots(&date))]),
            Command::IssueDocument {
                kind,
                id,
                client,
                returning,
            } => {
                let document = engine
                    .issue_document(kind, id, client)
                    .await
                    .map_err(engine_err)?;
                if !returning {
                    return Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))]);
                }
                let schema = Arc::new(issued_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&document.id.to_string())?;
                encoder.encode_field(&document.number.to_string())?;
                let row = encoder.take_row();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![Ok(row)]),
                ))])
            }
            Command::DeleteDocument { kind, id } => {
                engine.delete_document(kind, id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectDocuments { kind, year } => {
                let schema = Arc::new(document_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_documents(kind, year)
                    .into_iter()
                    .map(|doc| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&doc.id.to_string())?;
                        encoder.encode_field(&doc.number.to_string())?;
                        encoder.encode_field(&doc.client)?;
                        encoder.encode_field(&doc.created_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectNextNumber { kind } => {
                let number = engine.preview_number(kind).await.map_err(engine_err)?;
                let schema = Arc::new(number_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&kind.label().to_string())?;
                encoder.encode_field(&number.to_string())?;
                let row = encoder.take_row();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![Ok(row)]),
                ))])
            }
        }
    }
}

fn slot_response(slots: Vec<String>) -> Response {
    let schema = Arc::new(slot_schema());
    let rows: Vec<PgWireResult<_>> = slots
        .into_iter()
        .map(|slot| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&slot)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

// ── Schemas ──────────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![text_field("slot")]
}

fn calendar_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("start_date_time"),
        text_field("start_date"),
    ]
}

fn issued_schema() -> Vec<FieldInfo> {
    vec![text_field("id"), text_field("number")]
}

fn document_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("number"),
        text_field("client"),
        FieldInfo::new("created_at".into(), None, None, Type::INT8, FieldFormat::Text),
    ]
}

fn number_schema() -> Vec<FieldInfo> {
    vec![text_field("kind"), text_field("number")]
}

/// Row shape of a statement, judged from its text. Used for Describe.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.contains("RETURNING") {
        issued_schema()
    } else if !upper.contains("SELECT") {
        vec![]
    } else if upper.contains("BUSY_SLOTS") || upper.contains("OPEN_SLOTS") {
        slot_schema()
    } else if upper.contains("NEXT_NUMBER") {
        number_schema()
    } else if upper.contains("CALENDAR_EVENTS") {
        calendar_schema()
    } else if upper.contains("QUOTES") || upper.contains("INVOICES") {
        document_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for OrcdeskHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        self.run(&engine, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct OrcdeskQueryParser;

#[async_trait]
impl QueryParser for OrcdeskQueryParser {
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
impl ExtendedQueryHandler for OrcdeskHandler {
    type Statement = String;
    type QueryParser = OrcdeskQueryParser;

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
        let sql = bind_params(&portal.statement.statement, &portal.parameters);
        let mut responses = self.run(&engine, &sql).await?;
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

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let (n, end) = placeholder_at(sql, i);
                if let Some(n) = n {
                    max = max.max(n);
                }
                i = end;
            }
            _ => i += 1,
        }
    }
    max
}

/// Index parsed from the `$N` at `dollar`, and where the token ends.
fn placeholder_at(sql: &str, dollar: usize) -> (Option<usize>, usize) {
    let bytes = sql.as_bytes();
    let start = dollar + 1;
    let mut end = start;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    (sql[start..end].parse::<usize>().ok(), end)
}

/// Swap each `$N` outside string literals for its bound value, quoted, in a
/// single left-to-right pass. Bound text is never rescanned.
fn bind_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let (n, end) = placeholder_at(sql, i);
                let param = n
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|idx| params.get(idx));
                if let Some(param) = param {
                    out.push_str(&sql[copied..i]);
                    out.push_str(&quote_param(param.as_ref().map(|p| AsRef::<[u8]>::as_ref(p))));
                    copied = end;
                }
                i = end;
            }
            _ => i += 1,
        }
    }
    out.push_str(&sql[copied..]);
    out
}

fn quote_param(param: Option<&[u8]>) -> String {
    match param {
        Some(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            format!("'{}'", text.replace('\'', "''"))
        }
        None => "NULL".to_string(),
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct OrcdeskFactory {
    handler: Arc<OrcdeskHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<OrcdeskAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl OrcdeskFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = OrcdeskAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(OrcdeskHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for OrcdeskFactory {
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

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for an engine failure. Exhaustion is a serialization failure so
/// clients treat it as retryable.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Allocation(AllocError::Exhausted { .. }) => "40001",
        EngineError::Allocation(AllocError::Store(StoreError::DuplicateNumber(_)))
        | EngineError::AlreadyExists(_) => "23505",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
