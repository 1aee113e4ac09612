use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::{Sink, SinkExt};
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
use pgwire::messages::response::NoticeResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::AllotAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, ResultKind, SqlError};
use crate::tenant::TenantManager;
use crate::time::{format_instant, now_ms};

pub struct AllotHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<AllotQueryParser>,
}

impl AllotHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(AllotQueryParser),
        }
    }

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
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Run one parsed statement, recording query metrics.
    async fn run_command<C>(
        &self,
        client: &mut C,
        engine: &Engine,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(client, engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        debug!(command = label, status, "query");
        result
    }

    async fn execute_command<C>(
        &self,
        client: &mut C,
        engine: &Engine,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        match cmd {
            Command::InsertEvent {
                title,
                start,
                end,
                description,
            } => {
                engine
                    .create_event(title, start, end, description)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateEvent { id, patch } => {
                let updated = engine.update_event(id, patch).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(
                    Tag::new("UPDATE").with_rows(updated.is_some() as usize),
                )])
            }
            Command::DeleteEvent { id } => {
                let deleted = engine.delete_event(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(
                    Tag::new("DELETE").with_rows(deleted as usize),
                )])
            }
            Command::InsertResource { name, kind } => {
                engine
                    .create_resource(name, kind)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateResource { id, patch } => {
                let updated = engine.update_resource(id, patch).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(
                    Tag::new("UPDATE").with_rows(updated.is_some() as usize),
                )])
            }
            Command::DeleteResource { id } => {
                let deleted = engine.delete_resource(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(
                    Tag::new("DELETE").with_rows(deleted as usize),
                )])
            }
            Command::InsertAllocation {
                event_id,
                resource_id,
            } => {
                // Answered with the overlaps found; no rows means a clean allocation.
                let outcome = engine
                    .allocate(event_id, resource_id)
                    .await
                    .map_err(engine_err)?;
                if !outcome.conflicts.is_empty() {
                    client
                        .send(PgWireBackendMessage::NoticeResponse(conflict_notice()))
                        .await?;
                }
                Ok(vec![conflict_rows(&outcome.conflicts)])
            }
            Command::DeleteAllocation { id } => {
                let deleted = engine.deallocate(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(
                    Tag::new("DELETE").with_rows(deleted as usize),
                )])
            }
            Command::SelectEvents { id } => {
                let events = match id {
                    Some(id) => engine.get_event(id).await.into_iter().collect(),
                    None => engine.list_events().await,
                };
                Ok(vec![encode_rows(ResultKind::Events, &events, |enc, e| {
                    enc.encode_field(&(e.id as i64))?;
                    enc.encode_field(&e.title)?;
                    enc.encode_field(&format_instant(e.span.start))?;
                    enc.encode_field(&format_instant(e.span.end))?;
                    enc.encode_field(&e.description)
                })])
            }
            Command::SelectResources { id } => {
                let resources = match id {
                    Some(id) => engine.get_resource(id).await.into_iter().collect(),
                    None => engine.list_resources().await,
                };
                Ok(vec![encode_rows(ResultKind::Resources, &resources, |enc, r| {
                    enc.encode_field(&(r.id as i64))?;
                    enc.encode_field(&r.name)?;
                    enc.encode_field(&r.kind)
                })])
            }
            Command::SelectAllocations { filter } => {
                let allocations = engine.list_allocations(filter).await;
                Ok(vec![encode_rows(ResultKind::Allocations, &allocations, |enc, a| {
                    enc.encode_field(&(a.id as i64))?;
                    enc.encode_field(&(a.event_id as i64))?;
                    enc.encode_field(&(a.resource_id as i64))?;
                    enc.encode_field(&a.conflict)
                })])
            }
            Command::SelectConflicts => {
                let conflicts = engine.list_conflicts().await;
                Ok(vec![conflict_rows(&conflicts)])
            }
            Command::SelectUtilization { start, end, now } => {
                let rows = engine
                    .utilization(start, end, now.unwrap_or_else(now_ms))
                    .await
                    .map_err(engine_err)?;
                Ok(vec![encode_rows(ResultKind::Utilization, &rows, |enc, u| {
                    enc.encode_field(&u.resource)?;
                    enc.encode_field(&(u.total_events as i64))?;
                    enc.encode_field(&u.hours)?;
                    enc.encode_field(&(u.upcoming as i64))
                })])
            }
        }
    }
}

fn conflict_notice() -> NoticeResponse {
    ErrorInfo::new("WARNING".into(), "01000".into(), CONFLICT_MESSAGE.into()).into()
}

fn conflict_rows(conflicts: &[ConflictRecord]) -> Response {
    encode_rows(ResultKind::Conflicts, conflicts, |enc, c| {
        enc.encode_field(&c.resource)?;
        enc.encode_field(&c.event1)?;
        enc.encode_field(&c.event1_time)?;
        enc.encode_field(&c.event2)?;
        enc.encode_field(&c.event2_time)
    })
}

fn encode_rows<T>(
    kind: ResultKind,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(result_schema(kind));
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

pub fn result_schema(kind: ResultKind) -> Vec<FieldInfo> {
    match kind {
        ResultKind::Events => vec![
            field("id", Type::INT8),
            field("title", Type::VARCHAR),
            field("start", Type::VARCHAR),
            field("end", Type::VARCHAR),
            field("description", Type::VARCHAR),
        ],
        ResultKind::Resources => vec![
            field("id", Type::INT8),
            field("name", Type::VARCHAR),
            field("type", Type::VARCHAR),
        ],
        ResultKind::Allocations => vec![
            field("id", Type::INT8),
            field("event_id", Type::INT8),
            field("resource_id", Type::INT8),
            field("conflict", Type::BOOL),
        ],
        ResultKind::Conflicts => vec![
            field("resource", Type::VARCHAR),
            field("event1", Type::VARCHAR),
            field("event1_time", Type::VARCHAR),
            field("event2", Type::VARCHAR),
            field("event2_time", Type::VARCHAR),
        ],
        ResultKind::Utilization => vec![
            field("resource", Type::VARCHAR),
            field("total_events", Type::INT8),
            field("hours", Type::FLOAT8),
            field("upcoming", Type::INT8),
        ],
    }
}

fn statement_schema(sql: &str) -> Vec<FieldInfo> {
    sql::result_kind(sql).map(result_schema).unwrap_or_default()
}

#[async_trait]
impl SimpleQueryHandler for AllotHandler {
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
        let engine = self.resolve_engine(client)?;
        let cmds = sql::parse_script(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(cmds.len());
        // A failing statement ends the batch. Statements before it stay
        // applied and keep their responses.
        for cmd in cmds {
            match self.run_command(client, &engine, cmd).await {
                Ok(r) => responses.extend(r),
                Err(e) => {
                    responses.push(error_response(e)?);
                    break;
                }
            }
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct AllotQueryParser;

#[async_trait]
impl QueryParser for AllotQueryParser {
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
        Ok(statement_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for AllotHandler {
    type Statement = String;
    type QueryParser = AllotQueryParser;

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
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let responses = self.run_command(client, &engine, cmd).await?;
        responses
            .into_iter()
            .next()
            .ok_or_else(|| PgWireError::ApiError("statement produced no response".into()))
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

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    max = max.max(n);
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Replace `$N` placeholders with bound parameter values (text format) in a
/// single left-to-right pass. Placeholders inside quoted literals or
/// identifiers are left alone, and inserted values are never rescanned.
fn bind_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<u8> = None;
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let digits = bytes[i + 1..]
                    .iter()
                    .take_while(|c| c.is_ascii_digit())
                    .count();
                let param = sql[i + 1..i + 1 + digits]
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|n| params.get(n));
                if let Some(param) = param {
                    out.push_str(&sql[copied..i]);
                    out.push_str(&param_literal(param.as_ref()));
                    i += 1 + digits;
                    copied = i;
                    continue;
                }
            }
            None => {}
        }
        i += 1;
    }
    out.push_str(&sql[copied..]);
    out
}

fn param_literal<P: AsRef<[u8]>>(param: Option<&P>) -> String {
    match param {
        Some(bytes) => {
            let text = String::from_utf8_lossy(bytes.as_ref());
            format!("'{}'", text.replace('\'', "''"))
        }
        None => "NULL".to_string(),
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct AllotFactory {
    handler: Arc<AllotHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<AllotAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl AllotFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = AllotAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(AllotHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for AllotFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(AllotFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidSpan { .. } => "22007",
        EngineError::DuplicateAllocation { .. } => "23505",
        EngineError::NotFound(..) => "P0002",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        engine_sqlstate(&e).into(),
        e.to_string(),
    )))
}

/// Turn a statement failure into an in-batch error response. Protocol
/// failures still abort the whole query.
fn error_response(e: PgWireError) -> PgWireResult<Response> {
    match e {
        PgWireError::UserError(info) => Ok(Response::Error(info)),
        other => Err(other),
    }
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match &e {
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(..) => "42703",
        SqlError::Unsupported(_) => "0A000",
        _ => "42601",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}
