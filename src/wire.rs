use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{stream, Sink, SinkExt};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::auth::LineupAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;
use crate::time::format_timestamp;

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
) -> std::io::Result<()> {
    let factory = Arc::new(LineupFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, None, factory).await
}

/// Query handler for a single connection.
pub struct LineupHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<LineupQueryParser>,
    /// LISTEN channel → stage id and a receiver on that stage's notify channel.
    subscriptions: DashMap<String, (Ulid, broadcast::Receiver<Mutation>)>,
}

impl LineupHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(LineupQueryParser),
            subscriptions: DashMap::new(),
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

    /// Parse, execute and record RED metrics for one statement, then flush
    /// any notifications pending for this connection.
    async fn run_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = match sql::parse_sql(query) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(observability::QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                    .increment(1);
                return Err(sql_err(e));
            }
        };

        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&engine, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);

        self.deliver_notifications(client).await?;
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertEvent(new) => {
                engine.create_event(new).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateEvent { id, patch } => {
                match engine.update_event(id, patch).await.map_err(engine_err)? {
                    Some(_) => Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))]),
                    None => Err(engine_err(EngineError::NotFound(id))),
                }
            }
            Command::DeleteEvent { id } => {
                if engine.delete_event(id).await.map_err(engine_err)? {
                    Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
                } else {
                    Err(engine_err(EngineError::NotFound(id)))
                }
            }
            Command::SelectEvents(filter) => {
                let events = engine.list_events(&filter);
                let schema = Arc::new(events_schema());
                let rows: Vec<PgWireResult<_>> = events
                    .iter()
                    .map(|view| encode_event_row(&schema, view))
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectTags => {
                let schema = Arc::new(tags_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .tags()
                    .into_iter()
                    .map(|tag| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&tag)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectStages => {
                let entries = engine
                    .list_stages()
                    .into_iter()
                    .map(|s| (s.id, s.name))
                    .collect();
                Ok(vec![directory_response(entries)])
            }
            Command::SelectTalents => {
                let entries = engine
                    .list_talents()
                    .into_iter()
                    .map(|t| (t.id, t.name))
                    .collect();
                Ok(vec![directory_response(entries)])
            }
            Command::SelectEventExists {
                event_id,
                talent_id,
                stage_id,
            } => {
                let exists = engine.event_exists(
                    event_id.as_deref(),
                    talent_id.as_deref(),
                    stage_id.as_deref(),
                );
                let schema = Arc::new(exists_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&exists)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::InsertStage { id, name } => {
                engine.register_stage(id, name).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertTalent { id, name } => {
                engine.register_talent(id, name).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::Listen { channel } => {
                let stage_id = parse_channel(&channel)?;
                // Re-LISTEN keeps the existing receiver so nothing is delivered twice.
                self.subscriptions
                    .entry(channel)
                    .or_insert_with(|| (stage_id, engine.notify.subscribe(stage_id)));
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                self.subscriptions.remove(&channel);
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::UnlistenAll => {
                self.subscriptions.clear();
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }

    /// Send every mutation received on this connection's channels since the
    /// last statement as a NotificationResponse.
    async fn deliver_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let mut pending = Vec::new();
        for mut entry in self.subscriptions.iter_mut() {
            let channel = entry.key().clone();
            let (stage_id, rx) = entry.value_mut();
            let stage_id = *stage_id;
            loop {
                match rx.try_recv() {
                    Ok(mutation) => {
                        pending.push((channel.clone(), notification_payload(&mutation, stage_id)))
                    }
                    Err(TryRecvError::Lagged(skipped)) => {
                        warn!(%channel, skipped, "listener lagged, notifications dropped");
                    }
                    Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                }
            }
        }
        for (channel, payload) in pending {
            debug!(%channel, "notify");
            client
                .send(PgWireBackendMessage::NotificationResponse(
                    NotificationResponse::new(0, channel, payload),
                ))
                .await?;
        }
        Ok(())
    }
}

fn parse_channel(channel: &str) -> PgWireResult<Ulid> {
    let stage_id_str = channel.strip_prefix("stage_").ok_or_else(|| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("invalid channel: {channel} (expected stage_{{id}})"),
        )))
    })?;
    Ulid::from_string(stage_id_str).map_err(|e| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("bad ULID in channel: {e}"),
        )))
    })
}

/// JSON payload for a mutation delivered on the channel of `stage_id`.
/// A stage move reaches both stages, each payload naming its own channel's stage.
fn notification_payload(mutation: &Mutation, stage_id: Ulid) -> String {
    let id = match mutation {
        Mutation::EventCreated { record } => record.id,
        Mutation::EventUpdated { id, .. }
        | Mutation::EventDeleted { id, .. }
        | Mutation::StageRegistered { id, .. }
        | Mutation::TalentRegistered { id, .. } => *id,
    };
    json!({
        "kind": mutation.kind(),
        "id": id.to_string(),
        "stage_id": stage_id.to_string(),
    })
    .to_string()
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn events_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("stage_id", Type::VARCHAR),
        text_field("stage_name", Type::VARCHAR),
        text_field("start", Type::VARCHAR),
        text_field("end", Type::VARCHAR),
        text_field("tags", Type::VARCHAR),
        text_field("talents", Type::VARCHAR),
        text_field("collaborators", Type::VARCHAR),
        text_field("kind", Type::VARCHAR),
        text_field("description", Type::VARCHAR),
        text_field("deleted", Type::BOOL),
        text_field("last_modified", Type::INT8),
    ]
}

fn tags_schema() -> Vec<FieldInfo> {
    vec![text_field("tag", Type::VARCHAR)]
}

fn directory_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
    ]
}

fn exists_schema() -> Vec<FieldInfo> {
    vec![text_field("exists", Type::BOOL)]
}

/// Result columns of a statement, by the table it selects from.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let mut tokens = upper.split_whitespace();
    if tokens.next() != Some("SELECT") {
        return vec![];
    }
    let table = tokens
        .skip_while(|t| *t != "FROM")
        .nth(1)
        .map(|t| t.trim_matches(|c| c == ';' || c == '"'));
    match table {
        Some("EVENTS") => events_schema(),
        Some("TAGS") => tags_schema(),
        Some("STAGES") | Some("TALENTS") => directory_schema(),
        Some("EVENT_EXISTS") => exists_schema(),
        _ => vec![],
    }
}

fn refs_json(refs: &[TalentRef]) -> String {
    let refs: Vec<_> = refs
        .iter()
        .map(|r| json!({ "id": r.id.to_string(), "name": r.name }))
        .collect();
    json!(refs).to_string()
}

fn encode_event_row(
    schema: &Arc<Vec<FieldInfo>>,
    view: &EventView,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let event = &view.event;
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&event.id.to_string())?;
    encoder.encode_field(&event.name)?;
    encoder.encode_field(&event.stage_id.map(|s| s.to_string()))?;
    encoder.encode_field(&view.stage.as_ref().and_then(|s| s.name.clone()))?;
    encoder.encode_field(&event.start().map(format_timestamp))?;
    encoder.encode_field(&event.end().map(format_timestamp))?;
    encoder.encode_field(&json!(event.tags).to_string())?;
    encoder.encode_field(&refs_json(&view.talents))?;
    encoder.encode_field(&refs_json(&view.collaborators))?;
    encoder.encode_field(&event.kind)?;
    encoder.encode_field(&event.description)?;
    encoder.encode_field(&event.deleted)?;
    encoder.encode_field(&event.last_modified)?;
    Ok(encoder.take_row())
}

fn directory_response(entries: Vec<(Ulid, String)>) -> Response {
    let schema = Arc::new(directory_schema());
    let rows: Vec<PgWireResult<_>> = entries
        .into_iter()
        .map(|(id, name)| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&id.to_string())?;
            encoder.encode_field(&name)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

#[async_trait]
impl SimpleQueryHandler for LineupHandler {
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
        self.run_query(client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct LineupQueryParser;

#[async_trait]
impl QueryParser for LineupQueryParser {
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
impl ExtendedQueryHandler for LineupHandler {
    type Statement = String;
    type QueryParser = LineupQueryParser;

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
        let sql = substitute_params(portal);
        let responses = self.run_query(client, &sql).await?;
        Ok(responses.into_iter().next().unwrap_or(Response::EmptyQuery))
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
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Replaced highest-first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct LineupFactory {
    handler: Arc<LineupHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<LineupAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl LineupFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = LineupAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(LineupHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for LineupFactory {
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

/// SQLSTATE for an engine error: exclusion violation for overlaps, check
/// violation for date rules, no-data for missing events.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::EventsOverlap(_) => "23P01",
        EngineError::InvertedDates
        | EngineError::TooShort { .. }
        | EngineError::TooLong { .. }
        | EngineError::MissingDate => "23514",
        EngineError::NotFound(_) => "02000",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::UnknownReference { .. } => "23503",
        EngineError::LimitExceeded(_) | EngineError::WalError(_) => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if e.is_schedule_rejection() {
        warn!("schedule rejected: {e}");
    }
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
