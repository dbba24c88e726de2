use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream;
use futures::{Sink, SinkExt, StreamExt};
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
use pgwire::api::{
    ClientInfo, ClientPortalStore, ErrorHandler, NoopHandler, PgWireConnectionState,
    PgWireServerHandlers, Type,
};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::response::NotificationResponse;
use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::server::{negotiate_tls, process_error, process_message};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use ulid::Ulid;

use crate::auth::TallyAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

/// Per-connection handler: executes parsed commands against the tenant's
/// engine and keeps this connection's LISTEN registrations. Each registered
/// channel runs a forwarder task that copies hub events into `notif_tx`; the
/// connection loop drains that queue onto the socket.
pub struct TallyHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<TallyQueryParser>,
    notif_tx: mpsc::UnboundedSender<(String, String)>,
    listens: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TallyHandler {
    pub fn new(
        tenant_manager: Arc<TenantManager>,
        notif_tx: mpsc::UnboundedSender<(String, String)>,
    ) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(TallyQueryParser),
            notif_tx,
            listens: Mutex::new(HashMap::new()),
        }
    }

    /// Bridge one hub channel into this connection's notification queue.
    /// Repeating a LISTEN is a no-op; one registration means one delivery
    /// per event.
    fn start_listen(&self, engine: &Engine, channel: String, channel_id: Ulid) {
        let mut listens = self.listens.lock().unwrap();
        if listens.contains_key(&channel) {
            return;
        }
        let mut rx = engine.notify.subscribe(channel_id);
        let tx = self.notif_tx.clone();
        let name = channel.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let payload = serde_json::to_string(&event).unwrap_or_default();
                        if tx.send((name.clone(), payload)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        listens.insert(channel, task);
    }

    fn stop_listen(&self, channel: &str) {
        if let Some(task) = self.listens.lock().unwrap().remove(channel) {
            task.abort();
        }
    }

    fn stop_all_listens(&self) {
        for (_, task) in self.listens.lock().unwrap().drain() {
            task.abort();
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

    async fn run_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertAccount { id } => {
                engine.open_account(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertPayment {
                id,
                account_id,
                method,
                amount,
                external_reference,
                status,
            } => {
                engine
                    .record_payment(account_id, id, method, amount, external_reference, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertAdjustment {
                account_id,
                direction,
                amount,
                admin_id,
                note,
            } => {
                engine
                    .admin_adjust(account_id, direction, amount, note, admin_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertSubscription { id, account_id, plan } => {
                engine
                    .grant_subscription(id, account_id, plan)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertBooking {
                id,
                account_id,
                resource_id,
                date,
                range,
                funding,
            } => {
                engine
                    .create_booking(id, account_id, resource_id, date, range, funding)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertReferralBonus {
                referrer,
                referred,
                amount,
            } => {
                engine
                    .referral_bonus(referrer, referred, amount)
                    .await
                    .map_err(engine_err)?;
                // one credit per account
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(2))])
            }
            Command::UpdateSessionStatus { id, status } => {
                engine.close_session(id, status).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::UpdateSubscriptionStatus { id, status } => {
                engine
                    .set_subscription_status(id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteBooking { id } => {
                engine.mark_cancelled(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectBalance { account_id } => {
                let balance = engine.balance_of(account_id).await.map_err(engine_err)?;
                let schema = Arc::new(balance_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&account_id.to_string())?;
                encoder.encode_field(&balance.to_string())?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectLedger { account_id } => {
                let entries = engine.ledger_of(account_id).await.map_err(engine_err)?;
                let schema = Arc::new(ledger_schema());
                let rows: Vec<PgWireResult<_>> = entries
                    .iter()
                    .map(|e| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&e.id.to_string())?;
                        encoder.encode_field(&(e.seq as i64))?;
                        encoder.encode_field(&e.direction.as_str())?;
                        encoder.encode_field(&e.amount.to_string())?;
                        encoder.encode_field(&e.cause.label())?;
                        encoder.encode_field(&actor_text(&e.actor))?;
                        encoder.encode_field(&e.balance_before.to_string())?;
                        encoder.encode_field(&e.balance_after.to_string())?;
                        encoder.encode_field(&e.created_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectPayments { account_id } => {
                let payments = engine.payments_of(account_id).await.map_err(engine_err)?;
                let schema = Arc::new(payments_schema());
                let rows: Vec<PgWireResult<_>> = payments
                    .iter()
                    .map(|p| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&p.id.to_string())?;
                        encoder.encode_field(&p.method.as_str())?;
                        encoder.encode_field(&p.amount.to_string())?;
                        encoder.encode_field(&p.external_reference)?;
                        encoder.encode_field(&p.status.as_str())?;
                        encoder.encode_field(&p.created_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectSubscriptions { account_id } => {
                let subs = engine
                    .subscriptions_of(account_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(subscriptions_schema());
                let rows: Vec<PgWireResult<_>> = subs
                    .iter()
                    .map(|s| {
                        let ends_at = match s.plan {
                            Plan::Annual { ends_at } => Some(ends_at),
                            Plan::SessionPack { .. } => None,
                        };
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.plan.kind())?;
                        encoder.encode_field(&s.status.as_str())?;
                        encoder.encode_field(&s.remaining().map(|r| r as i64))?;
                        encoder.encode_field(&ends_at)?;
                        encoder.encode_field(&s.started_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectSessions { account_id } => {
                let sessions = engine.sessions_of(account_id).await.map_err(engine_err)?;
                let schema = Arc::new(sessions_schema());
                let rows: Vec<PgWireResult<_>> = sessions
                    .iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.resource_id.to_string())?;
                        encoder.encode_field(&s.date.to_string())?;
                        encoder.encode_field(&minutes_to_hhmm(s.range.start))?;
                        encoder.encode_field(&minutes_to_hhmm(s.range.end))?;
                        encoder.encode_field(&s.status.as_str())?;
                        encoder.encode_field(&s.subscription_id.map(|id| id.to_string()))?;
                        encoder.encode_field(&s.booked_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectSlots { resource_id, date } => {
                let slots = engine.slots_on(resource_id, date).await;
                Ok(vec![slot_rows(resource_id, date, slots)?])
            }
            Command::SelectConflicts {
                resource_id,
                date,
                range,
            } => {
                let hits = engine
                    .conflicts_on(resource_id, date, range)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![slot_rows(resource_id, date, hits)?])
            }
            Command::SelectAudit { account_id } => {
                let reports = match account_id {
                    Some(id) => vec![engine.audit_account(id).await.map_err(engine_err)?],
                    None => engine.audit_all().await,
                };
                let schema = Arc::new(audit_schema());
                let rows: Vec<PgWireResult<_>> = reports
                    .iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.account_id.to_string())?;
                        encoder.encode_field(&(r.entries as i64))?;
                        encoder.encode_field(&r.live_balance.to_string())?;
                        encoder.encode_field(&r.replayed_balance.to_string())?;
                        encoder.encode_field(&r.consistent)?;
                        encoder.encode_field(&r.fault)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectAccounts => {
                let overview = engine.accounts_overview().await;
                let schema = Arc::new(accounts_schema());
                let rows: Vec<PgWireResult<_>> = overview
                    .iter()
                    .map(|a| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&a.account_id.to_string())?;
                        encoder.encode_field(&a.balance.to_string())?;
                        encoder.encode_field(&(a.entries as i64))?;
                        encoder.encode_field(&(a.payments as i64))?;
                        encoder.encode_field(&a.opened_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectStatus => {
                let info = engine.status().await;
                let schema = Arc::new(status_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&(info.accounts as i64))?;
                encoder.encode_field(&(info.subscriptions as i64))?;
                encoder.encode_field(&(info.sessions as i64))?;
                encoder.encode_field(&(info.wal_appends_since_compact as i64))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::Listen { channel } => {
                let channel_id = channel_ulid(&channel)?;
                self.start_listen(engine, channel, channel_id);
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                channel_ulid(&channel)?;
                self.stop_listen(&channel);
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::UnlistenAll => {
                self.stop_all_listens();
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }
}

/// Forwarder tasks hold broadcast receivers; when the connection goes away
/// they must be torn down, or idle hub channels would accumulate parked
/// subscribers.
impl Drop for TallyHandler {
    fn drop(&mut self) {
        self.stop_all_listens();
    }
}

/// Channels look like `account_<ulid>`, `resource_<ulid>` or a bare ULID.
fn channel_ulid(channel: &str) -> PgWireResult<Ulid> {
    let raw = channel
        .strip_prefix("account_")
        .or_else(|| channel.strip_prefix("resource_"))
        .unwrap_or(channel);
    Ulid::from_string(raw).map_err(|e| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("bad ULID in channel {channel}: {e}"),
        )))
    })
}

fn actor_text(actor: &Actor) -> String {
    match actor {
        Actor::Account(id) => format!("account:{id}"),
        Actor::Admin(id) => format!("admin:{id}"),
        Actor::System => "system".to_string(),
    }
}

fn slot_rows(resource_id: Ulid, date: chrono::NaiveDate, slots: Vec<ReservedSlot>) -> PgWireResult<Response> {
    let schema = Arc::new(slots_schema());
    let rid = resource_id.to_string();
    let date_str = date.to_string();
    let rows: Vec<PgWireResult<_>> = slots
        .into_iter()
        .map(|slot| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&rid)?;
            encoder.encode_field(&date_str)?;
            encoder.encode_field(&minutes_to_hhmm(slot.range.start))?;
            encoder.encode_field(&minutes_to_hhmm(slot.range.end))?;
            encoder.encode_field(&slot.session_id.to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(
        schema,
        stream::iter(rows),
    )))
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn balance_schema() -> Vec<FieldInfo> {
    vec![text_field("account_id"), text_field("balance")]
}

fn ledger_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        int8_field("seq"),
        text_field("direction"),
        text_field("amount"),
        text_field("cause"),
        text_field("actor"),
        text_field("balance_before"),
        text_field("balance_after"),
        int8_field("created_at"),
    ]
}

fn payments_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("method"),
        text_field("amount"),
        text_field("external_reference"),
        text_field("status"),
        int8_field("created_at"),
    ]
}

fn subscriptions_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("plan"),
        text_field("status"),
        int8_field("remaining"),
        int8_field("ends_at"),
        int8_field("started_at"),
    ]
}

fn sessions_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("resource_id"),
        text_field("date"),
        text_field("start"),
        text_field("end"),
        text_field("status"),
        text_field("subscription_id"),
        int8_field("booked_at"),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        text_field("resource_id"),
        text_field("date"),
        text_field("start"),
        text_field("end"),
        text_field("session_id"),
    ]
}

fn audit_schema() -> Vec<FieldInfo> {
    vec![
        text_field("account_id"),
        int8_field("entries"),
        text_field("live_balance"),
        text_field("replayed_balance"),
        FieldInfo::new("consistent".into(), None, None, Type::BOOL, FieldFormat::Text),
        text_field("fault"),
    ]
}

fn accounts_schema() -> Vec<FieldInfo> {
    vec![
        text_field("account_id"),
        text_field("balance"),
        int8_field("entries"),
        int8_field("payments"),
        int8_field("opened_at"),
    ]
}

fn status_schema() -> Vec<FieldInfo> {
    vec![
        int8_field("accounts"),
        int8_field("subscriptions"),
        int8_field("sessions"),
        int8_field("wal_appends_since_compact"),
    ]
}

/// Result schema for a SELECT, sniffed from the raw SQL; empty for
/// statements that only return a command tag.
fn select_schema(sql_upper: &str) -> Vec<FieldInfo> {
    if !sql_upper.contains("SELECT") {
        return vec![];
    }
    if sql_upper.contains("BALANCE") {
        balance_schema()
    } else if sql_upper.contains("LEDGER") {
        ledger_schema()
    } else if sql_upper.contains("PAYMENTS") {
        payments_schema()
    } else if sql_upper.contains("SUBSCRIPTIONS") {
        subscriptions_schema()
    } else if sql_upper.contains("SESSIONS") {
        sessions_schema()
    } else if sql_upper.contains("SLOTS") || sql_upper.contains("CONFLICTS") {
        slots_schema()
    } else if sql_upper.contains("AUDIT") {
        audit_schema()
    } else if sql_upper.contains("ACCOUNTS") {
        accounts_schema()
    } else if sql_upper.contains("STATUS") {
        status_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for TallyHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.run_command(&engine, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct TallyQueryParser;

#[async_trait]
impl QueryParser for TallyQueryParser {
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
        Ok(select_schema(&stmt.to_uppercase()))
    }
}

#[async_trait]
impl ExtendedQueryHandler for TallyHandler {
    type Statement = String;
    type QueryParser = TallyQueryParser;

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
        let mut responses = self.run_command(&engine, cmd).await?;
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
            select_schema(&target.statement.to_uppercase()),
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
        Ok(DescribePortalResponse::new(select_schema(
            &target.statement.statement.to_uppercase(),
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
                    if n > max {
                        max = n;
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
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

pub struct TallyFactory {
    handler: Arc<TallyHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<TallyAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl TallyFactory {
    pub fn new(
        tenant_manager: Arc<TenantManager>,
        password: String,
        notif_tx: mpsc::UnboundedSender<(String, String)>,
    ) -> Self {
        let auth_source = TallyAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(TallyHandler::new(tenant_manager, notif_tx)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for TallyFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler<Statement = String>> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

const STARTUP_TIMEOUT_MS: u64 = 60_000;

/// Drive one client connection through the pgwire protocol state machine.
///
/// This is pgwire's stock socket loop with one extra select arm: events the
/// LISTEN forwarders queue for this connection go out as NotificationResponse
/// frames whenever the socket is idle, instead of waiting for the client's
/// next round trip.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> Result<(), std::io::Error> {
    let (notif_tx, mut notif_rx) = mpsc::unbounded_channel();
    let factory = TallyFactory::new(tenant_manager, password, notif_tx);

    let startup_timeout = sleep(Duration::from_millis(STARTUP_TIMEOUT_MS));
    tokio::pin!(startup_timeout);

    let socket = tokio::select! {
        _ = &mut startup_timeout => return Ok(()),
        socket = negotiate_tls::<String>(socket, tls) => socket?,
    };
    let Some(mut socket) = socket else {
        // Direct TLS negotiation without an acceptor configured.
        return Ok(());
    };

    let startup_handler = factory.startup_handler();
    let simple_query_handler = factory.simple_query_handler();
    let extended_query_handler = factory.extended_query_handler();
    let copy_handler = factory.copy_handler();
    let cancel_handler = factory.cancel_handler();
    let error_handler = factory.error_handler();

    loop {
        let msg = if matches!(
            socket.state(),
            PgWireConnectionState::AwaitingStartup
                | PgWireConnectionState::AuthenticationInProgress
        ) {
            tokio::select! {
                _ = &mut startup_timeout => None,
                msg = socket.next() => msg,
            }
        } else {
            tokio::select! {
                notif = notif_rx.recv() => {
                    let Some((channel, payload)) = notif else { break };
                    let pid = socket.pid_and_secret_key().0;
                    socket
                        .send(PgWireBackendMessage::NotificationResponse(
                            NotificationResponse::new(pid, channel, payload),
                        ))
                        .await?;
                    continue;
                }
                msg = socket.next() => msg,
            }
        };

        let Some(Ok(msg)) = msg else { break };
        let is_extended_query = match socket.state() {
            PgWireConnectionState::CopyInProgress(is_extended_query) => is_extended_query,
            _ => msg.is_extended_query(),
        };
        if let Err(mut e) = process_message(
            msg,
            &mut socket,
            startup_handler.clone(),
            simple_query_handler.clone(),
            extended_query_handler.clone(),
            copy_handler.clone(),
            cancel_handler.clone(),
        )
        .await
        {
            error_handler.on_error(&socket, &mut e);
            process_error(&mut socket, e, is_extended_query).await?;
        }
    }
    Ok(())
}

/// Engine failures surface with a SQLSTATE a Postgres client can act on;
/// retry-budget exhaustion maps to serialization_failure so clients know to
/// retry.
fn engine_err(e: EngineError) -> PgWireError {
    let code = match &e {
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) | EngineError::DuplicatePayment(_) => "23505",
        EngineError::SlotConflict(_) => "23P01",
        EngineError::InvalidAmount(_) | EngineError::InvalidSlot(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Forbidden(_) => "42501",
        EngineError::InsufficientFunds { .. }
        | EngineError::NoSessionsRemaining(_)
        | EngineError::SubscriptionExpired(_)
        | EngineError::InvalidStateTransition { .. } => "P0001",
        EngineError::WriteConflict
        | EngineError::LedgerUnavailable
        | EngineError::BookingUnavailable => "40001",
        EngineError::WalError(_) => "XX000",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
