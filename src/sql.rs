use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertAccount {
        id: Ulid,
    },
    InsertPayment {
        id: Ulid,
        account_id: Ulid,
        method: PaymentMethod,
        amount: Amount,
        external_reference: String,
        status: PaymentStatus,
    },
    InsertAdjustment {
        account_id: Ulid,
        direction: Direction,
        amount: Amount,
        admin_id: Ulid,
        note: Option<String>,
    },
    InsertSubscription {
        id: Ulid,
        account_id: Ulid,
        plan: Plan,
    },
    InsertBooking {
        id: Ulid,
        account_id: Ulid,
        resource_id: Ulid,
        date: NaiveDate,
        range: TimeRange,
        funding: Funding,
    },
    InsertReferralBonus {
        referrer: Ulid,
        referred: Ulid,
        amount: Amount,
    },
    UpdateSessionStatus {
        id: Ulid,
        status: SessionStatus,
    },
    UpdateSubscriptionStatus {
        id: Ulid,
        status: SubscriptionStatus,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBalance {
        account_id: Ulid,
    },
    SelectLedger {
        account_id: Ulid,
    },
    SelectPayments {
        account_id: Ulid,
    },
    SelectSubscriptions {
        account_id: Ulid,
    },
    SelectSessions {
        account_id: Ulid,
    },
    SelectSlots {
        resource_id: Ulid,
        date: NaiveDate,
    },
    SelectConflicts {
        resource_id: Ulid,
        date: NaiveDate,
        range: TimeRange,
    },
    SelectAudit {
        account_id: Option<Ulid>,
    },
    SelectAccounts,
    SelectStatus,
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
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }
    if upper.starts_with("UNLISTEN") {
        let rest = trimmed[8..].trim().trim_matches(';').trim();
        if rest == "*" || rest.is_empty() {
            return Ok(Command::UnlistenAll);
        }
        return Ok(Command::Unlisten {
            channel: rest.to_string(),
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

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "accounts" => {
            if values.is_empty() {
                return Err(SqlError::WrongArity("accounts", 1, 0));
            }
            Ok(Command::InsertAccount {
                id: parse_ulid(&values[0])?,
            })
        }
        "payments" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("payments", 5, values.len()));
            }
            let status = if values.len() >= 6 {
                parse_payment_status_expr(&values[5])?
            } else {
                PaymentStatus::Completed
            };
            Ok(Command::InsertPayment {
                id: parse_ulid(&values[0])?,
                account_id: parse_ulid(&values[1])?,
                method: parse_method_expr(&values[2])?,
                amount: parse_amount_expr(&values[3])?,
                external_reference: parse_string_raw(&values[4])?,
                status,
            })
        }
        "adjustments" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("adjustments", 4, values.len()));
            }
            let note = if values.len() >= 5 {
                parse_string_or_null(&values[4])?
            } else {
                None
            };
            Ok(Command::InsertAdjustment {
                account_id: parse_ulid(&values[0])?,
                direction: parse_direction_expr(&values[1])?,
                amount: parse_amount_expr(&values[2])?,
                admin_id: parse_ulid(&values[3])?,
                note,
            })
        }
        "subscriptions" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("subscriptions", 4, values.len()));
            }
            let plan = match parse_string_expr(&values[2])?.as_str() {
                "session_pack" => {
                    let total = parse_u32(&values[3])?;
                    Plan::SessionPack {
                        total,
                        remaining: total,
                    }
                }
                "annual" => Plan::Annual {
                    ends_at: parse_ends_at_expr(&values[3])?,
                },
                other => return Err(SqlError::Parse(format!("unknown plan: {other}"))),
            };
            Ok(Command::InsertSubscription {
                id: parse_ulid(&values[0])?,
                account_id: parse_ulid(&values[1])?,
                plan,
            })
        }
        "bookings" => {
            if values.len() < 7 {
                return Err(SqlError::WrongArity("bookings", 7, values.len()));
            }
            let subscription_id = parse_ulid_or_null(&values[6])?;
            let price = if values.len() >= 8 {
                parse_amount_or_null(&values[7])?
            } else {
                None
            };
            let funding = match (subscription_id, price) {
                (Some(sub), None) => Funding::Subscription(sub),
                (None, Some(p)) => Funding::Balance(p),
                (Some(_), Some(_)) => {
                    return Err(SqlError::Parse(
                        "subscription_id and price are mutually exclusive".into(),
                    ));
                }
                (None, None) => {
                    return Err(SqlError::Parse(
                        "booking needs subscription_id or price".into(),
                    ));
                }
            };
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                account_id: parse_ulid(&values[1])?,
                resource_id: parse_ulid(&values[2])?,
                date: parse_date_expr(&values[3])?,
                range: TimeRange {
                    start: parse_minutes_expr(&values[4])?,
                    end: parse_minutes_expr(&values[5])?,
                },
                funding,
            })
        }
        "referral_bonuses" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("referral_bonuses", 3, values.len()));
            }
            Ok(Command::InsertReferralBonus {
                referrer: parse_ulid(&values[0])?,
                referred: parse_ulid(&values[1])?,
                amount: parse_amount_expr(&values[2])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table_name = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;
    let assignment = match assignments {
        [one] => one,
        _ => return Err(SqlError::Parse("expected exactly one SET clause".into())),
    };
    let col = match &assignment.target {
        ast::AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
        }
        _ => return Err(SqlError::Parse("unsupported assignment target".into())),
    };
    if col != "status" {
        return Err(SqlError::Parse(format!("only status is updatable, got {col}")));
    }
    let target = parse_string_expr(&assignment.value)?;
    match table_name.as_str() {
        "sessions" => Ok(Command::UpdateSessionStatus {
            id,
            status: session_status_from(&target)?,
        }),
        "subscriptions" => Ok(Command::UpdateSubscriptionStatus {
            id,
            status: subscription_status_from(&target)?,
        }),
        _ => Err(SqlError::UnknownTable(table_name)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
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

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "balance" => Ok(Command::SelectBalance {
            account_id: filters.require_account()?,
        }),
        "ledger" => Ok(Command::SelectLedger {
            account_id: filters.require_account()?,
        }),
        "payments" => Ok(Command::SelectPayments {
            account_id: filters.require_account()?,
        }),
        "subscriptions" => Ok(Command::SelectSubscriptions {
            account_id: filters.require_account()?,
        }),
        "sessions" => Ok(Command::SelectSessions {
            account_id: filters.require_account()?,
        }),
        "slots" => Ok(Command::SelectSlots {
            resource_id: filters
                .resource_id
                .ok_or(SqlError::MissingFilter("resource_id"))?,
            date: filters.date.ok_or(SqlError::MissingFilter("date"))?,
        }),
        "conflicts" => Ok(Command::SelectConflicts {
            resource_id: filters
                .resource_id
                .ok_or(SqlError::MissingFilter("resource_id"))?,
            date: filters.date.ok_or(SqlError::MissingFilter("date"))?,
            range: TimeRange {
                start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
                end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
            },
        }),
        "audit" => Ok(Command::SelectAudit {
            account_id: filters.account_id,
        }),
        "accounts" => Ok(Command::SelectAccounts),
        "status" => Ok(Command::SelectStatus),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct Filters {
    account_id: Option<Ulid>,
    resource_id: Option<Ulid>,
    date: Option<NaiveDate>,
    start: Option<Minutes>,
    end: Option<Minutes>,
}

impl Filters {
    fn require_account(&self) -> Result<Ulid, SqlError> {
        self.account_id.ok_or(SqlError::MissingFilter("account_id"))
    }
}

fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_filters(left, filters)?;
                extract_filters(right, filters)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("account_id") => filters.account_id = Some(parse_ulid_expr(right)?),
                Some("resource_id") => filters.resource_id = Some(parse_ulid_expr(right)?),
                Some("date") => filters.date = Some(parse_date_expr(right)?),
                Some("start") => filters.start = Some(parse_minutes_expr(right)?),
                Some("end") => filters.end = Some(parse_minutes_expr(right)?),
                _ => {}
            },
            _ => {}
        }
    }
    Ok(())
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            if values.rows.len() > 1 {
                return Err(SqlError::Parse("multi-row INSERT not supported".into()));
            }
            Ok(values.rows[0].clone())
        }
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_expr(expr)
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(Some(
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))?,
            )),
            _ => Err(SqlError::Parse(format!(
                "expected string or NULL, got {value:?}"
            ))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

/// Money values: `25.00`, `'25.00'` or `'25'` — decimal currency units,
/// at most two fractional digits.
fn parse_amount_expr(expr: &Expr) -> Result<Amount, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => {
                Amount::parse(s).ok_or_else(|| SqlError::Parse(format!("bad amount: {s}")))
            }
            _ => Err(SqlError::Parse(format!("expected amount, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_amount_or_null(expr: &Expr) -> Result<Option<Amount>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    Ok(Some(parse_amount_expr(expr)?))
}

/// Time of day: `'10:30'` or bare minutes since midnight.
fn parse_minutes_expr(expr: &Expr) -> Result<Minutes, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad minutes: {e}"))),
            Value::SingleQuotedString(s) => {
                if s.contains(':') {
                    hhmm_to_minutes(s)
                        .ok_or_else(|| SqlError::Parse(format!("bad time of day: {s}")))
                } else {
                    s.parse()
                        .map_err(|e| SqlError::Parse(format!("bad minutes: {e}")))
                }
            }
            _ => Err(SqlError::Parse(format!("expected time, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string_raw(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date: {e}")))
}

/// Annual validity end: epoch milliseconds, or `'YYYY-MM-DD'` meaning valid
/// through the whole of that date (UTC).
fn parse_ends_at_expr(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return match date.succ_opt() {
                Some(next) => Ok(next.and_time(NaiveTime::MIN).and_utc().timestamp_millis() - 1),
                None => Err(SqlError::Parse("date out of range".into())),
            };
        }
    parse_i64_expr(expr)
}

/// Quoted string, preserved as-is.
fn parse_string_raw(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

/// Quoted keyword, lowercased for matching.
fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    Ok(parse_string_raw(expr)?.to_lowercase())
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    Ok(Some(parse_string_raw(expr)?))
}

fn parse_method_expr(expr: &Expr) -> Result<PaymentMethod, SqlError> {
    match parse_string_expr(expr)?.as_str() {
        "card" => Ok(PaymentMethod::Card),
        "paypal" => Ok(PaymentMethod::Paypal),
        "internal" => Ok(PaymentMethod::Internal),
        other => Err(SqlError::Parse(format!("unknown payment method: {other}"))),
    }
}

fn parse_payment_status_expr(expr: &Expr) -> Result<PaymentStatus, SqlError> {
    match parse_string_expr(expr)?.as_str() {
        "pending" => Ok(PaymentStatus::Pending),
        "completed" => Ok(PaymentStatus::Completed),
        "failed" => Ok(PaymentStatus::Failed),
        other => Err(SqlError::Parse(format!("unknown payment status: {other}"))),
    }
}

fn parse_direction_expr(expr: &Expr) -> Result<Direction, SqlError> {
    match parse_string_expr(expr)?.as_str() {
        "credit" => Ok(Direction::Credit),
        "debit" => Ok(Direction::Debit),
        other => Err(SqlError::Parse(format!("unknown direction: {other}"))),
    }
}

fn session_status_from(s: &str) -> Result<SessionStatus, SqlError> {
    match s {
        "scheduled" => Ok(SessionStatus::Scheduled),
        "attended" => Ok(SessionStatus::Attended),
        "missed" => Ok(SessionStatus::Missed),
        "cancelled" => Ok(SessionStatus::Cancelled),
        other => Err(SqlError::Parse(format!("unknown session status: {other}"))),
    }
}

fn subscription_status_from(s: &str) -> Result<SubscriptionStatus, SqlError> {
    match s {
        "active" => Ok(SubscriptionStatus::Active),
        "expired" => Ok(SubscriptionStatus::Expired),
        "cancelled" => Ok(SubscriptionStatus::Cancelled),
        other => Err(SqlError::Parse(format!(
            "unknown subscription status: {other}"
        ))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
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
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
