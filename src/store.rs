//! Read-only feature store access.
//!
//! The worker reads user, event, and transaction records to build its
//! feature vector, and writes a zero-amount audit transaction after each
//! completed prediction. Everything else about the platform's CRUD layer
//! lives outside this crate; the [`FeatureStore`] trait is the seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;

/// Errors that can occur while querying the feature store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),
}

/// Platform role of a user account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    #[default]
    Member,
}

impl Role {
    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "admin" => Role::Admin,
            _ => Role::Member,
        }
    }
}

/// Lifecycle status of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    #[default]
    Draft,
    Active,
    Cancelled,
    Completed,
}

impl EventStatus {
    fn parse(raw: &str) -> Self {
        match raw {
            "active" => EventStatus::Active,
            "cancelled" => EventStatus::Cancelled,
            "completed" => EventStatus::Completed,
            _ => EventStatus::Draft,
        }
    }
}

/// A user account with a wallet balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub balance: f64,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

/// An event users can join by paying its cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub title: String,
    pub cost: f64,
    pub max_participants: Option<i64>,
    pub current_participants: i64,
    pub status: EventStatus,
    pub event_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One entry in a user's balance history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub user_id: i64,
    pub amount: f64,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Query contract the worker depends on.
///
/// Implementations must tolerate concurrent access from multiple worker
/// processes; no cross-worker coordination happens above this trait.
#[async_trait]
pub trait FeatureStore: Send + Sync {
    async fn get_user(&self, id: i64) -> Result<Option<User>, StoreError>;

    async fn get_event(&self, id: i64) -> Result<Option<Event>, StoreError>;

    /// Transaction history for a user, newest first.
    async fn user_transactions(&self, user_id: i64) -> Result<Vec<Transaction>, StoreError>;

    /// Records a zero-amount transaction as a lightweight audit trail
    /// entry. Callers treat failures as best-effort.
    async fn record_audit_entry(&self, user_id: i64, description: &str) -> Result<(), StoreError>;
}

/// PostgreSQL-backed feature store.
pub struct PgFeatureStore {
    pool: PgPool,
}

impl PgFeatureStore {
    /// Connects to the database and returns a new store.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Creates a store from an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl FeatureStore for PgFeatureStore {
    async fn get_user(&self, id: i64) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(
            "SELECT id, email, balance, role, created_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| User {
            id: row.get("id"),
            email: row.get("email"),
            balance: row.get("balance"),
            role: Role::parse(row.get::<String, _>("role").as_str()),
            created_at: row.get("created_at"),
        }))
    }

    async fn get_event(&self, id: i64) -> Result<Option<Event>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, title, cost, max_participants, current_participants,
                   status, event_date, created_at
            FROM events WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Event {
            id: row.get("id"),
            title: row.get("title"),
            cost: row.get("cost"),
            max_participants: row.get("max_participants"),
            current_participants: row.get("current_participants"),
            status: EventStatus::parse(row.get::<String, _>("status").as_str()),
            event_date: row.get("event_date"),
            created_at: row.get("created_at"),
        }))
    }

    async fn user_transactions(&self, user_id: i64) -> Result<Vec<Transaction>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, amount, description, created_at
            FROM transactions
            WHERE user_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Transaction {
                id: row.get("id"),
                user_id: row.get("user_id"),
                amount: row.get("amount"),
                description: row.get("description"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn record_audit_entry(&self, user_id: i64, description: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO transactions (user_id, amount, transaction_type, status, description, created_at)
            VALUES ($1, 0, 'deposit', 'completed', $2, NOW())
            "#,
        )
        .bind(user_id)
        .bind(description)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// In-memory feature store for tests and local runs without a database.
#[derive(Debug, Default)]
pub struct MemoryFeatureStore {
    inner: std::sync::Mutex<MemoryState>,
    fail_audit: std::sync::atomic::AtomicBool,
    fail_queries: std::sync::atomic::AtomicBool,
}

#[derive(Debug, Default)]
struct MemoryState {
    users: std::collections::HashMap<i64, User>,
    events: std::collections::HashMap<i64, Event>,
    transactions: Vec<Transaction>,
    next_transaction_id: i64,
}

impl MemoryFeatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, user: User) {
        self.inner.lock().expect("store lock").users.insert(user.id, user);
    }

    pub fn insert_event(&self, event: Event) {
        self.inner
            .lock()
            .expect("store lock")
            .events
            .insert(event.id, event);
    }

    pub fn insert_transaction(&self, user_id: i64, amount: f64) {
        let mut state = self.inner.lock().expect("store lock");
        state.next_transaction_id += 1;
        let id = state.next_transaction_id;
        state.transactions.push(Transaction {
            id,
            user_id,
            amount,
            description: None,
            created_at: Utc::now(),
        });
    }

    /// Makes subsequent audit writes fail, to exercise the best-effort
    /// path.
    pub fn set_audit_failure(&self, fail: bool) {
        self.fail_audit
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Makes subsequent read queries fail, to exercise the
    /// processing-error path.
    pub fn set_query_failure(&self, fail: bool) {
        self.fail_queries
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_queries(&self) -> Result<(), StoreError> {
        if self.fail_queries.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StoreError::ConnectionFailed(
                "store unavailable".to_string(),
            ));
        }
        Ok(())
    }

    /// Audit entries recorded for a user (zero-amount transactions with a
    /// description).
    pub fn audit_entries(&self, user_id: i64) -> Vec<Transaction> {
        self.inner
            .lock()
            .expect("store lock")
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id && t.amount == 0.0 && t.description.is_some())
            .cloned()
            .collect()
    }
}

#[async_trait]
impl FeatureStore for MemoryFeatureStore {
    async fn get_user(&self, id: i64) -> Result<Option<User>, StoreError> {
        self.check_queries()?;
        Ok(self.inner.lock().expect("store lock").users.get(&id).cloned())
    }

    async fn get_event(&self, id: i64) -> Result<Option<Event>, StoreError> {
        self.check_queries()?;
        Ok(self
            .inner
            .lock()
            .expect("store lock")
            .events
            .get(&id)
            .cloned())
    }

    async fn user_transactions(&self, user_id: i64) -> Result<Vec<Transaction>, StoreError> {
        self.check_queries()?;
        let mut transactions: Vec<Transaction> = self
            .inner
            .lock()
            .expect("store lock")
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        transactions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(transactions)
    }

    async fn record_audit_entry(&self, user_id: i64, description: &str) -> Result<(), StoreError> {
        if self.fail_audit.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StoreError::ConnectionFailed(
                "audit store unavailable".to_string(),
            ));
        }

        let mut state = self.inner.lock().expect("store lock");
        state.next_transaction_id += 1;
        let id = state.next_transaction_id;
        state.transactions.push(Transaction {
            id,
            user_id,
            amount: 0.0,
            description: Some(description.to_string()),
            created_at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: i64) -> User {
        User {
            id,
            email: format!("user{id}@example.com"),
            balance: 100.0,
            role: Role::Member,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_store_user_lookup() {
        let store = MemoryFeatureStore::new();
        store.insert_user(member(1));

        let found = store.get_user(1).await.expect("query");
        assert_eq!(found.map(|u| u.id), Some(1));
        assert!(store.get_user(2).await.expect("query").is_none());
    }

    #[tokio::test]
    async fn test_memory_store_transactions_newest_first() {
        let store = MemoryFeatureStore::new();
        store.insert_user(member(1));
        store.insert_transaction(1, 10.0);
        store.insert_transaction(1, 20.0);
        store.insert_transaction(2, 99.0);

        let transactions = store.user_transactions(1).await.expect("query");
        assert_eq!(transactions.len(), 2);
        assert!(transactions[0].created_at >= transactions[1].created_at);
    }

    #[tokio::test]
    async fn test_memory_store_audit_entry() {
        let store = MemoryFeatureStore::new();
        store.insert_user(member(1));

        store
            .record_audit_entry(1, "prediction logged")
            .await
            .expect("audit");

        let entries = store.audit_entries(1);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].amount, 0.0);
        assert_eq!(entries[0].description.as_deref(), Some("prediction logged"));
    }

    #[tokio::test]
    async fn test_memory_store_audit_failure_injection() {
        let store = MemoryFeatureStore::new();
        store.set_audit_failure(true);

        let result = store.record_audit_entry(1, "will fail").await;
        assert!(result.is_err());
        assert!(store.audit_entries(1).is_empty());
    }

    #[test]
    fn test_role_parse() {
        assert_eq!(Role::parse("admin"), Role::Admin);
        assert_eq!(Role::parse("member"), Role::Member);
        assert_eq!(Role::parse("anything"), Role::Member);
    }

    #[test]
    fn test_event_status_parse() {
        assert_eq!(EventStatus::parse("active"), EventStatus::Active);
        assert_eq!(EventStatus::parse("draft"), EventStatus::Draft);
        assert_eq!(EventStatus::parse("unknown"), EventStatus::Draft);
    }
}
