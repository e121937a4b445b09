//! State store: persists per-message handler-state transitions.
//!
//! Two reference implementations: an in-memory, process-local store and
//! a Redis-backed remote store keyed `message:{id}`.

use async_trait::async_trait;
use dashmap::DashMap;
use rustpress_core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerState {
    pub status: HandlerStatus,
    pub attempts: u32,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
}

impl HandlerState {
    pub fn pending() -> Self {
        Self {
            status: HandlerStatus::Pending,
            attempts: 0,
            result: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Processing,
    Completed,
    Failed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageState {
    pub message_id: String,
    pub handler_states: HashMap<String, HandlerState>,
    pub results: HashMap<String, serde_json::Value>,
    pub overall_status: OverallStatus,
}

impl MessageState {
    pub fn new(message_id: impl Into<String>, handler_names: &[String]) -> Self {
        Self {
            message_id: message_id.into(),
            handler_states: handler_names
                .iter()
                .map(|n| (n.clone(), HandlerState::pending()))
                .collect(),
            results: HashMap::new(),
            overall_status: OverallStatus::Processing,
        }
    }
}

/// Persists per-message handler state. Errors from the store are
/// expected to be logged by callers, not treated as fatal to dispatch.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn init_message(&self, message_id: &str, handler_names: &[String]) -> Result<()>;

    async fn save_handler_result(
        &self,
        message_id: &str,
        name: &str,
        result: serde_json::Value,
        attempts: u32,
    ) -> Result<()>;

    async fn mark_handler_failed(&self, message_id: &str, name: &str, error: &str) -> Result<()>;

    async fn set_overall_status(&self, message_id: &str, status: OverallStatus) -> Result<()>;

    async fn load_message_state(&self, message_id: &str) -> Result<Option<MessageState>>;

    async fn close(&self) -> Result<()>;
}

/// Process-local, non-durable store. Each instance owns its own map —
/// unlike a process-wide shared dict, two instances never see each
/// other's state, which keeps tests (and multiple dispatchers in one
/// process) from leaking state between runs.
#[derive(Default)]
pub struct InMemoryStateStore {
    states: DashMap<String, MessageState>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
        }
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn init_message(&self, message_id: &str, handler_names: &[String]) -> Result<()> {
        self.states
            .entry(message_id.to_string())
            .or_insert_with(|| MessageState::new(message_id, handler_names));
        Ok(())
    }

    async fn save_handler_result(
        &self,
        message_id: &str,
        name: &str,
        result: serde_json::Value,
        attempts: u32,
    ) -> Result<()> {
        let mut state = self
            .states
            .get_mut(message_id)
            .ok_or_else(|| Error::state_store(format!("no state for message {message_id}")))?;
        state.handler_states.insert(
            name.to_string(),
            HandlerState {
                status: HandlerStatus::Succeeded,
                attempts,
                result: Some(result.clone()),
                last_error: None,
            },
        );
        state.results.insert(name.to_string(), result);
        Ok(())
    }

    async fn mark_handler_failed(&self, message_id: &str, name: &str, error: &str) -> Result<()> {
        let mut state = self
            .states
            .get_mut(message_id)
            .ok_or_else(|| Error::state_store(format!("no state for message {message_id}")))?;
        let entry = state
            .handler_states
            .entry(name.to_string())
            .or_insert_with(HandlerState::pending);
        entry.status = HandlerStatus::Failed;
        entry.last_error = Some(error.to_string());
        Ok(())
    }

    async fn set_overall_status(&self, message_id: &str, status: OverallStatus) -> Result<()> {
        if let Some(mut state) = self.states.get_mut(message_id) {
            state.overall_status = status;
        }
        Ok(())
    }

    async fn load_message_state(&self, message_id: &str) -> Result<Option<MessageState>> {
        Ok(self.states.get(message_id).map(|s| s.clone()))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Redis-backed remote store. State for each message lives in a single
/// hash key `message:{id}` with fields `handler_states`, `results`, and
/// `overall_status`, each JSON-serialized.
pub struct RedisStateStore {
    pool: deadpool_redis::Pool,
    ttl_seconds: u64,
}

impl RedisStateStore {
    pub fn new(pool: deadpool_redis::Pool, ttl_seconds: u64) -> Self {
        Self { pool, ttl_seconds }
    }

    fn key(message_id: &str) -> String {
        format!("message:{message_id}")
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::state_store_with_source("failed to acquire redis connection", e))
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn init_message(&self, message_id: &str, handler_names: &[String]) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let key = Self::key(message_id);

        let exists: bool = conn
            .exists(&key)
            .await
            .map_err(|e| Error::state_store_with_source("redis EXISTS failed", e))?;
        if exists {
            return Ok(());
        }

        let state = MessageState::new(message_id, handler_names);
        let handler_states_json = serde_json::to_string(&state.handler_states)
            .map_err(|e| Error::state_store(format!("serialize handler_states: {e}")))?;
        let results_json = serde_json::to_string(&state.results)
            .map_err(|e| Error::state_store(format!("serialize results: {e}")))?;

        let _: () = conn
            .hset_multiple(
                &key,
                &[
                    ("handler_states", handler_states_json),
                    ("results", results_json),
                    ("overall_status", "processing".to_string()),
                ],
            )
            .await
            .map_err(|e| Error::state_store_with_source("redis HSET failed", e))?;
        let _: () = conn
            .expire(&key, self.ttl_seconds as i64)
            .await
            .map_err(|e| Error::state_store_with_source("redis EXPIRE failed", e))?;
        Ok(())
    }

    async fn save_handler_result(
        &self,
        message_id: &str,
        name: &str,
        result: serde_json::Value,
        attempts: u32,
    ) -> Result<()> {
        let mut state = self
            .load_message_state(message_id)
            .await?
            .ok_or_else(|| Error::state_store(format!("no state for message {message_id}")))?;

        state.handler_states.insert(
            name.to_string(),
            HandlerState {
                status: HandlerStatus::Succeeded,
                attempts,
                result: Some(result.clone()),
                last_error: None,
            },
        );
        state.results.insert(name.to_string(), result);

        self.write_back(&state).await
    }

    async fn mark_handler_failed(&self, message_id: &str, name: &str, error: &str) -> Result<()> {
        let mut state = self
            .load_message_state(message_id)
            .await?
            .ok_or_else(|| Error::state_store(format!("no state for message {message_id}")))?;

        let entry = state
            .handler_states
            .entry(name.to_string())
            .or_insert_with(HandlerState::pending);
        entry.status = HandlerStatus::Failed;
        entry.last_error = Some(error.to_string());

        self.write_back(&state).await
    }

    async fn set_overall_status(&self, message_id: &str, status: OverallStatus) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let value = serde_json::to_string(&status)
            .map_err(|e| Error::state_store(format!("serialize overall_status: {e}")))?;
        let _: () = conn
            .hset(Self::key(message_id), "overall_status", value)
            .await
            .map_err(|e| Error::state_store_with_source("redis HSET failed", e))?;
        Ok(())
    }

    async fn load_message_state(&self, message_id: &str) -> Result<Option<MessageState>> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let key = Self::key(message_id);

        let handler_states_json: Option<String> = conn
            .hget(&key, "handler_states")
            .await
            .map_err(|e| Error::state_store_with_source("redis HGET failed", e))?;
        let Some(handler_states_json) = handler_states_json else {
            return Ok(None);
        };
        let results_json: String = conn
            .hget(&key, "results")
            .await
            .map_err(|e| Error::state_store_with_source("redis HGET failed", e))?;
        let overall_status_json: String = conn
            .hget(&key, "overall_status")
            .await
            .map_err(|e| Error::state_store_with_source("redis HGET failed", e))?;

        let handler_states: HashMap<String, HandlerState> = serde_json::from_str(&handler_states_json)
            .map_err(|e| Error::state_store(format!("deserialize handler_states: {e}")))?;
        let results: HashMap<String, serde_json::Value> = serde_json::from_str(&results_json)
            .map_err(|e| Error::state_store(format!("deserialize results: {e}")))?;
        let overall_status: OverallStatus = serde_json::from_str(&format!("\"{overall_status_json}\""))
            .map_err(|e| Error::state_store(format!("deserialize overall_status: {e}")))?;

        Ok(Some(MessageState {
            message_id: message_id.to_string(),
            handler_states,
            results,
            overall_status,
        }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

impl RedisStateStore {
    async fn write_back(&self, state: &MessageState) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let key = Self::key(&state.message_id);

        let handler_states_json = serde_json::to_string(&state.handler_states)
            .map_err(|e| Error::state_store(format!("serialize handler_states: {e}")))?;
        let results_json = serde_json::to_string(&state.results)
            .map_err(|e| Error::state_store(format!("serialize results: {e}")))?;

        let _: () = conn
            .hset_multiple(
                &key,
                &[
                    ("handler_states", handler_states_json),
                    ("results", results_json),
                ],
            )
            .await
            .map_err(|e| Error::state_store_with_source("redis HSET failed", e))?;
        Ok(())
    }
}

pub fn in_memory() -> Arc<dyn StateStore> {
    Arc::new(InMemoryStateStore::new())
}
