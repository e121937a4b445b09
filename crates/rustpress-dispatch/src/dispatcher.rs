//! The dispatcher: executes a handler DAG for one message with bounded
//! concurrency, per-handler retry, dependency gating, and a failure
//! policy evaluation at the end.

use crate::metrics::Metrics;
use crate::router::{EventRouter, HandlerContext, HandlerSpec};
use crate::state_store::{OverallStatus, StateStore};
use async_trait::async_trait;
use rustpress_core::config::FailurePolicy;
use rustpress_core::error::{Error, Result};
use rustpress_events::event::Event;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Duration};

/// Lets the dispatcher ask the transport to hide a message from other
/// consumers a little longer while a handler retries.
#[async_trait]
pub trait VisibilityExtender: Send + Sync {
    async fn extend_visibility(&self, ack_handle: &str, seconds: u64) -> Result<()>;
}

enum HandlerOutcome {
    Success(serde_json::Value, u32),
    Failed(Error),
}

/// Dispatcher configuration, distinct from [`rustpress_core::config::DispatcherConfig`]
/// only in that defaults here are resolved once at construction.
pub struct Dispatcher {
    router: Arc<EventRouter>,
    state_store: Arc<dyn StateStore>,
    concurrency_limit: usize,
    metrics: Metrics,
}

impl Dispatcher {
    pub fn new(router: Arc<EventRouter>, state_store: Arc<dyn StateStore>, concurrency_limit: usize) -> Self {
        Self::with_metrics(router, state_store, concurrency_limit, Metrics::default())
    }

    pub fn with_metrics(
        router: Arc<EventRouter>,
        state_store: Arc<dyn StateStore>,
        concurrency_limit: usize,
        metrics: Metrics,
    ) -> Self {
        Self {
            router,
            state_store,
            concurrency_limit,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Execute the handler graph registered for `event.event_type`
    /// against `event`. Returns `true` iff the transport should ack this
    /// message.
    pub async fn dispatch(&self, event: Event, transport: Option<Arc<dyn VisibilityExtender>>) -> bool {
        let message_id = event.message_id.clone();
        let handlers = self.router.handlers_for(&event.event_type);

        if handlers.is_empty() {
            tracing::debug!(event_type = %event.event_type, "no handlers registered, treating as handled");
            return true;
        }

        self.metrics.record_dispatch(event.event_type.as_str());

        let names: Vec<String> = handlers.keys().cloned().collect();
        if let Err(e) = self.state_store.init_message(&message_id, &names).await {
            tracing::warn!(message_id = %message_id, error = %e, "state store init_message failed");
        }

        let mut dependents_map: HashMap<String, Vec<String>> =
            names.iter().map(|n| (n.clone(), Vec::new())).collect();
        for (name, spec) in &handlers {
            for dep in &spec.depends_on {
                dependents_map.entry(dep.clone()).or_default().push(name.clone());
            }
        }

        let mut ready: VecDeque<String> = names
            .iter()
            .filter(|n| handlers[*n].depends_on.is_empty())
            .cloned()
            .collect();

        let mut running: HashSet<String> = HashSet::new();
        let mut completed: HashSet<String> = HashSet::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut skipped: HashSet<String> = HashSet::new();
        let mut results: HashMap<String, serde_json::Value> = HashMap::new();
        let mut abort_failed = false;
        let mut internal_error = false;

        let semaphore = Arc::new(Semaphore::new(self.concurrency_limit.max(1)));
        let mut join_set: JoinSet<(String, HandlerOutcome)> = JoinSet::new();

        while !ready.is_empty() || !running.is_empty() {
            while let Some(name) = ready.pop_front() {
                if completed.contains(&name) || failed.contains(&name) || skipped.contains(&name) {
                    continue;
                }
                running.insert(name.clone());

                let spec = handlers[&name].clone();
                let semaphore = semaphore.clone();
                let state_store = self.state_store.clone();
                let transport = transport.clone();
                let event = event.clone();
                let message_id = message_id.clone();
                let deps_results = results.clone();
                let metrics = self.metrics.clone();

                join_set.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                    let outcome = run_handler_with_retries(
                        spec.clone(),
                        event,
                        deps_results,
                        message_id.clone(),
                        transport,
                        metrics,
                    )
                    .await;

                    match &outcome {
                        HandlerOutcome::Success(value, attempts) => {
                            if let Err(e) = state_store
                                .save_handler_result(&message_id, &spec.name, value.clone(), *attempts)
                                .await
                            {
                                tracing::warn!(message_id = %message_id, handler = %spec.name, error = %e, "state store save_handler_result failed");
                            }
                        }
                        HandlerOutcome::Failed(err) => {
                            if let Err(e) = state_store
                                .mark_handler_failed(&message_id, &spec.name, &err.to_string())
                                .await
                            {
                                tracing::warn!(message_id = %message_id, handler = %spec.name, error = %e, "state store mark_handler_failed failed");
                            }
                        }
                    }

                    (spec.name.clone(), outcome)
                });
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };

            let (name, outcome) = match joined {
                Ok(pair) => pair,
                Err(join_err) => {
                    tracing::error!(message_id = %message_id, error = %join_err, "dispatcher task panicked");
                    internal_error = true;
                    continue;
                }
            };

            running.remove(&name);
            let policy = handlers[&name].failure_policy;

            match outcome {
                HandlerOutcome::Success(value, _attempts) => {
                    completed.insert(name.clone());
                    results.insert(name.clone(), value);
                }
                HandlerOutcome::Failed(_) => {
                    failed.insert(name.clone());
                    if policy == FailurePolicy::Abort {
                        abort_failed = true;
                        skip_transitive_dependents(&name, &dependents_map, &completed, &failed, &mut skipped);
                    }
                }
            }

            schedule_ready_dependents(
                &name,
                &dependents_map,
                &handlers,
                &completed,
                &failed,
                &skipped,
                &running,
                &mut ready,
            );
        }

        for name in &skipped {
            tracing::debug!(message_id = %message_id, handler = %name, "handler skipped, ancestor aborted");
        }

        let overall_status = if internal_error {
            OverallStatus::Error
        } else if abort_failed {
            OverallStatus::Failed
        } else {
            OverallStatus::Completed
        };

        if let Err(e) = self.state_store.set_overall_status(&message_id, overall_status).await {
            tracing::warn!(message_id = %message_id, error = %e, "state store set_overall_status failed");
        }

        !internal_error && !abort_failed
    }
}

fn skip_transitive_dependents(
    start: &str,
    dependents_map: &HashMap<String, Vec<String>>,
    completed: &HashSet<String>,
    failed: &HashSet<String>,
    skipped: &mut HashSet<String>,
) {
    let mut stack: Vec<&str> = dependents_map
        .get(start)
        .map(|v| v.iter().map(|s| s.as_str()).collect())
        .unwrap_or_default();

    while let Some(node) = stack.pop() {
        if completed.contains(node) || failed.contains(node) || skipped.contains(node) {
            continue;
        }
        skipped.insert(node.to_string());
        if let Some(next) = dependents_map.get(node) {
            stack.extend(next.iter().map(|s| s.as_str()));
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn schedule_ready_dependents(
    finished: &str,
    dependents_map: &HashMap<String, Vec<String>>,
    handlers: &HashMap<String, Arc<HandlerSpec>>,
    completed: &HashSet<String>,
    failed: &HashSet<String>,
    skipped: &HashSet<String>,
    running: &HashSet<String>,
    ready: &mut VecDeque<String>,
) {
    let Some(candidates) = dependents_map.get(finished) else {
        return;
    };

    for candidate in candidates {
        if completed.contains(candidate)
            || failed.contains(candidate)
            || skipped.contains(candidate)
            || running.contains(candidate)
            || ready.contains(candidate)
        {
            continue;
        }

        let Some(spec) = handlers.get(candidate) else {
            continue;
        };

        let all_satisfied = spec.depends_on.iter().all(|dep| {
            completed.contains(dep)
                || (failed.contains(dep) && handlers.get(dep).map(|s| s.failure_policy) != Some(FailurePolicy::Abort))
        });

        if all_satisfied {
            ready.push_back(candidate.clone());
        }
    }
}

async fn run_handler_with_retries(
    spec: Arc<HandlerSpec>,
    event: Event,
    deps_results: HashMap<String, serde_json::Value>,
    message_id: String,
    transport: Option<Arc<dyn VisibilityExtender>>,
    metrics: Metrics,
) -> HandlerOutcome {
    let max_attempts = spec.retry_policy.max_attempts().max(1);
    let event_type = event.event_type.as_str();

    for attempt in 1..=max_attempts {
        let mut injected = HashMap::new();
        for (key, resolver) in &spec.dependencies {
            injected.insert(key.clone(), resolver().await);
        }

        let ctx = HandlerContext {
            event: event.clone(),
            deps_results: deps_results.clone(),
            attempt,
            message_id: message_id.clone(),
            metadata: spec.metadata.clone(),
            injected,
        };

        metrics.record_handler_attempt(event_type, &spec.name);
        let started = Instant::now();
        let fut = (spec.handler)(ctx);
        let outcome = timeout(Duration::from_secs(spec.timeout_seconds.max(1)), fut).await;
        metrics.observe_handler_duration(event_type, &spec.name, started.elapsed().as_secs_f64());

        let err = match outcome {
            Ok(Ok(value)) => return HandlerOutcome::Success(value, attempt),
            Ok(Err(e)) => e,
            Err(_) => Error::HandlerTimeout {
                handler: spec.name.clone(),
                timeout_secs: spec.timeout_seconds,
            },
        };

        if attempt < max_attempts && spec.retry_policy.should_retry(attempt, &err) {
            metrics.record_handler_retry(event_type, &spec.name);
            if let (Some(transport), Some(ack_handle)) = (&transport, event.metadata.get("ack_handle").and_then(|v| v.as_str())) {
                if let Err(e) = transport
                    .extend_visibility(ack_handle, spec.visibility_extension_secs)
                    .await
                {
                    tracing::warn!(handler = %spec.name, error = %e, "failed to extend visibility, continuing retry anyway");
                }
            }
            sleep(Duration::from_secs_f64(spec.backoff.next_delay(attempt))).await;
            continue;
        }

        return HandlerOutcome::Failed(err);
    }

    HandlerOutcome::Failed(Error::RetryExhausted {
        handler: spec.name.clone(),
        attempts: max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{ExponentialRetry, NoRetry};
    use crate::router::HandlerOptions;
    use crate::state_store::InMemoryStateStore;
    use rustpress_events::event::{EventType, Message};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn event_for(message_id: &str, event_type: &str) -> Event {
        let msg = Message::new(
            message_id,
            serde_json::json!({"type": event_type, "data": {}}),
            "test",
        );
        msg.into_event().unwrap()
    }

    fn dispatcher_with(router: EventRouter, concurrency: usize) -> (Dispatcher, Arc<InMemoryStateStore>) {
        let store = Arc::new(InMemoryStateStore::new());
        let dispatcher = Dispatcher::new(Arc::new(router), store.clone(), concurrency);
        (dispatcher, store)
    }

    #[tokio::test]
    async fn test_s1_linear_dag_happy_path() {
        let router = EventRouter::new();
        router
            .route(
                "checkout.complete",
                |_ctx| async { Ok(serde_json::json!({"step": "validate"})) },
                HandlerOptions {
                    name: Some("validate".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        router
            .route(
                "checkout.complete",
                |_ctx| async { Ok(serde_json::json!({"step": "charge"})) },
                HandlerOptions {
                    name: Some("charge".into()),
                    depends_on: vec!["validate".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        router
            .route(
                "checkout.complete",
                |_ctx| async { Ok(serde_json::json!({"step": "notify"})) },
                HandlerOptions {
                    name: Some("notify".into()),
                    depends_on: vec!["charge".into()],
                    ..Default::default()
                },
            )
            .unwrap();

        let (dispatcher, store) = dispatcher_with(router, 4);
        let event = event_for("m1", "checkout.complete");
        let ok = dispatcher.dispatch(event, None).await;
        assert!(ok);

        let state = store.load_message_state("m1").await.unwrap().unwrap();
        assert_eq!(state.results.len(), 3);
        assert_eq!(state.overall_status, crate::state_store::OverallStatus::Completed);
    }

    #[tokio::test]
    async fn test_s2_abort_propagation() {
        let router = EventRouter::new();
        router
            .route(
                "checkout.complete",
                |_ctx| async { Err(Error::handler_failed("validate", "bad input")) },
                HandlerOptions {
                    name: Some("validate".into()),
                    retry_policy: Some(Arc::new(NoRetry)),
                    ..Default::default()
                },
            )
            .unwrap();
        router
            .route(
                "checkout.complete",
                |_ctx| async { Ok(serde_json::json!({"step": "charge"})) },
                HandlerOptions {
                    name: Some("charge".into()),
                    depends_on: vec!["validate".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        router
            .route(
                "checkout.complete",
                |_ctx| async { Ok(serde_json::json!({"step": "notify"})) },
                HandlerOptions {
                    name: Some("notify".into()),
                    depends_on: vec!["charge".into()],
                    ..Default::default()
                },
            )
            .unwrap();

        let (dispatcher, store) = dispatcher_with(router, 4);
        let event = event_for("m2", "checkout.complete");
        let ok = dispatcher.dispatch(event, None).await;
        assert!(!ok);

        let state = store.load_message_state("m2").await.unwrap().unwrap();
        assert_eq!(
            state.handler_states["validate"].status,
            crate::state_store::HandlerStatus::Failed
        );
        assert!(!state.results.contains_key("charge"));
        assert!(!state.results.contains_key("notify"));
    }

    #[tokio::test]
    async fn test_s3_retry_then_succeed() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let router = EventRouter::new();
        router
            .route(
                "checkout.complete",
                move |_ctx| {
                    let attempts = attempts_clone.clone();
                    async move {
                        let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                        if n < 2 {
                            Err(Error::transport("transient"))
                        } else {
                            Ok(serde_json::json!({"ok": true}))
                        }
                    }
                },
                HandlerOptions {
                    name: Some("charge".into()),
                    retry_policy: Some(Arc::new(ExponentialRetry::new(3))),
                    backoff: Some(Arc::new(crate::backoff::FixedBackoff { delay_secs: 0.0 })),
                    ..Default::default()
                },
            )
            .unwrap();

        let (dispatcher, store) = dispatcher_with(router, 4);
        let event = event_for("m3", "checkout.complete");
        let ok = dispatcher.dispatch(event, None).await;
        assert!(ok);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        let state = store.load_message_state("m3").await.unwrap().unwrap();
        assert_eq!(state.handler_states["charge"].status, crate::state_store::HandlerStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_s5_concurrency_cap() {
        let current = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let router = EventRouter::new();
        for i in 0..20 {
            let current = current.clone();
            let max_seen = max_seen.clone();
            router
                .route(
                    "fanout.event",
                    move |_ctx| {
                        let current = current.clone();
                        let max_seen = max_seen.clone();
                        async move {
                            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            current.fetch_sub(1, Ordering::SeqCst);
                            Ok(serde_json::json!(i))
                        }
                    },
                    HandlerOptions {
                        name: Some(format!("h{i}")),
                        ..Default::default()
                    },
                )
                .unwrap();
        }

        let (dispatcher, store) = dispatcher_with(router, 4);
        let event = event_for("m5", "fanout.event");
        let ok = dispatcher.dispatch(event, None).await;
        assert!(ok);
        assert!(max_seen.load(Ordering::SeqCst) <= 4);

        let state = store.load_message_state("m5").await.unwrap().unwrap();
        assert_eq!(state.results.len(), 20);
    }

    #[tokio::test]
    async fn test_dispatch_records_metrics() {
        let router = EventRouter::new();
        router
            .route(
                "checkout.complete",
                |_ctx| async { Ok(serde_json::json!({"ok": true})) },
                HandlerOptions {
                    name: Some("validate".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        let store = Arc::new(InMemoryStateStore::new());
        let metrics = Metrics::new();
        let dispatcher = Dispatcher::with_metrics(Arc::new(router), store, 4, metrics.clone());
        let event = event_for("m7", "checkout.complete");
        assert!(dispatcher.dispatch(event, None).await);

        let mut registry = prometheus_client::registry::Registry::default();
        metrics.register(&mut registry);
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &registry).unwrap();
        assert!(buf.contains("dispatched_total"));
        assert!(buf.contains("handler_attempts_total"));
    }

    #[tokio::test]
    async fn test_no_handlers_is_a_noop_success() {
        let router = EventRouter::new();
        let (dispatcher, store) = dispatcher_with(router, 4);
        let event = event_for("m6", "nothing.registered");
        let ok = dispatcher.dispatch(event, None).await;
        assert!(ok);
        assert!(store.load_message_state("m6").await.unwrap().is_none());
    }
}
