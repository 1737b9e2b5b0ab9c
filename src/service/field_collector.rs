use crate::models::flow::ActorId;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Values gathered so far by one guided flow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowFields {
    pub course_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub date: Option<NaiveDate>,
    pub starts_at: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i32>,
    pub instructor: Option<String>,
    pub location: Option<String>,
    pub comment: Option<String>,
    pub name: Option<String>,
}

/// One validated value to store in a flow context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Course(Uuid),
    Session(Uuid),
    Date(NaiveDate),
    StartsAt(DateTime<Utc>),
    Duration(i32),
    Instructor(Option<String>),
    Location(Option<String>),
    Comment(Option<String>),
    Name(String),
}

impl FlowFields {
    pub fn store(&mut self, value: FieldValue) {
        match value {
            FieldValue::Course(id) => self.course_id = Some(id),
            FieldValue::Session(id) => self.session_id = Some(id),
            FieldValue::Date(date) => self.date = Some(date),
            FieldValue::StartsAt(ts) => self.starts_at = Some(ts),
            FieldValue::Duration(minutes) => self.duration_minutes = Some(minutes),
            FieldValue::Instructor(text) => self.instructor = text,
            FieldValue::Location(text) => self.location = text,
            FieldValue::Comment(text) => self.comment = text,
            FieldValue::Name(name) => self.name = Some(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSnapshot<S> {
    pub state: S,
    pub fields: FlowFields,
}

struct FlowContext<S> {
    state: S,
    fields: FlowFields,
    touched_at: Instant,
}

/// Per-actor scratch space for in-flight guided flows. At most one context per
/// actor; nothing is persisted.
pub struct FieldCollector<S> {
    contexts: Mutex<HashMap<ActorId, FlowContext<S>>>,
}

impl<S> Default for FieldCollector<S> {
    fn default() -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
        }
    }
}

impl<S: Clone + Send + 'static> FieldCollector<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts an empty context in `state`, discarding any previous one for the actor.
    /// Returns true if a previous context was replaced.
    pub async fn begin(&self, actor: ActorId, state: S) -> bool {
        let context = FlowContext {
            state,
            fields: FlowFields::default(),
            touched_at: Instant::now(),
        };
        self.contexts.lock().await.insert(actor, context).is_some()
    }

    /// Stores one value. Returns false when the actor has no active context.
    pub async fn set(&self, actor: ActorId, value: FieldValue) -> bool {
        let mut contexts = self.contexts.lock().await;
        match contexts.get_mut(&actor) {
            Some(context) => {
                context.fields.store(value);
                context.touched_at = Instant::now();
                true
            }
            None => false,
        }
    }

    pub async fn move_to(&self, actor: ActorId, state: S) -> bool {
        let mut contexts = self.contexts.lock().await;
        match contexts.get_mut(&actor) {
            Some(context) => {
                context.state = state;
                context.touched_at = Instant::now();
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, actor: ActorId) -> Option<FlowSnapshot<S>> {
        self.contexts.lock().await.get(&actor).map(|context| FlowSnapshot {
            state: context.state.clone(),
            fields: context.fields.clone(),
        })
    }

    pub async fn end(&self, actor: ActorId) -> bool {
        self.contexts.lock().await.remove(&actor).is_some()
    }

    pub async fn active_count(&self) -> usize {
        self.contexts.lock().await.len()
    }

    /// Drops contexts idle for at least `ttl`. Returns how many were dropped.
    pub async fn purge_stale(&self, ttl: Duration) -> usize {
        let mut contexts = self.contexts.lock().await;
        let before = contexts.len();
        contexts.retain(|_, context| context.touched_at.elapsed() < ttl);
        before - contexts.len()
    }

    pub fn spawn_sweeper(self: Arc<Self>, ttl: Duration, sweep_interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval.max(Duration::from_secs(1)));
            loop {
                ticker.tick().await;
                let purged = self.purge_stale(ttl).await;
                if purged > 0 {
                    debug!(purged, "expired idle guided flows");
                }
            }
        });
    }
}
