//! Upload notifications to workflow executions.
//!
//! Notifications arrive in the S3 event-notification shape. Each
//! `ObjectCreated:*` record starts one execution whose name is derived from
//! the object identity and the event sequencer, so a redelivered event maps to
//! the execution it already started.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use log::{debug, info};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{
    engine::ConversionEngine,
    job::{Deadline, JobResult, ObjectRef, WorkflowInput},
};

const CREATED_EVENT_PREFIX: &str = "ObjectCreated:";

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("invalid upload notification: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("object key '{0}' is not valid percent-encoded UTF-8")]
    InvalidKey(String),

    #[error("could not start execution {name}: {source}")]
    Start {
        name: String,
        #[source]
        source: StartError,
    },
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("execution {name} already exists as {execution_id}")]
    ExecutionAlreadyExists { name: String, execution_id: String },

    #[error("workflow service unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Deserialize)]
struct EventDocument {
    #[serde(rename = "Records", default)]
    records: Vec<EventRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventRecord {
    event_name: String,
    #[serde(default)]
    event_time: Option<DateTime<Utc>>,
    s3: EventEntity,
}

#[derive(Debug, Deserialize)]
struct EventEntity {
    bucket: EventBucket,
    object: EventObject,
}

#[derive(Debug, Deserialize)]
struct EventBucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct EventObject {
    key: String,
    #[serde(default)]
    size: u64,
    #[serde(rename = "eTag", default)]
    etag: Option<String>,
    #[serde(default)]
    sequencer: Option<String>,
}

/// One object event, with its key already decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadNotification {
    pub bucket: String,
    pub key: String,
    pub event_type: String,
    pub size: u64,
    pub timestamp: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub sequencer: Option<String>,
}

impl UploadNotification {
    /// Parses every record of an event document.
    pub fn parse_event(json: &str) -> Result<Vec<UploadNotification>, TriggerError> {
        let document: EventDocument = serde_json::from_str(json)?;
        document
            .records
            .into_iter()
            .map(|record| {
                Ok(UploadNotification {
                    key: decode_key(&record.s3.object.key)?,
                    bucket: record.s3.bucket.name,
                    event_type: record.event_name,
                    size: record.s3.object.size,
                    timestamp: record.event_time,
                    etag: record.s3.object.etag,
                    sequencer: record.s3.object.sequencer,
                })
            })
            .collect()
    }

    pub fn is_object_created(&self) -> bool {
        self.event_type.starts_with(CREATED_EVENT_PREFIX)
    }

    /// Deterministic execution name; identical for redeliveries of the same
    /// event.
    pub fn execution_name(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.bucket.as_str(),
            self.key.as_str(),
            self.etag.as_deref().unwrap_or_default().trim_matches('"'),
            self.sequencer.as_deref().unwrap_or_default(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update(b"/");
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn workflow_input(&self) -> WorkflowInput {
        WorkflowInput::new(&self.bucket, &self.key)
    }
}

/// Event keys are form-encoded: `+` is a space.
fn decode_key(raw: &str) -> Result<String, TriggerError> {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|key| key.into_owned())
        .map_err(|_| TriggerError::InvalidKey(raw.to_string()))
}

/// Capability to start a named workflow execution.
pub trait WorkflowStarter: Send + Sync {
    /// Returns the execution id, or `ExecutionAlreadyExists` when `name` was
    /// used before.
    fn start_execution(&self, name: &str, input: &WorkflowInput) -> Result<String, StartError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub input: WorkflowInput,
    /// `None` while the job is still running.
    pub result: Option<JobResult>,
}

/// Runs each execution synchronously on the calling thread.
pub struct InlineWorkflowStarter {
    engine: Arc<ConversionEngine>,
    deadline: Option<std::time::Duration>,
    executions: Mutex<BTreeMap<String, ExecutionRecord>>,
}

impl InlineWorkflowStarter {
    pub fn new(engine: Arc<ConversionEngine>) -> Self {
        InlineWorkflowStarter {
            engine,
            deadline: None,
            executions: Mutex::new(BTreeMap::new()),
        }
    }

    /// Gives every execution this much time from its start.
    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.deadline = Some(timeout);
        self
    }

    pub fn execution(&self, name: &str) -> Option<ExecutionRecord> {
        self.state().ok()?.get(name).cloned()
    }

    pub fn executions(&self) -> Vec<(String, ExecutionRecord)> {
        self.state()
            .map(|state| {
                state
                    .iter()
                    .map(|(name, record)| (name.clone(), record.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn state(&self) -> Result<MutexGuard<'_, BTreeMap<String, ExecutionRecord>>, StartError> {
        self.executions
            .lock()
            .map_err(|_| StartError::Unavailable("execution registry poisoned".to_string()))
    }
}

impl WorkflowStarter for InlineWorkflowStarter {
    fn start_execution(&self, name: &str, input: &WorkflowInput) -> Result<String, StartError> {
        let execution_id = {
            let mut state = self.state()?;
            if let Some(existing) = state.get(name) {
                return Err(StartError::ExecutionAlreadyExists {
                    name: name.to_string(),
                    execution_id: existing.execution_id.clone(),
                });
            }
            let execution_id = format!("inline:{name}:{}", uuid::Uuid::new_v4());
            state.insert(
                name.to_string(),
                ExecutionRecord {
                    execution_id: execution_id.clone(),
                    input: input.clone(),
                    result: None,
                },
            );
            execution_id
        };

        let deadline = self.deadline.map_or_else(Deadline::none, Deadline::after);
        let result = self.engine.run(input, deadline);
        if let Some(record) = self.state()?.get_mut(name) {
            record.result = Some(result);
        }
        Ok(execution_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartedExecution {
    pub name: String,
    pub execution_id: String,
    pub source: ObjectRef,
    /// The event had already started this execution.
    pub duplicate: bool,
}

pub struct TriggerAdapter {
    starter: Arc<dyn WorkflowStarter>,
}

impl TriggerAdapter {
    pub fn new(starter: Arc<dyn WorkflowStarter>) -> Self {
        TriggerAdapter { starter }
    }

    /// Starts the execution for one notification; `None` when the event type
    /// is not an object creation.
    pub fn handle(
        &self,
        notification: &UploadNotification,
    ) -> Result<Option<StartedExecution>, TriggerError> {
        let source = ObjectRef::new(&notification.bucket, &notification.key);
        if !notification.is_object_created() {
            debug!("Ignoring {} event for {source}", notification.event_type);
            return Ok(None);
        }
        let name = notification.execution_name();
        let input = notification.workflow_input();
        match self.starter.start_execution(&name, &input) {
            Ok(execution_id) => {
                info!("Started execution {execution_id} for {source}");
                Ok(Some(StartedExecution {
                    name,
                    execution_id,
                    source,
                    duplicate: false,
                }))
            }
            Err(StartError::ExecutionAlreadyExists { execution_id, .. }) => {
                info!("Execution for {source} already exists as {execution_id}");
                Ok(Some(StartedExecution {
                    name,
                    execution_id,
                    source,
                    duplicate: true,
                }))
            }
            Err(source) => Err(TriggerError::Start { name, source }),
        }
    }

    pub fn handle_event(&self, json: &str) -> Result<Vec<StartedExecution>, TriggerError> {
        let mut started = Vec::new();
        for notification in UploadNotification::parse_event(json)? {
            if let Some(execution) = self.handle(&notification)? {
                started.push(execution);
            }
        }
        Ok(started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::MemoryCatalog,
        config::{LoadMode, LoaderConfig},
        storage::{LocalObjectStore, ObjectStore},
    };
    use tempfile::TempDir;

    fn event(name: &str, key: &str, sequencer: &str) -> String {
        format!(
            r#"{{"Records":[{{"eventVersion":"2.1","eventSource":"aws:s3",
                "eventTime":"2024-05-01T10:00:00.000Z","eventName":"{name}",
                "s3":{{"bucket":{{"name":"raw"}},
                       "object":{{"key":"{key}","size":12,"eTag":"abc","sequencer":"{sequencer}"}}}}}}]}}"#
        )
    }

    struct CountingStarter {
        names: Mutex<Vec<String>>,
    }

    impl WorkflowStarter for CountingStarter {
        fn start_execution(&self, name: &str, _input: &WorkflowInput) -> Result<String, StartError> {
            let mut names = self.names.lock().unwrap();
            if names.iter().any(|existing| existing == name) {
                return Err(StartError::ExecutionAlreadyExists {
                    name: name.to_string(),
                    execution_id: format!("exec-{name}"),
                });
            }
            names.push(name.to_string());
            Ok(format!("exec-{name}"))
        }
    }

    fn counting() -> (Arc<CountingStarter>, TriggerAdapter) {
        let starter = Arc::new(CountingStarter {
            names: Mutex::new(Vec::new()),
        });
        (starter.clone(), TriggerAdapter::new(starter))
    }

    #[test]
    fn parses_event_and_decodes_key() {
        let json = event("ObjectCreated:Put", "incoming/sales+report%202024.csv", "01");
        let notifications = UploadNotification::parse_event(&json).unwrap();
        assert_eq!(notifications.len(), 1);
        let n = &notifications[0];
        assert_eq!(n.bucket, "raw");
        assert_eq!(n.key, "incoming/sales report 2024.csv");
        assert_eq!(n.size, 12);
        assert!(n.is_object_created());
        assert!(n.timestamp.is_some());
    }

    #[test]
    fn non_create_events_are_skipped() {
        let (starter, adapter) = counting();
        let started = adapter
            .handle_event(&event("ObjectRemoved:Delete", "orders.csv", "01"))
            .unwrap();
        assert!(started.is_empty());
        assert!(starter.names.lock().unwrap().is_empty());
    }

    #[test]
    fn redelivered_event_maps_to_the_same_execution() {
        let (starter, adapter) = counting();
        let json = event("ObjectCreated:Put", "orders.csv", "01");
        let first = adapter.handle_event(&json).unwrap();
        let second = adapter.handle_event(&json).unwrap();
        assert_eq!(first[0].execution_id, second[0].execution_id);
        assert!(!first[0].duplicate);
        assert!(second[0].duplicate);
        assert_eq!(starter.names.lock().unwrap().len(), 1);

        let later = adapter
            .handle_event(&event("ObjectCreated:Put", "orders.csv", "02"))
            .unwrap();
        assert_ne!(later[0].name, first[0].name);
    }

    #[test]
    fn malformed_documents_are_rejected() {
        assert!(matches!(
            UploadNotification::parse_event("{\"Records\": 3}"),
            Err(TriggerError::Parse(_))
        ));
        assert!(matches!(
            UploadNotification::parse_event(&event("ObjectCreated:Put", "bad%FF.csv", "01")),
            Err(TriggerError::InvalidKey(_))
        ));
    }

    #[test]
    fn inline_starter_runs_the_engine_once_per_name() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalObjectStore::new(dir.path()));
        store.put("raw", "orders.csv", b"id\n1\n2\n").unwrap();
        let catalog = Arc::new(MemoryCatalog::new());
        let engine = Arc::new(ConversionEngine::new(
            LoaderConfig::new(LoadMode::Incremental, "sales", "lake"),
            store,
            catalog,
        ));
        let starter = Arc::new(InlineWorkflowStarter::new(engine));
        let adapter = TriggerAdapter::new(starter.clone());
        let json = event("ObjectCreated:Put", "orders.csv", "0A");
        adapter.handle_event(&json).unwrap();
        adapter.handle_event(&json).unwrap();

        let executions = starter.executions();
        assert_eq!(executions.len(), 1);
        let result = executions[0].1.result.clone().unwrap();
        assert!(result.is_success(), "{result:?}");
        assert_eq!(result.rows_processed, 2);
    }
}
