//! Time-series sequence updates

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::config::{value_to_string, SharedConfig};
use crate::messages::OutboundQueue;
use crate::resources::{resource_type, server_timestamp, split_path, ApiError, ResourceClient, RESOURCES_PATH};

/// Value type of a sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Numbers, stored with `decimal_places` precision
    Numeric,
    /// Free text
    Text,
    /// Image data
    Image,
}

impl DataType {
    /// Code used by the resource API
    pub fn code(&self) -> u32 {
        match self {
            DataType::Numeric => 1,
            DataType::Text => 2,
            DataType::Image => 3,
        }
    }
}

/// Minimum interval (seconds) between stored values of a new sequence
const MIN_STORAGE_INTERVAL: u32 = 20;

/// Sends sequence values to the server
pub struct SequenceClient {
    config: SharedConfig,
    queue: Arc<OutboundQueue>,
    resources: Arc<ResourceClient>,
    created: Mutex<HashSet<String>>,
}

impl SequenceClient {
    /// Client publishing through `queue`, creating sequences through `resources`
    pub fn new(config: SharedConfig, queue: Arc<OutboundQueue>, resources: Arc<ResourceClient>) -> Self {
        Self {
            config,
            queue,
            resources,
            created: Mutex::new(HashSet::new()),
        }
    }

    fn server_enabled(&self) -> bool {
        self.config
            .read()
            .map(|c| c.get_bool("enable_server", true))
            .unwrap_or(true)
    }

    /// Queue a new value for a sequence (relative to this controller's folder)
    pub fn update(&self, sequence: &str, value: impl Into<Value>) {
        if self.server_enabled() {
            self.queue.send(
                "update_sequence",
                json!({"sequence": sequence, "value": value.into()}),
            );
        }
    }

    /// Store several values (absolute sequence paths) with one request.
    ///
    /// Values are sent as strings; the timestamp defaults to now.
    pub async fn update_multiple(
        &self,
        values: &BTreeMap<String, Value>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), ApiError> {
        let strings: Map<String, Value> = values
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(value_to_string(v))))
            .collect();
        let params = vec![
            ("values".to_string(), Value::Object(strings).to_string()),
            (
                "timestamp".to_string(),
                server_timestamp(timestamp.unwrap_or_else(Utc::now)),
            ),
        ];
        self.resources
            .send_request(Method::PUT, RESOURCES_PATH, params)
            .await?;
        Ok(())
    }

    /// Create a sequence resource unless it already exists
    pub async fn create(
        &self,
        full_path: &str,
        data_type: DataType,
        decimal_places: Option<u32>,
        units: Option<&str>,
    ) -> Result<(), ApiError> {
        if self.lock_created().contains(full_path) {
            return Ok(());
        }

        if !self.resources.exists(full_path).await? {
            let (parent, name) = split_path(full_path);
            let mut params = vec![
                ("path".to_string(), parent.to_string()),
                ("name".to_string(), name.to_string()),
                ("type".to_string(), resource_type::SEQUENCE.to_string()),
                ("data_type".to_string(), data_type.code().to_string()),
                ("min_storage_interval".to_string(), MIN_STORAGE_INTERVAL.to_string()),
            ];
            if let Some(places) = decimal_places {
                params.push(("decimal_places".into(), places.to_string()));
            }
            if let Some(units) = units.filter(|u| !u.is_empty()) {
                params.push(("units".into(), units.to_string()));
            }
            self.resources
                .send_request(Method::POST, RESOURCES_PATH, params)
                .await?;
            tracing::info!("created sequence {}", full_path);
        }

        self.lock_created().insert(full_path.to_string());
        Ok(())
    }

    fn lock_created(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.created.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for SequenceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceClient").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn client(enable_server: bool) -> (SequenceClient, Arc<OutboundQueue>) {
        let config = Config::from_value(json!({"enable_server": enable_server}))
            .unwrap()
            .into_shared();
        let queue = Arc::new(OutboundQueue::new());
        let resources = Arc::new(ResourceClient::new("localhost:1", false, "test"));
        (SequenceClient::new(config, queue.clone(), resources), queue)
    }

    #[test]
    fn test_update_enqueues_message() {
        let (sequences, queue) = client(true);
        sequences.update("temperature", 21.5);
        let sent = queue.snapshot();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].envelope.message_type, "update_sequence");
        assert_eq!(
            sent[0].envelope.parameters,
            json!({"sequence": "temperature", "value": 21.5})
        );
    }

    #[test]
    fn test_update_disabled_server() {
        let (sequences, queue) = client(false);
        sequences.update("log", "INFO: started");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_data_type_codes() {
        assert_eq!(DataType::Numeric.code(), 1);
        assert_eq!(DataType::Text.code(), 2);
        assert_eq!(DataType::Image.code(), 3);
    }
}
