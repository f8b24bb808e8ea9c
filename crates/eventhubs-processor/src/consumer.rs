//! The slice of an Event Hubs consumer client the processor depends on.
//!
//! The processor only needs to know who it is (namespace, event hub, consumer
//! group, client id) and which partitions exist. Receiving events is the
//! transport's job and stays behind this trait.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Identity of a consumer client. `client_id` is the owner id written into
/// every ownership this processor claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerClientDetails {
    pub fully_qualified_namespace: String,
    pub event_hub_name: String,
    pub consumer_group: String,
    pub client_id: String,
}

impl ConsumerClientDetails {
    pub fn new(
        fully_qualified_namespace: impl Into<String>,
        event_hub_name: impl Into<String>,
        consumer_group: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            fully_qualified_namespace: fully_qualified_namespace.into(),
            event_hub_name: event_hub_name.into(),
            consumer_group: consumer_group.into(),
            client_id: client_id.into(),
        }
    }
}

/// Runtime properties of an event hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHubProperties {
    pub name: String,
    pub created_on: Option<DateTime<Utc>>,
    pub partition_ids: Vec<String>,
}

#[async_trait]
pub trait EventHubClient: Send + Sync {
    fn details(&self) -> &ConsumerClientDetails;

    async fn get_event_hub_properties(&self) -> Result<EventHubProperties>;
}

/// Event hub with a fixed partition list.
#[derive(Debug, Clone)]
pub struct StaticEventHub {
    details: ConsumerClientDetails,
    partition_ids: Vec<String>,
    created_on: DateTime<Utc>,
}

impl StaticEventHub {
    pub fn new(details: ConsumerClientDetails, partition_ids: Vec<String>) -> Self {
        Self {
            details,
            partition_ids,
            created_on: Utc::now(),
        }
    }

    /// Partitions named "0" through "count - 1".
    pub fn with_partition_count(details: ConsumerClientDetails, count: usize) -> Self {
        Self::new(details, (0..count).map(|i| i.to_string()).collect())
    }
}

#[async_trait]
impl EventHubClient for StaticEventHub {
    fn details(&self) -> &ConsumerClientDetails {
        &self.details
    }

    async fn get_event_hub_properties(&self) -> Result<EventHubProperties> {
        Ok(EventHubProperties {
            name: self.details.event_hub_name.clone(),
            created_on: Some(self.created_on),
            partition_ids: self.partition_ids.clone(),
        })
    }
}
