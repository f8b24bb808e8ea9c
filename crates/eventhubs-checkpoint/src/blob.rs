//! Object store backed checkpoint store.
//!
//! Every ownership and checkpoint is one empty object whose fields live in
//! user metadata. The object's own etag and last-modified time are the
//! concurrency token and timestamp of the record.
//!
//! ## Layout
//!
//! ```text
//! {namespace}/{event hub}/{consumer group}/ownership/{partition id}   metadata: ownerid
//! {namespace}/{event hub}/{consumer group}/checkpoint/{partition id}  metadata: sequencenumber, offset
//! ```
//!
//! ## Conditional Writes
//!
//! | record etag | put mode                  | lost when                      |
//! |-------------|---------------------------|--------------------------------|
//! | `Some`      | `PutMode::Update` (If-Match) | etag changed or object missing |
//! | `None`      | `PutMode::Create`         | object already exists          |
//!
//! Checkpoints are written with `PutMode::Overwrite`.

use crate::error::{CheckpointStoreError, Result};
use crate::memory::validate_scope;
use crate::types::{Checkpoint, ClaimOutcome, LostReason, Ownership};
use crate::CheckpointStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{
    Attribute, AttributeValue, Attributes, ObjectMeta, ObjectStore, PutMode, PutOptions,
    PutPayload, UpdateVersion,
};
use std::sync::Arc;
use tracing::{debug, warn};

const OWNER_ID: &str = "ownerid";
const SEQUENCE_NUMBER: &str = "sequencenumber";
const OFFSET: &str = "offset";

const OWNERSHIP_DIR: &str = "ownership";
const CHECKPOINT_DIR: &str = "checkpoint";

pub struct BlobCheckpointStore {
    store: Arc<dyn ObjectStore>,
}

impl BlobCheckpointStore {
    /// Wrap any object store. Use `object_store::memory::InMemory` in tests.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Azure Blob container, with credentials and account taken from the
    /// standard `AZURE_STORAGE_*` environment variables.
    pub fn azure_from_env(container: &str) -> Result<Self> {
        let store = object_store::azure::MicrosoftAzureBuilder::from_env()
            .with_container_name(container)
            .build()?;
        Ok(Self::new(Arc::new(store)))
    }

    async fn claim_one(&self, ownership: Ownership) -> ClaimOutcome {
        let path = record_path(
            &ownership.fully_qualified_namespace,
            &ownership.event_hub_name,
            &ownership.consumer_group,
            OWNERSHIP_DIR,
            &ownership.partition_id,
        );

        let mode = match &ownership.etag {
            Some(etag) => PutMode::Update(UpdateVersion {
                e_tag: Some(etag.clone()),
                version: None,
            }),
            None => PutMode::Create,
        };

        let mut attributes = Attributes::new();
        attributes.insert(metadata_key(OWNER_ID), AttributeValue::from(ownership.owner_id.clone()));

        let opts = PutOptions {
            mode,
            attributes,
            ..Default::default()
        };

        match self.store.put_opts(&path, PutPayload::default(), opts).await {
            Ok(put) => {
                let (etag, last_modified) = self.written_version(&path, put.e_tag).await;
                ClaimOutcome::Claimed(Ownership {
                    etag,
                    last_modified_time: Some(last_modified),
                    ..ownership
                })
            }
            Err(
                object_store::Error::Precondition { .. }
                | object_store::Error::AlreadyExists { .. }
                | object_store::Error::NotFound { .. },
            ) => {
                debug!(
                    partition_id = %ownership.partition_id,
                    owner_id = %ownership.owner_id,
                    "Ownership claim lost, blob changed since it was read"
                );
                ClaimOutcome::Lost {
                    partition_id: ownership.partition_id,
                    reason: LostReason::Conflict,
                }
            }
            Err(e) => {
                warn!(
                    partition_id = %ownership.partition_id,
                    owner_id = %ownership.owner_id,
                    error = %e,
                    "Ownership claim failed"
                );
                ClaimOutcome::Lost {
                    partition_id: ownership.partition_id,
                    reason: LostReason::Transient(e.to_string()),
                }
            }
        }
    }

    /// Etag and last-modified time of the object we just wrote.
    ///
    /// Put responses don't carry the modification time, so it is read back. If
    /// someone overwrote the object in between, the head belongs to them and
    /// only our own etag is kept.
    async fn written_version(
        &self,
        path: &Path,
        put_etag: Option<String>,
    ) -> (Option<String>, DateTime<Utc>) {
        match self.store.head(path).await {
            Ok(meta) if put_etag.is_none() || meta.e_tag == put_etag => {
                (meta.e_tag, meta.last_modified)
            }
            Ok(_) => (put_etag, Utc::now()),
            Err(e) => {
                debug!(path = %path, error = %e, "Failed to read back ownership blob");
                (put_etag, Utc::now())
            }
        }
    }

    /// List a record directory and fetch each object's metadata.
    async fn list_records(&self, prefix: &Path) -> Result<Vec<(ObjectMeta, Attributes)>> {
        let metas: Vec<ObjectMeta> = self.store.list(Some(prefix)).try_collect().await?;

        let fetches = metas.into_iter().map(|meta| async move {
            let result = self.store.get(&meta.location).await?;
            Ok::<_, CheckpointStoreError>((result.meta, result.attributes))
        });

        try_join_all(fetches).await
    }
}

#[async_trait]
impl CheckpointStore for BlobCheckpointStore {
    async fn list_ownership(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<Ownership>> {
        let prefix = dir_path(fully_qualified_namespace, event_hub_name, consumer_group, OWNERSHIP_DIR);

        self.list_records(&prefix)
            .await?
            .into_iter()
            .map(|(meta, attributes)| {
                let partition_id = partition_of(&meta)?;
                let owner_id = metadata_value(&attributes, OWNER_ID)
                    .ok_or_else(|| {
                        CheckpointStoreError::malformed(meta.location.to_string(), "missing ownerid")
                    })?
                    .to_string();

                Ok(Ownership {
                    consumer_group: consumer_group.to_string(),
                    event_hub_name: event_hub_name.to_string(),
                    fully_qualified_namespace: fully_qualified_namespace.to_string(),
                    partition_id,
                    owner_id,
                    etag: meta.e_tag,
                    last_modified_time: Some(meta.last_modified),
                })
            })
            .collect()
    }

    async fn claim_ownership(&self, ownerships: Vec<Ownership>) -> Result<Vec<ClaimOutcome>> {
        for o in &ownerships {
            validate_scope(
                &o.fully_qualified_namespace,
                &o.event_hub_name,
                &o.consumer_group,
                &o.partition_id,
            )?;
        }

        let claims = ownerships.into_iter().map(|o| self.claim_one(o));
        Ok(futures::future::join_all(claims).await)
    }

    async fn list_checkpoints(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<Checkpoint>> {
        let prefix = dir_path(fully_qualified_namespace, event_hub_name, consumer_group, CHECKPOINT_DIR);

        self.list_records(&prefix)
            .await?
            .into_iter()
            .map(|(meta, attributes)| {
                let partition_id = partition_of(&meta)?;
                let location = meta.location.to_string();
                let sequence_number = parse_number(&attributes, SEQUENCE_NUMBER, &location)?;
                let offset = parse_number(&attributes, OFFSET, &location)?;

                if sequence_number.is_none() && offset.is_none() {
                    return Err(CheckpointStoreError::malformed(
                        location,
                        "neither offset nor sequencenumber is set",
                    ));
                }

                Ok(Checkpoint {
                    consumer_group: consumer_group.to_string(),
                    event_hub_name: event_hub_name.to_string(),
                    fully_qualified_namespace: fully_qualified_namespace.to_string(),
                    partition_id,
                    offset,
                    sequence_number,
                })
            })
            .collect()
    }

    async fn update_checkpoint(&self, checkpoint: Checkpoint) -> Result<()> {
        validate_scope(
            &checkpoint.fully_qualified_namespace,
            &checkpoint.event_hub_name,
            &checkpoint.consumer_group,
            &checkpoint.partition_id,
        )?;

        let path = record_path(
            &checkpoint.fully_qualified_namespace,
            &checkpoint.event_hub_name,
            &checkpoint.consumer_group,
            CHECKPOINT_DIR,
            &checkpoint.partition_id,
        );

        let mut attributes = Attributes::new();
        if let Some(sequence_number) = checkpoint.sequence_number {
            attributes.insert(
                metadata_key(SEQUENCE_NUMBER),
                AttributeValue::from(sequence_number.to_string()),
            );
        }
        if let Some(offset) = checkpoint.offset {
            attributes.insert(metadata_key(OFFSET), AttributeValue::from(offset.to_string()));
        }

        let opts = PutOptions {
            mode: PutMode::Overwrite,
            attributes,
            ..Default::default()
        };
        self.store.put_opts(&path, PutPayload::default(), opts).await?;

        debug!(
            partition_id = %checkpoint.partition_id,
            sequence_number = ?checkpoint.sequence_number,
            offset = ?checkpoint.offset,
            "Checkpoint updated"
        );
        Ok(())
    }
}

fn dir_path(namespace: &str, event_hub: &str, consumer_group: &str, dir: &str) -> Path {
    Path::from_iter([namespace, event_hub, consumer_group, dir])
}

fn record_path(
    namespace: &str,
    event_hub: &str,
    consumer_group: &str,
    dir: &str,
    partition_id: &str,
) -> Path {
    Path::from_iter([namespace, event_hub, consumer_group, dir, partition_id])
}

fn partition_of(meta: &ObjectMeta) -> Result<String> {
    meta.location
        .filename()
        .map(str::to_string)
        .ok_or_else(|| CheckpointStoreError::malformed(meta.location.to_string(), "no partition id"))
}

fn metadata_key(name: &'static str) -> Attribute {
    Attribute::Metadata(name.into())
}

fn metadata_value<'a>(attributes: &'a Attributes, name: &'static str) -> Option<&'a str> {
    attributes
        .get(&metadata_key(name))
        .map(AsRef::<str>::as_ref)
}

fn parse_number(attributes: &Attributes, name: &'static str, location: &str) -> Result<Option<i64>> {
    match metadata_value(attributes, name) {
        None => Ok(None),
        Some(raw) => raw.parse::<i64>().map(Some).map_err(|e| {
            CheckpointStoreError::malformed(location, format!("invalid {} {:?}: {}", name, raw, e))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        let path = record_path("ns.servicebus.windows.net", "orders", "cg", OWNERSHIP_DIR, "3");
        assert_eq!(path.as_ref(), "ns.servicebus.windows.net/orders/cg/ownership/3");

        let dir = dir_path("ns", "orders", "cg", CHECKPOINT_DIR);
        assert_eq!(dir.as_ref(), "ns/orders/cg/checkpoint");
    }

    #[test]
    fn test_parse_number() {
        let mut attributes = Attributes::new();
        attributes.insert(metadata_key(OFFSET), AttributeValue::from("101".to_string()));
        attributes.insert(metadata_key(SEQUENCE_NUMBER), AttributeValue::from("x".to_string()));

        assert_eq!(parse_number(&attributes, OFFSET, "p").unwrap(), Some(101));
        assert!(matches!(
            parse_number(&attributes, SEQUENCE_NUMBER, "p"),
            Err(CheckpointStoreError::MalformedRecord { .. })
        ));
    }
}
