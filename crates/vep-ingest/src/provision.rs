//! Relation provisioning
//!
//! [`TableProvisioner::ensure_relation`] makes sure the relation for a
//! (namespace, vendor, jurisdiction) triple exists and matches the canonical
//! schema. The check-then-create sequence runs under a per-relation async
//! mutex, so concurrent pipelines for the same relation trigger at most one
//! creation and the losers pick up the winner's handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info};
use vep_common::CanonicalSchema;

use crate::error::{IngestError, Result};
use crate::relation::{find_drift, relation_columns, RelationHandle, RelationId, RelationName};
use crate::store::RelationStore;

/// Per-relation slot; holds the schema the relation was verified against
type Slot = Arc<tokio::sync::Mutex<Option<Arc<CanonicalSchema>>>>;

pub struct TableProvisioner {
    store: Arc<dyn RelationStore>,
    slots: Mutex<HashMap<RelationName, Slot>>,
}

impl TableProvisioner {
    pub fn new(store: Arc<dyn RelationStore>) -> Self {
        Self {
            store,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn RelationStore> {
        &self.store
    }

    // Keyed by physical name: different spellings of a vendor can share a table
    fn slot(&self, name: &RelationName) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(name.clone()).or_default())
    }

    /// Return a handle to the relation, creating it on first use
    pub async fn ensure_relation(
        &self,
        namespace: &str,
        vendor: &str,
        jurisdiction: &str,
        schema: &Arc<CanonicalSchema>,
    ) -> Result<RelationHandle> {
        let id = RelationId::new(namespace, vendor, jurisdiction);
        let name = id.relation_name()?;
        let slot = self.slot(&name);
        let mut verified = slot.lock().await;

        if verified.as_ref().is_some_and(|known| known == schema) {
            debug!(relation = %name, "Relation already verified");
            return Ok(RelationHandle::new(name, Arc::clone(schema)));
        }

        let expected = relation_columns(schema);
        match self.store.describe(&name).await? {
            None => {
                self.store.create(&name, &expected).await?;
                info!(relation = %name, identity = %id, columns = expected.len(), "Created relation");
            }
            Some(existing) => {
                let (missing, conflicting) = find_drift(&expected, &existing);
                if !missing.is_empty() || !conflicting.is_empty() {
                    error!(
                        relation = %name,
                        missing = ?missing,
                        conflicting = ?conflicting,
                        "Existing relation does not match the canonical schema"
                    );
                    return Err(IngestError::SchemaDrift {
                        relation: name.qualified(),
                        missing,
                        conflicting,
                    });
                }
                debug!(relation = %name, "Reusing existing relation");
            }
        }

        *verified = Some(Arc::clone(schema));
        Ok(RelationHandle::new(name, Arc::clone(schema)))
    }
}
