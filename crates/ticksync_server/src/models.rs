//! Syncable record types and how each links to patients and facilities.

use crate::error::SyncResult;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use ticksync_protocol::SyncDirection;
use ticksync_store::{Record, RecordKey, SnapshotRow, Transaction};
use tracing::warn;

/// Who a record is visible to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Linkage {
    /// Patient the record belongs to.
    pub patient_id: Option<String>,
    /// Facility the record belongs to.
    pub facility_id: Option<String>,
    /// Whether the record is part of a lab request.
    pub is_lab_request: bool,
}

/// How a model finds the patient its records belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatientLink {
    /// Not patient data.
    None,
    /// The record is the patient.
    SelfId,
    /// A field holds the patient id.
    Field(String),
    /// A field references a parent record whose patient applies.
    Via {
        /// Field holding the parent id.
        field: String,
        /// Record type of the parent.
        parent_type: String,
    },
}

/// A record type taking part in sync.
pub trait SyncModel: Send + Sync {
    /// Record type name.
    fn record_type(&self) -> &str;

    /// Which way records of this type flow.
    fn direction(&self) -> SyncDirection;

    /// Whether records only reach devices that marked their patient.
    fn is_patient_linked(&self) -> bool {
        false
    }

    /// Resolves the patient, facility and lab-request linkage of `record`.
    fn linkage(&self, _record: &Record, _txn: &Transaction, _models: &ModelRegistry) -> Linkage {
        Linkage::default()
    }

    /// The parent record whose patient `record` inherits, if any.
    fn patient_parent(&self, _record: &Record) -> Option<RecordKey> {
        None
    }

    /// Runs before incoming rows of this type are saved.
    ///
    /// May rewrite `incoming` and write to live tables through `txn`.
    /// Returns the keys of live records whose final state must reach the
    /// pushing device in the same session.
    fn incoming_hook(
        &self,
        _txn: &mut Transaction,
        _incoming: &mut [SnapshotRow],
    ) -> SyncResult<Vec<RecordKey>> {
        Ok(Vec::new())
    }

    /// Runs after a push of this type has been persisted.
    fn adjust_post_push(&self, _txn: &mut Transaction, _record_ids: &[String]) -> SyncResult<()> {
        Ok(())
    }
}

/// A declaratively configured model.
#[derive(Debug, Clone)]
pub struct SimpleModel {
    record_type: String,
    direction: SyncDirection,
    patient: PatientLink,
    facility_field: Option<String>,
    is_lab_request: bool,
}

impl SimpleModel {
    /// Creates a model with no linkage.
    pub fn new(record_type: impl Into<String>, direction: SyncDirection) -> Self {
        Self {
            record_type: record_type.into(),
            direction,
            patient: PatientLink::None,
            facility_field: None,
            is_lab_request: false,
        }
    }

    /// Marks the model as the patient model itself.
    pub fn patient_root(mut self) -> Self {
        self.patient = PatientLink::SelfId;
        self
    }

    /// Links records to the patient named by `field`.
    pub fn with_patient_field(mut self, field: impl Into<String>) -> Self {
        self.patient = PatientLink::Field(field.into());
        self
    }

    /// Links records to the patient of the parent named by `field`.
    pub fn with_patient_via(mut self, field: impl Into<String>, parent_type: impl Into<String>) -> Self {
        self.patient = PatientLink::Via {
            field: field.into(),
            parent_type: parent_type.into(),
        };
        self
    }

    /// Restricts records to the facility named by `field`.
    pub fn with_facility_field(mut self, field: impl Into<String>) -> Self {
        self.facility_field = Some(field.into());
        self
    }

    /// Marks records as lab requests.
    pub fn lab_request(mut self) -> Self {
        self.is_lab_request = true;
        self
    }
}

impl SyncModel for SimpleModel {
    fn record_type(&self) -> &str {
        &self.record_type
    }

    fn direction(&self) -> SyncDirection {
        self.direction
    }

    fn is_patient_linked(&self) -> bool {
        self.patient != PatientLink::None
    }

    fn linkage(&self, record: &Record, txn: &Transaction, models: &ModelRegistry) -> Linkage {
        let patient_id = match &self.patient {
            PatientLink::None => None,
            PatientLink::SelfId => Some(record.id.clone()),
            PatientLink::Field(field) => record.field_str(field).map(str::to_string),
            PatientLink::Via { .. } => self
                .patient_parent(record)
                .and_then(|parent| models.patient_through(parent, txn)),
        };
        let facility_id = self
            .facility_field
            .as_deref()
            .and_then(|field| record.field_str(field))
            .map(str::to_string);
        Linkage {
            patient_id,
            facility_id,
            is_lab_request: self.is_lab_request,
        }
    }

    fn patient_parent(&self, record: &Record) -> Option<RecordKey> {
        match &self.patient {
            PatientLink::Via { field, parent_type } => record
                .field_str(field)
                .map(|parent_id| (parent_type.clone(), parent_id.to_string())),
            _ => None,
        }
    }
}

/// All models known to the server, keyed by record type.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, Arc<dyn SyncModel>>,
}

impl ModelRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a model, replacing any with the same record type.
    pub fn register(mut self, model: impl SyncModel + 'static) -> Self {
        self.insert(Arc::new(model));
        self
    }

    /// Adds a shared model.
    pub fn insert(&mut self, model: Arc<dyn SyncModel>) {
        self.models.insert(model.record_type().to_string(), model);
    }

    /// Looks up a model.
    pub fn get(&self, record_type: &str) -> Option<&Arc<dyn SyncModel>> {
        self.models.get(record_type)
    }

    /// All models in record type order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn SyncModel>> {
        self.models.values()
    }

    /// Models clients may pull, optionally restricted to `tables`.
    pub fn pullable<'a>(
        &'a self,
        tables: Option<&'a [String]>,
    ) -> impl Iterator<Item = &'a Arc<dyn SyncModel>> + 'a {
        self.models.values().filter(move |m| {
            m.direction().can_pull()
                && tables.map_or(true, |t| t.iter().any(|name| name == m.record_type()))
        })
    }

    /// Models clients may push, optionally restricted to `tables`.
    pub fn pushable<'a>(
        &'a self,
        tables: Option<&'a [String]>,
    ) -> impl Iterator<Item = &'a Arc<dyn SyncModel>> + 'a {
        self.models.values().filter(move |m| {
            m.direction().can_push()
                && tables.map_or(true, |t| t.iter().any(|name| name == m.record_type()))
        })
    }

    /// Follows parent links from `start` to the record that names a patient.
    ///
    /// A chain that revisits a record has no patient.
    pub fn patient_through(&self, start: RecordKey, txn: &Transaction) -> Option<String> {
        let mut visited = BTreeSet::new();
        let mut key = start;
        loop {
            if !visited.insert(key.clone()) {
                warn!(record_type = %key.0, record_id = %key.1, "patient link cycle");
                return None;
            }
            let record = txn.get_record(&key.0, &key.1)?;
            let model = self.get(&key.0)?;
            match model.patient_parent(&record) {
                Some(parent) => key = parent,
                None => return model.linkage(&record, txn, self).patient_id,
            }
        }
    }

    /// Number of registered models.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Returns true if no model is registered.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.models.keys()).finish()
    }
}
