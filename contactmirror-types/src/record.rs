//! Contact records.

use crate::{Detail, DetailKind, DetailKindSet, DetailValue, HybridTimestamp, RecordId};
use serde::{Deserialize, Serialize};

/// A contact as stored by either the primary or the mirror store.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContactRecord {
    /// Store-assigned id; `None` until the record has been saved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,

    /// Unordered collection of details.
    #[serde(default)]
    pub details: Vec<Detail>,

    /// Id of the peer-store record this one was created from by the sync
    /// engine. Clients never set it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<RecordId>,
}

impl ContactRecord {
    /// Creates an unsaved, empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the record id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<RecordId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Appends a detail.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<Detail>) -> Self {
        self.details.push(detail.into());
        self
    }

    /// Iterates over details of one kind.
    pub fn details_of(&self, kind: DetailKind) -> impl Iterator<Item = &Detail> {
        self.details.iter().filter(move |d| d.kind() == kind)
    }

    /// Returns the first detail of the given kind.
    #[must_use]
    pub fn first(&self, kind: DetailKind) -> Option<&Detail> {
        self.details.iter().find(|d| d.kind() == kind)
    }

    /// Returns true if the record carries at least one detail of `kind`.
    #[must_use]
    pub fn has(&self, kind: DetailKind) -> bool {
        self.first(kind).is_some()
    }

    /// Drops every detail of the given kind.
    pub fn remove_kind(&mut self, kind: DetailKind) {
        self.details.retain(|d| d.kind() != kind);
    }

    /// Replaces all details of the value's kind with a single new detail.
    pub fn set_detail(&mut self, value: DetailValue) {
        self.remove_kind(value.kind());
        self.details.push(Detail::new(value));
    }

    /// The set of kinds present on this record.
    #[must_use]
    pub fn kinds(&self) -> DetailKindSet {
        self.details.iter().map(Detail::kind).collect()
    }

    /// Ownership label (the `SyncTarget` detail), if any.
    #[must_use]
    pub fn ownership_label(&self) -> Option<&str> {
        self.details.iter().find_map(|d| match &d.value {
            DetailValue::SyncTarget { label } => Some(label.as_str()),
            _ => None,
        })
    }

    /// Store-local secondary identifier, if any.
    #[must_use]
    pub fn guid(&self) -> Option<&str> {
        self.details.iter().find_map(|d| match &d.value {
            DetailValue::Guid { guid } => Some(guid.as_str()),
            _ => None,
        })
    }

    /// Avatar image reference, if any.
    #[must_use]
    pub fn avatar_url(&self) -> Option<&str> {
        self.details.iter().find_map(|d| match &d.value {
            DetailValue::Avatar { image_url } => Some(image_url.as_str()),
            _ => None,
        })
    }

    /// Last-modified timestamp stamped by the owning store, if any.
    #[must_use]
    pub fn last_modified(&self) -> Option<HybridTimestamp> {
        self.details.iter().find_map(|d| match &d.value {
            DetailValue::Timestamp { modified, .. } => Some(*modified),
            _ => None,
        })
    }

    /// Human-readable label for logs.
    #[must_use]
    pub fn display_name(&self) -> String {
        for detail in &self.details {
            match &detail.value {
                DetailValue::DisplayLabel { label } if !label.is_empty() => return label.clone(),
                DetailValue::Name { given, family } if !(given.is_empty() && family.is_empty()) => {
                    return format!("{given} {family}").trim().to_string();
                }
                _ => {}
            }
        }
        self.id
            .as_ref()
            .map(|id| format!("#{id}"))
            .unwrap_or_else(|| "<unsaved>".to_string())
    }

    /// Compares the details of two records as multisets, ignoring detail
    /// bookkeeping and every kind in `ignored`.
    #[must_use]
    pub fn content_matches(&self, other: &ContactRecord, ignored: DetailKindSet) -> bool {
        let kinds = self.kinds().union(other.kinds()).difference(ignored);
        kinds.iter().all(|kind| {
            let mut theirs: Vec<&Detail> = other.details_of(kind).collect();
            let ours: Vec<&Detail> = self.details_of(kind).collect();
            if ours.len() != theirs.len() {
                return false;
            }
            ours.into_iter().all(|detail| {
                match theirs.iter().position(|t| t.same_content(detail)) {
                    Some(pos) => {
                        theirs.swap_remove(pos);
                        true
                    }
                    None => false,
                }
            })
        })
    }

    /// Serializes the record to JSON.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserializes a record from JSON.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
