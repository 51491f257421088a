//! Record shape translation between the primary and mirror stores.
//!
//! Everything here is a pure function of its input except
//! [`RecordTransformer::rewrite_avatar`], which hard-links the avatar file
//! into a location mirror consumers can read.

use crate::classifier::STORE_LOCAL;
use contactmirror_types::{ContactRecord, DetailValue, RecordId};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use tracing::debug;

/// An avatar reference rewritten during export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvatarRewrite {
    /// The mirror-accessible url written to the mirror record.
    pub rewritten: String,
    /// The privileged url kept by the primary record.
    pub original: String,
}

/// Strips the store disambiguator from a detail uri.
///
/// Primary uris look like `"<primaryId>:<name>"`, mirror uris are the bare
/// `"<name>"`. Only an all-digit leading segment counts as a disambiguator.
#[must_use]
pub fn canonical_uri(uri: &str) -> &str {
    match uri.split_once(':') {
        Some((prefix, rest)) if !prefix.is_empty() && prefix.bytes().all(|b| b.is_ascii_digit()) => {
            rest
        }
        _ => uri,
    }
}

/// Qualifies a detail uri with the primary store's record id.
#[must_use]
pub fn qualified_uri(id: &RecordId, uri: &str) -> String {
    format!("{id}:{}", canonical_uri(uri))
}

/// Replaces rewritten avatar urls with their originals.
///
/// Returns true if any avatar was reverted.
pub fn revert_avatar(record: &mut ContactRecord, remaps: Option<&BTreeMap<String, String>>) -> bool {
    let Some(remaps) = remaps else {
        return false;
    };
    let mut reverted = false;
    for detail in &mut record.details {
        if let DetailValue::Avatar { image_url } = &mut detail.value {
            if let Some(original) = remaps.get(image_url.as_str()) {
                image_url.clone_from(original);
                reverted = true;
            }
        }
    }
    reverted
}

fn local_path(url: &str) -> Option<(&str, &str)> {
    if let Some(path) = url.strip_prefix("file://") {
        Some(("file://", path))
    } else if url.contains("://") {
        None
    } else {
        Some(("", url))
    }
}

fn link_avatar(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    match fs::hard_link(from, to) {
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            if same_file(from, to)? {
                return Ok(());
            }
            // A stale export of an avatar that has since been replaced.
            fs::remove_file(to)?;
            fs::hard_link(from, to)
        }
        other => other,
    }
}

#[cfg(unix)]
fn same_file(a: &Path, b: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let (a, b) = (fs::metadata(a)?, fs::metadata(b)?);
    Ok(a.dev() == b.dev() && a.ino() == b.ino())
}

#[cfg(not(unix))]
fn same_file(_: &Path, _: &Path) -> io::Result<bool> {
    Ok(false)
}

/// Translates records between the two store shapes.
#[derive(Debug, Clone)]
pub struct RecordTransformer {
    aggregate_label: String,
    privileged_segment: String,
}

impl RecordTransformer {
    /// Creates a transformer writing `aggregate_label` as ownership label and
    /// rewriting avatars under `privileged_segment`.
    #[must_use]
    pub fn new(aggregate_label: impl Into<String>, privileged_segment: impl Into<String>) -> Self {
        Self {
            aggregate_label: aggregate_label.into(),
            privileged_segment: privileged_segment.into(),
        }
    }

    /// The canonical ownership label.
    #[must_use]
    pub fn aggregate_label(&self) -> &str {
        &self.aggregate_label
    }

    /// Drops store-local bookkeeping: the timestamp, the secondary
    /// identifier, provenance tags, the id and the origin hint. The
    /// ownership label is set to the aggregate label.
    #[must_use]
    pub fn normalize(&self, record: &ContactRecord) -> ContactRecord {
        let mut out = ContactRecord {
            id: None,
            details: record
                .details
                .iter()
                .filter(|d| !STORE_LOCAL.contains(d.kind()))
                .cloned()
                .collect(),
            origin: None,
        };
        for detail in &mut out.details {
            detail.meta.provenance = None;
        }
        out.set_detail(DetailValue::SyncTarget {
            label: self.aggregate_label.clone(),
        });
        out
    }

    /// Shapes a mirror record for the primary store.
    ///
    /// With `primary_id` the record takes that id and its detail uris are
    /// qualified with it. Without one (a record not saved yet) detail uris
    /// are dropped; they are filled in once the store has assigned an id.
    #[must_use]
    pub fn to_primary(&self, record: &ContactRecord, primary_id: Option<&RecordId>) -> ContactRecord {
        let mut out = self.normalize(record);
        for detail in &mut out.details {
            match primary_id {
                Some(id) => {
                    detail.meta.uri = detail.meta.uri.as_deref().map(|u| qualified_uri(id, u));
                    for link in &mut detail.meta.linked_uris {
                        *link = qualified_uri(id, link);
                    }
                }
                None => {
                    detail.meta.uri = None;
                    detail.meta.linked_uris.clear();
                }
            }
        }
        out.id = primary_id.cloned();
        out
    }

    /// Shapes a primary record for the mirror store (without an id).
    #[must_use]
    pub fn to_mirror(&self, record: &ContactRecord) -> ContactRecord {
        let mut out = self.normalize(record);
        for detail in &mut out.details {
            detail.meta.uri = detail.meta.uri.as_deref().map(|u| canonical_uri(u).to_string());
            for link in &mut detail.meta.linked_uris {
                *link = canonical_uri(link).to_string();
            }
        }
        out
    }

    /// Rewrites a privileged local avatar path to its mirror-accessible
    /// counterpart, hard-linking the file there.
    ///
    /// Returns `None` when the record has no avatar, the avatar is remote,
    /// or it does not live under the privileged segment.
    pub fn rewrite_avatar(&self, record: &mut ContactRecord) -> io::Result<Option<AvatarRewrite>> {
        let Some(original) = record.avatar_url().map(str::to_string) else {
            return Ok(None);
        };
        let Some((scheme, path)) = local_path(&original) else {
            return Ok(None);
        };
        if self.privileged_segment.is_empty() || !path.contains(&self.privileged_segment) {
            return Ok(None);
        }

        let target = path.replacen(&self.privileged_segment, "", 1);
        link_avatar(Path::new(path), Path::new(&target))?;
        let rewritten = format!("{scheme}{target}");
        debug!(from = %original, to = %rewritten, "rewrote avatar");

        for detail in &mut record.details {
            if let DetailValue::Avatar { image_url } = &mut detail.value {
                if *image_url == original {
                    image_url.clone_from(&rewritten);
                }
            }
        }
        Ok(Some(AvatarRewrite {
            rewritten,
            original,
        }))
    }
}
