//! Typed contact details.
//!
//! A contact record is an unordered collection of details. Each detail has a
//! kind-specific payload ([`DetailValue`]) and store bookkeeping
//! ([`DetailMeta`]): a detail uri that stays stable across edits, the uris of
//! sibling details it links to, and a provenance tag naming the source that
//! last wrote it.

use crate::HybridTimestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The closed set of detail kinds a contact record may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailKind {
    Name,
    Nickname,
    PhoneNumber,
    EmailAddress,
    Address,
    Url,
    Note,
    Birthday,
    Organization,
    Avatar,
    Presence,
    GlobalPresence,
    OnlineAccount,
    OriginMetadata,
    DisplayLabel,
    Deactivated,
    StatusFlags,
    Guid,
    SyncTarget,
    Timestamp,
}

impl DetailKind {
    /// Every kind, in declaration order.
    pub const ALL: [DetailKind; 20] = [
        DetailKind::Name,
        DetailKind::Nickname,
        DetailKind::PhoneNumber,
        DetailKind::EmailAddress,
        DetailKind::Address,
        DetailKind::Url,
        DetailKind::Note,
        DetailKind::Birthday,
        DetailKind::Organization,
        DetailKind::Avatar,
        DetailKind::Presence,
        DetailKind::GlobalPresence,
        DetailKind::OnlineAccount,
        DetailKind::OriginMetadata,
        DetailKind::DisplayLabel,
        DetailKind::Deactivated,
        DetailKind::StatusFlags,
        DetailKind::Guid,
        DetailKind::SyncTarget,
        DetailKind::Timestamp,
    ];

    const fn bit(self) -> u32 {
        1 << (self as u32)
    }

    /// Stable snake_case name, matching the serialized form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            DetailKind::Name => "name",
            DetailKind::Nickname => "nickname",
            DetailKind::PhoneNumber => "phone_number",
            DetailKind::EmailAddress => "email_address",
            DetailKind::Address => "address",
            DetailKind::Url => "url",
            DetailKind::Note => "note",
            DetailKind::Birthday => "birthday",
            DetailKind::Organization => "organization",
            DetailKind::Avatar => "avatar",
            DetailKind::Presence => "presence",
            DetailKind::GlobalPresence => "global_presence",
            DetailKind::OnlineAccount => "online_account",
            DetailKind::OriginMetadata => "origin_metadata",
            DetailKind::DisplayLabel => "display_label",
            DetailKind::Deactivated => "deactivated",
            DetailKind::StatusFlags => "status_flags",
            DetailKind::Guid => "guid",
            DetailKind::SyncTarget => "sync_target",
            DetailKind::Timestamp => "timestamp",
        }
    }
}

impl fmt::Display for DetailKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetailKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DetailKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| crate::Error::UnknownDetailKind(s.to_string()))
    }
}

/// A set of detail kinds, usable in `const` context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DetailKindSet(u32);

impl DetailKindSet {
    /// The empty set.
    pub const EMPTY: Self = Self(0);

    /// Builds a set from a slice of kinds.
    #[must_use]
    pub const fn of(kinds: &[DetailKind]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < kinds.len() {
            bits |= kinds[i].bit();
            i += 1;
        }
        Self(bits)
    }

    /// Returns true if `kind` is in the set.
    #[must_use]
    pub const fn contains(self, kind: DetailKind) -> bool {
        self.0 & kind.bit() != 0
    }

    /// Returns the union of both sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns the kinds in `self` that are not in `other`.
    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Returns true if the set is empty.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if every kind in `self` is also in `other`.
    #[must_use]
    pub const fn is_subset(self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    /// Raw bit representation, for persistence.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Rebuilds a set from [`bits`](Self::bits), dropping unknown bits.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & ((1 << DetailKind::ALL.len()) - 1))
    }

    /// Adds a kind to the set.
    pub fn insert(&mut self, kind: DetailKind) {
        self.0 |= kind.bit();
    }

    /// Iterates over the kinds in the set, in declaration order.
    pub fn iter(self) -> impl Iterator<Item = DetailKind> {
        DetailKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl FromIterator<DetailKind> for DetailKindSet {
    fn from_iter<I: IntoIterator<Item = DetailKind>>(iter: I) -> Self {
        let mut set = Self::EMPTY;
        for kind in iter {
            set.insert(kind);
        }
        set
    }
}

/// Reachability as reported by an IM account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    #[default]
    Unknown,
    Available,
    Away,
    ExtendedAway,
    Busy,
    Hidden,
    Offline,
}

/// Kind-specific payload of a detail.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetailValue {
    Name {
        #[serde(default)]
        given: String,
        #[serde(default)]
        family: String,
    },
    Nickname {
        nickname: String,
    },
    PhoneNumber {
        number: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        sub_types: Vec<String>,
    },
    EmailAddress {
        address: String,
    },
    Address {
        #[serde(default)]
        street: String,
        #[serde(default)]
        locality: String,
        #[serde(default)]
        country: String,
    },
    Url {
        url: String,
    },
    Note {
        text: String,
    },
    Birthday {
        /// ISO-8601 calendar date.
        date: String,
    },
    Organization {
        #[serde(default)]
        name: String,
        #[serde(default)]
        title: String,
    },
    Avatar {
        /// Either a bare filesystem path, a `file://` url, or a remote url.
        image_url: String,
    },
    Presence {
        state: PresenceState,
        #[serde(default)]
        message: String,
    },
    GlobalPresence {
        state: PresenceState,
        #[serde(default)]
        message: String,
    },
    OnlineAccount {
        account_uri: String,
        #[serde(default)]
        service_provider: String,
    },
    OriginMetadata {
        id: String,
        #[serde(default)]
        group_id: String,
        #[serde(default)]
        enabled: bool,
    },
    DisplayLabel {
        label: String,
    },
    Deactivated,
    StatusFlags {
        flags: u32,
    },
    Guid {
        guid: String,
    },
    SyncTarget {
        label: String,
    },
    Timestamp {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        created: Option<HybridTimestamp>,
        modified: HybridTimestamp,
    },
}

impl DetailValue {
    /// Returns the kind of this payload.
    #[must_use]
    pub const fn kind(&self) -> DetailKind {
        match self {
            DetailValue::Name { .. } => DetailKind::Name,
            DetailValue::Nickname { .. } => DetailKind::Nickname,
            DetailValue::PhoneNumber { .. } => DetailKind::PhoneNumber,
            DetailValue::EmailAddress { .. } => DetailKind::EmailAddress,
            DetailValue::Address { .. } => DetailKind::Address,
            DetailValue::Url { .. } => DetailKind::Url,
            DetailValue::Note { .. } => DetailKind::Note,
            DetailValue::Birthday { .. } => DetailKind::Birthday,
            DetailValue::Organization { .. } => DetailKind::Organization,
            DetailValue::Avatar { .. } => DetailKind::Avatar,
            DetailValue::Presence { .. } => DetailKind::Presence,
            DetailValue::GlobalPresence { .. } => DetailKind::GlobalPresence,
            DetailValue::OnlineAccount { .. } => DetailKind::OnlineAccount,
            DetailValue::OriginMetadata { .. } => DetailKind::OriginMetadata,
            DetailValue::DisplayLabel { .. } => DetailKind::DisplayLabel,
            DetailValue::Deactivated => DetailKind::Deactivated,
            DetailValue::StatusFlags { .. } => DetailKind::StatusFlags,
            DetailValue::Guid { .. } => DetailKind::Guid,
            DetailValue::SyncTarget { .. } => DetailKind::SyncTarget,
            DetailValue::Timestamp { .. } => DetailKind::Timestamp,
        }
    }
}

/// Store bookkeeping attached to a detail.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DetailMeta {
    /// Stable handle for this detail within its store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Uris of sibling details this one refers to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub linked_uris: Vec<String>,
    /// Which external source last wrote this detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
}

/// A single typed field of a contact record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Detail {
    pub value: DetailValue,
    #[serde(default)]
    pub meta: DetailMeta,
}

impl Detail {
    /// Creates a detail without any bookkeeping.
    #[must_use]
    pub fn new(value: DetailValue) -> Self {
        Self {
            value,
            meta: DetailMeta::default(),
        }
    }

    /// Sets the detail uri.
    #[must_use]
    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.meta.uri = Some(uri.into());
        self
    }

    /// Adds a link to a sibling detail.
    #[must_use]
    pub fn with_linked_uri(mut self, uri: impl Into<String>) -> Self {
        self.meta.linked_uris.push(uri.into());
        self
    }

    /// Sets the provenance tag.
    #[must_use]
    pub fn with_provenance(mut self, provenance: impl Into<String>) -> Self {
        self.meta.provenance = Some(provenance.into());
        self
    }

    /// Returns the kind of this detail.
    #[must_use]
    pub const fn kind(&self) -> DetailKind {
        self.value.kind()
    }

    /// Compares payloads only, ignoring uri, links and provenance.
    #[must_use]
    pub fn same_content(&self, other: &Detail) -> bool {
        self.value == other.value
    }
}

impl From<DetailValue> for Detail {
    fn from(value: DetailValue) -> Self {
        Self::new(value)
    }
}
