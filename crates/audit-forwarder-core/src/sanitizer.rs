// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Record filtering and field redaction.
//!
//! A [`Policy`] decides, per event kind, whether a record is forwarded at all
//! and whether it is redacted down to [`AUTHORIZED_KEYS`]. The [`Sanitizer`]
//! applies a policy without side effects and is safe to share across tasks.

use serde_json::{Map, Value};
use std::collections::HashSet;

/// Fields that survive redaction.
pub const AUTHORIZED_KEYS: &[&str] = &[
    "id",
    "type",
    "field_name",
    "public",
    "created_at",
    "author_id",
    "comment_id",
    "attachment_id",
    "trusted",
    "recipients",
    "via",
    "score",
    "agreement_id",
    "action",
    "message",
    "direct_message",
    "page",
    "communication",
    "ticket_via",
    "graph_object_id",
    "resource",
];

/// Field carrying the kind of a ticket audit event.
pub const TICKET_EVENT_KIND_FIELD: &str = "type";
/// Field carrying the kind of an account audit log record.
pub const AUDIT_LOG_KIND_FIELD: &str = "source_type";

const ALL_TOKEN: &str = "All";
const NONE_TOKEN: &str = "None";

/// A set of event kinds, with the two wildcard forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKinds {
    All,
    None,
    Only(HashSet<String>),
}

impl EventKinds {
    /// Builds a kind set from configuration tokens. `None` wins over `All`
    /// when both appear; blank tokens are ignored.
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let kinds: HashSet<String> = tokens
            .into_iter()
            .map(|t| t.as_ref().trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        if kinds.contains(NONE_TOKEN) {
            Self::None
        } else if kinds.contains(ALL_TOKEN) {
            Self::All
        } else {
            Self::Only(kinds)
        }
    }

    /// Comma-separated form used by environment variables.
    pub fn parse(value: &str) -> Self {
        Self::from_tokens(value.split(','))
    }

    fn matches(&self, kind: Option<&str>) -> bool {
        match self {
            Self::All => true,
            Self::None => false,
            Self::Only(kinds) => kind.is_some_and(|k| kinds.contains(k)),
        }
    }
}

/// Which kinds are forwarded and which of those are redacted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub forwarded: EventKinds,
    pub redacted: EventKinds,
}

impl Policy {
    #[must_use]
    pub fn new(forwarded: EventKinds, redacted: EventKinds) -> Self {
        Self {
            forwarded,
            redacted,
        }
    }

    /// Forward everything untouched.
    #[must_use]
    pub fn pass_through() -> Self {
        Self::new(EventKinds::All, EventKinds::None)
    }
}

#[derive(Debug, Clone)]
pub struct Sanitizer {
    policy: Policy,
    kind_field: &'static str,
}

impl Sanitizer {
    #[must_use]
    pub fn new(policy: Policy, kind_field: &'static str) -> Self {
        Self { policy, kind_field }
    }

    /// Returns the filtered record, or `None` when the policy drops it.
    #[must_use]
    pub fn sanitize(&self, mut record: Map<String, Value>) -> Option<Map<String, Value>> {
        let kind = record.get(self.kind_field).and_then(Value::as_str);

        if !self.policy.forwarded.matches(kind) {
            return None;
        }
        if self.policy.redacted.matches(kind) {
            let kind_field = self.kind_field;
            record.retain(|key, _| key == kind_field || AUTHORIZED_KEYS.contains(&key.as_str()));
        }
        Some(record)
    }

    /// Sanitizes every element of a ticket audit's `events` array, removing
    /// the dropped ones. The audit envelope itself is left as is.
    #[must_use]
    pub fn sanitize_ticket_audit(&self, mut audit: Value) -> Value {
        if let Some(events) = audit.get_mut("events").and_then(Value::as_array_mut) {
            let sanitized = std::mem::take(events)
                .into_iter()
                .filter_map(|event| match event {
                    Value::Object(map) => self.sanitize(map).map(Value::Object),
                    // Without a kind only an unconditional policy can keep it
                    other => (self.policy.forwarded == EventKinds::All
                        && self.policy.redacted == EventKinds::None)
                        .then_some(other),
                })
                .collect();
            *events = sanitized;
        }
        audit
    }
}
