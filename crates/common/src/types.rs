// Core domain types shared across all formsync crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::patch::ListPatch;

/// Access level granted by a capability token or an access-list entry.
///
/// Levels are totally ordered: `Admin > Edit > View > None`. A
/// required-level check passes when the granted level is a member of
/// the required set (see [`AccessLevel::EDIT_LEVELS`] and
/// [`AccessLevel::VIEW_LEVELS`]).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Admin,
    Edit,
    View,
    None,
}

impl AccessLevel {
    /// Levels that may submit edits.
    pub const EDIT_LEVELS: &'static [AccessLevel] = &[AccessLevel::Admin, AccessLevel::Edit];

    /// Levels that may subscribe to live updates.
    pub const VIEW_LEVELS: &'static [AccessLevel] =
        &[AccessLevel::Admin, AccessLevel::Edit, AccessLevel::View];

    fn rank(self) -> u8 {
        match self {
            AccessLevel::Admin => 3,
            AccessLevel::Edit => 2,
            AccessLevel::View => 1,
            AccessLevel::None => 0,
        }
    }

    /// Whether this level grants at least `required`.
    pub fn allows(self, required: AccessLevel) -> bool {
        self.rank() >= required.rank()
    }
}

/// Kind of resource a capability token is scoped to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Form,
    Response,
}

/// One entry in a document's access list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessGrant {
    pub user_id: Uuid,
    pub level: AccessLevel,
}

/// A single question on a form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormItem {
    pub question: String,
    #[serde(rename = "type")]
    pub item_type: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub required: bool,
    /// Indices into the form's attached file list.
    #[serde(default)]
    pub files: Vec<i64>,
}

/// A file attached to a form or response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileAttachment {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub width: i64,
    #[serde(default)]
    pub height: i64,
    #[serde(rename = "type")]
    pub file_type: String,
    #[serde(default)]
    pub original_src: String,
    #[serde(default)]
    pub blur_src: String,
    #[serde(default)]
    pub placeholder_src: String,
}

/// The authoritative form document held by the primary datastore.
///
/// Mutated only by the flush scheduler applying queued patches, or by
/// direct scalar field replace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormDocument {
    pub id: Uuid,
    pub owner: Uuid,
    pub name: String,
    #[serde(default)]
    pub items: Vec<FormItem>,
    #[serde(default)]
    pub multiple: bool,
    pub public: AccessLevel,
    #[serde(default)]
    pub access: Vec<AccessGrant>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub files: Vec<FileAttachment>,
    /// Number of responses submitted against this form.
    #[serde(default)]
    pub responses: i64,
    pub updated: DateTime<Utc>,
}

/// A batch of named-field updates plus ordered-list patches for one
/// document, as submitted by a client.
///
/// Scalar fields are last-writer-wins; `items` and `files` carry
/// positional patches applied in order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EditRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiple: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<AccessLevel>,
    /// Net change to the response count (response submission/deletion).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responses_delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<ListPatch<FormItem>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<ListPatch<FileAttachment>>,
}

impl EditRequest {
    /// True when the request carries no field updates at all.
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.multiple.is_none()
            && self.public.is_none()
            && self.responses_delta.is_none()
            && self.items.is_empty()
            && self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_level_ordering() {
        assert!(AccessLevel::Admin.allows(AccessLevel::Edit));
        assert!(AccessLevel::Edit.allows(AccessLevel::Edit));
        assert!(!AccessLevel::View.allows(AccessLevel::Edit));
        assert!(AccessLevel::View.allows(AccessLevel::View));
        assert!(!AccessLevel::None.allows(AccessLevel::View));
    }

    #[test]
    fn edit_levels_exclude_view() {
        assert!(AccessLevel::EDIT_LEVELS.contains(&AccessLevel::Admin));
        assert!(AccessLevel::EDIT_LEVELS.contains(&AccessLevel::Edit));
        assert!(!AccessLevel::EDIT_LEVELS.contains(&AccessLevel::View));
        assert!(AccessLevel::VIEW_LEVELS.contains(&AccessLevel::View));
    }

    #[test]
    fn access_level_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&AccessLevel::Admin).unwrap(), "\"admin\"");
        assert_eq!(
            serde_json::from_str::<AccessLevel>("\"view\"").unwrap(),
            AccessLevel::View
        );
    }

    #[test]
    fn empty_edit_request_reports_empty() {
        assert!(EditRequest::default().is_empty());

        let named = EditRequest { name: Some("renamed".into()), ..Default::default() };
        assert!(!named.is_empty());
    }

    #[test]
    fn edit_request_rejects_unknown_fields() {
        let raw = serde_json::json!({ "name": "ok", "owner": "someone-else" });
        assert!(serde_json::from_value::<EditRequest>(raw).is_err());
    }
}
