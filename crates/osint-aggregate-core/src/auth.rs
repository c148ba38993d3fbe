//! Caller identity and the authorization collaborator.
//!
//! The engine never decides permissions itself. Every per-item check in a
//! bulk operation asks an [`Authorizer`]; items the caller may not modify are
//! skipped silently while the rest of the operation proceeds.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::models::Voter;

/// Who is calling into the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Identity {
    /// A local analyst.
    User { id: i64 },
    /// A peer node pushing records through remote sync.
    Remote { node_id: i64, name: String },
    /// Bots and maintenance jobs. Bypasses per-item checks and cannot vote.
    System,
}

impl Identity {
    pub fn user(id: i64) -> Self {
        Self::User { id }
    }

    /// The vote-ledger key for this identity, if it may vote.
    pub fn voter(&self) -> Option<Voter> {
        match self {
            Self::User { id } => Some(Voter::User(*id)),
            Self::Remote { node_id, .. } => Some(Voter::Remote(*node_id)),
            Self::System => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    See,
    Access,
    Modify,
}

/// What a permission check is about.
#[derive(Debug, Clone)]
pub struct AclSubject<'a> {
    pub news_item_id: i64,
    pub news_item_aggregate_id: i64,
    pub osint_source_id: Option<&'a str>,
}

/// Answers whether an identity may see, access, or modify an item.
pub trait Authorizer: Send + Sync {
    fn allowed(&self, identity: &Identity, subject: &AclSubject<'_>, permission: Permission) -> bool;

    /// True when [`allowed`](Self::allowed) never refuses. Lets stores skip
    /// per-item checks and page in the database.
    fn grants_everything(&self) -> bool {
        false
    }
}

/// Grants everything. The default for single-analyst deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn allowed(&self, _identity: &Identity, _subject: &AclSubject<'_>, _permission: Permission) -> bool {
        true
    }

    fn grants_everything(&self) -> bool {
        true
    }
}

/// One ACL row: users granted a set of permissions on a source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceAclEntry {
    pub source_id: String,
    #[serde(default)]
    pub users: BTreeSet<i64>,
    #[serde(default)]
    pub see: bool,
    #[serde(default)]
    pub access: bool,
    #[serde(default)]
    pub modify: bool,
}

/// Source-scoped ACL.
///
/// A source without entries is open to everyone. Once a source has entries,
/// a user needs an entry listing them that grants the permission. Remote
/// identities are always allowed; remote data is owned by its node.
#[derive(Debug, Clone, Default)]
pub struct SourceAcl {
    entries: HashMap<String, Vec<SourceAclEntry>>,
}

impl SourceAcl {
    pub fn new(entries: impl IntoIterator<Item = SourceAclEntry>) -> Self {
        let mut by_source: HashMap<String, Vec<SourceAclEntry>> = HashMap::new();
        for entry in entries {
            by_source.entry(entry.source_id.clone()).or_default().push(entry);
        }
        Self { entries: by_source }
    }
}

impl Authorizer for SourceAcl {
    fn allowed(&self, identity: &Identity, subject: &AclSubject<'_>, permission: Permission) -> bool {
        let user_id = match identity {
            Identity::User { id } => *id,
            Identity::Remote { .. } | Identity::System => return true,
        };
        let Some(entries) = subject.osint_source_id.and_then(|s| self.entries.get(s)) else {
            return true;
        };
        entries.iter().any(|e| {
            e.users.contains(&user_id)
                && match permission {
                    Permission::See => e.see,
                    Permission::Access => e.access,
                    Permission::Modify => e.modify,
                }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject(source: Option<&str>) -> AclSubject<'_> {
        AclSubject {
            news_item_id: 1,
            news_item_aggregate_id: 1,
            osint_source_id: source,
        }
    }

    #[test]
    fn test_only_allow_all_grants_everything() {
        assert!(AllowAll.grants_everything());
        assert!(!SourceAcl::new(vec![]).grants_everything());
    }

    #[test]
    fn test_source_without_entries_is_open() {
        let acl = SourceAcl::new(vec![]);
        assert!(acl.allowed(&Identity::user(7), &subject(Some("s1")), Permission::Modify));
    }

    #[test]
    fn test_entry_restricts_to_listed_users() {
        let acl = SourceAcl::new(vec![SourceAclEntry {
            source_id: "s1".into(),
            users: [1].into_iter().collect(),
            see: true,
            access: true,
            modify: false,
        }]);
        assert!(acl.allowed(&Identity::user(1), &subject(Some("s1")), Permission::See));
        assert!(!acl.allowed(&Identity::user(1), &subject(Some("s1")), Permission::Modify));
        assert!(!acl.allowed(&Identity::user(2), &subject(Some("s1")), Permission::See));
        assert!(acl.allowed(&Identity::user(2), &subject(Some("s2")), Permission::See));
    }

    #[test]
    fn test_system_and_remote_bypass() {
        let acl = SourceAcl::new(vec![SourceAclEntry {
            source_id: "s1".into(),
            ..Default::default()
        }]);
        assert!(acl.allowed(&Identity::System, &subject(Some("s1")), Permission::Modify));
        let remote = Identity::Remote {
            node_id: 3,
            name: "peer".into(),
        };
        assert!(acl.allowed(&remote, &subject(Some("s1")), Permission::Modify));
    }

    #[test]
    fn test_voter_mapping() {
        assert_eq!(Identity::user(4).voter(), Some(Voter::User(4)));
        assert_eq!(Identity::System.voter(), None);
    }
}
