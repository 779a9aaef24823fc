//! Membership Resolver.
//!
//! Produces the canonical set of conversation ids for a viewer from the
//! membership ledger and the overview feed, repairing two-party entries
//! that the ledger does not know about yet.
//!
//! Repair is bounded: each flagged entry gets one `ensure_direct_conversation`
//! call, and resolution restarts at most once.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::Error;
use crate::storage::{ChatBackend, MembershipRow, OverviewEntry};

/// Output of [`MembershipResolver::resolve`]
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Canonical ids: membership order first, then overview-only ids
    pub ids: Vec<String>,
    /// Ledger rows of the final pass
    pub memberships: Vec<MembershipRow>,
    /// Overview entries of the final pass
    pub overview: Vec<OverviewEntry>,
    /// Entries to show as client-only, read-only conversations
    pub placeholders: Vec<OverviewEntry>,
    /// `InconsistentMembership` for each entry repair could not fix
    pub unrepaired: Vec<Error>,
    /// `ensure_direct_conversation` calls made
    pub repairs_attempted: usize,
    /// Calls that succeeded
    pub repairs_succeeded: usize,
    /// Fetch passes made (1 or 2)
    pub passes: usize,
    /// Fetch failures; the caller should keep its prior state
    pub fetch_errors: Vec<Error>,
}

impl Resolution {
    /// The overview entry for a conversation
    pub fn overview_entry(&self, conversation_id: &str) -> Option<&OverviewEntry> {
        self.overview.iter().find(|e| e.conversation_id == conversation_id)
    }

    /// Whether `conversation_id` must be synthesized as a placeholder
    pub fn is_placeholder(&self, conversation_id: &str) -> bool {
        self.placeholders.iter().any(|e| e.conversation_id == conversation_id)
    }

    /// Number of entries left inconsistent
    pub fn inconsistencies(&self) -> usize {
        self.unrepaired.len()
    }
}

/// Resolves the viewer's conversation ids
pub struct MembershipResolver {
    backend: Arc<dyn ChatBackend>,
}

struct Fetched {
    memberships: Option<Vec<MembershipRow>>,
    overview: Option<Vec<OverviewEntry>>,
    errors: Vec<Error>,
}

impl MembershipResolver {
    /// Create a resolver over `backend`
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self { backend }
    }

    async fn fetch(&self, viewer: &str) -> Fetched {
        let mut errors = Vec::new();

        let memberships = match self.backend.memberships(viewer).await {
            Ok(rows) => Some(rows),
            Err(e) => {
                tracing::warn!("Membership fetch for {} failed: {}", viewer, e);
                errors.push(e);
                None
            }
        };

        let overview = match self.backend.overview(viewer).await {
            Ok(entries) => Some(entries),
            Err(e) => {
                tracing::warn!("Overview fetch for {} failed: {}", viewer, e);
                errors.push(e);
                None
            }
        };

        Fetched { memberships, overview, errors }
    }

    /// Resolve the viewer's conversations. Never fails; fetch problems are
    /// reported in [`Resolution::fetch_errors`].
    pub async fn resolve(&self, viewer: &str) -> Resolution {
        let mut resolution = Resolution::default();

        // First pass
        resolution.passes = 1;
        let first = self.fetch(viewer).await;
        let ledger_known = first.memberships.is_some();
        let mut memberships = first.memberships.unwrap_or_default();
        let mut overview = first.overview.unwrap_or_default();
        resolution.fetch_errors = first.errors;

        // Without the ledger every two-party entry would look inconsistent
        if ledger_known {
            let flagged = inconsistent(&memberships, &overview);
            for entry in &flagged {
                let Some(partner) = &entry.partner else {
                    continue;
                };
                resolution.repairs_attempted += 1;
                match self
                    .backend
                    .ensure_direct_conversation(viewer, &partner.user_id)
                    .await
                {
                    Ok(id) => {
                        resolution.repairs_succeeded += 1;
                        tracing::debug!(
                            "Repaired membership for {} (now {})",
                            entry.conversation_id,
                            id
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Skipping repair of {}: {}",
                            entry.conversation_id,
                            e
                        );
                    }
                }
            }

            // Second and final pass
            if resolution.repairs_succeeded > 0 {
                resolution.passes = 2;
                let second = self.fetch(viewer).await;
                match second.memberships {
                    Some(rows) => memberships = rows,
                    None => tracing::warn!("Keeping first-pass memberships for {}", viewer),
                }
                match second.overview {
                    Some(entries) => overview = entries,
                    None => tracing::warn!("Keeping first-pass overview for {}", viewer),
                }
            }

            for entry in inconsistent(&memberships, &overview) {
                resolution.unrepaired.push(Error::InconsistentMembership {
                    conversation_id: entry.conversation_id.clone(),
                });
                resolution.placeholders.push(entry);
            }
        }

        resolution.ids = union_ids(&memberships, &overview);
        resolution.memberships = memberships;
        resolution.overview = overview;

        tracing::debug!(
            "Resolved {} conversations for {} ({} passes, {} repairs, {} unrepaired)",
            resolution.ids.len(),
            viewer,
            resolution.passes,
            resolution.repairs_succeeded,
            resolution.unrepaired.len()
        );
        resolution
    }
}

/// Two-party overview entries with no ledger row
fn inconsistent(memberships: &[MembershipRow], overview: &[OverviewEntry]) -> Vec<OverviewEntry> {
    let known: HashSet<&str> = memberships.iter().map(|m| m.conversation_id.as_str()).collect();
    overview
        .iter()
        .filter(|e| e.is_two_party() && !known.contains(e.conversation_id.as_str()))
        .cloned()
        .collect()
}

fn union_ids(memberships: &[MembershipRow], overview: &[OverviewEntry]) -> Vec<String> {
    let mut seen = HashSet::new();
    memberships
        .iter()
        .map(|m| &m.conversation_id)
        .chain(overview.iter().map(|e| &e.conversation_id))
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}
