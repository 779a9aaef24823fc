//! Roster Hydrator.
//!
//! Turns a [`Resolution`] into full [`Conversation`] records using exactly
//! one bulk conversation query and one bulk roster query, then overlays
//! profiles, partners and overview summaries.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::resolver::Resolution;
use crate::crypto::{decode_or_sentinel, ContentCipher};
use crate::error::Result;
use crate::identity::{IdentityCache, Profile};
use crate::messaging::preview;
use crate::model::{Conversation, LastMessage, Member, Partner, Role};
use crate::storage::{ChatBackend, ConversationRow, OverviewEntry};

/// `true` iff some member below admin has lost the posting right
pub fn derive_admin_only(members: &[Member]) -> bool {
    members.iter().any(|m| !m.role.is_admin() && !m.can_post)
}

/// Build the client-only record for an overview entry that has no
/// server-side membership. The result is read-only.
pub fn synthesize_placeholder(entry: &OverviewEntry, viewer: &str) -> Conversation {
    let mut members = vec![Member::new(&entry.conversation_id, viewer, Role::Member)];
    if let Some(partner) = &entry.partner {
        let mut member = Member::new(&entry.conversation_id, &partner.user_id, Role::Member);
        member.profile = Some(partner.profile.clone());
        members.push(member);
    }

    Conversation {
        id: entry.conversation_id.clone(),
        kind: entry.kind,
        name: entry.name.clone(),
        team_id: None,
        recruitment_id: None,
        admin_only: false,
        created_at: entry.created_at,
        archived: false,
        last_message: None,
        unread_count: entry.unread_count,
        members,
        partner: entry.partner.clone(),
        placeholder: true,
    }
}

/// Hydrates resolved conversation ids
pub struct RosterHydrator {
    backend: Arc<dyn ChatBackend>,
    identities: Arc<IdentityCache>,
    cipher: Arc<dyn ContentCipher>,
    preview_len: usize,
}

impl RosterHydrator {
    /// Create a hydrator
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        identities: Arc<IdentityCache>,
        cipher: Arc<dyn ContentCipher>,
        preview_len: usize,
    ) -> Self {
        Self {
            backend,
            identities,
            cipher,
            preview_len,
        }
    }

    /// Hydrate every id of `resolution`, in resolution order
    pub async fn hydrate(&self, viewer: &str, resolution: &Resolution) -> Result<Vec<Conversation>> {
        if resolution.ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = self.backend.conversations(&resolution.ids).await?;
        let roster = self.backend.rosters(&resolution.ids).await?;

        let rows: HashMap<String, ConversationRow> =
            rows.into_iter().map(|row| (row.id.clone(), row)).collect();
        let mut rosters: HashMap<String, Vec<Member>> = HashMap::new();
        for member in roster {
            rosters.entry(member.conversation_id.clone()).or_default().push(member);
        }

        // One profile lookup for everyone on every roster
        let user_ids: Vec<String> = {
            let mut seen = HashSet::new();
            rosters
                .values()
                .flatten()
                .filter(|m| seen.insert(m.user_id.as_str()))
                .map(|m| m.user_id.clone())
                .collect()
        };
        let profiles = self.identities.resolve_many(&user_ids).await;

        // An unrepaired id that still has a row yields both representations;
        // the deduplicator keeps the richer one
        let mut conversations = Vec::with_capacity(resolution.ids.len());
        for id in &resolution.ids {
            let entry = resolution.overview_entry(id);
            let mut representations = Vec::with_capacity(2);

            if let Some(entry) = entry.filter(|_| resolution.is_placeholder(id)) {
                representations.push(synthesize_placeholder(entry, viewer));
            }
            match (rows.get(id), entry) {
                (Some(row), _) => representations.push(self.from_row(
                    viewer,
                    row,
                    rosters.remove(id).unwrap_or_default(),
                    entry,
                    &profiles,
                )),
                (None, Some(entry)) if representations.is_empty() => {
                    representations.push(synthesize_placeholder(entry, viewer));
                }
                (None, Some(_)) => {}
                (None, None) => {
                    tracing::debug!("Dropping {}: no conversation row and no overview entry", id);
                    continue;
                }
            }

            for mut conversation in representations {
                if let Some(entry) = entry {
                    self.overlay_overview(&mut conversation, entry);
                }
                conversations.push(conversation);
            }
        }

        Ok(conversations)
    }

    fn from_row(
        &self,
        viewer: &str,
        row: &ConversationRow,
        mut members: Vec<Member>,
        entry: Option<&OverviewEntry>,
        profiles: &HashMap<String, Profile>,
    ) -> Conversation {
        for member in &mut members {
            member.profile = profiles.get(&member.user_id).cloned();
        }

        let mut partner = None;
        if row.kind.is_direct() {
            let overview_partner = entry.and_then(|e| e.partner.clone());

            // Roster may be stale right after creation
            if let Some(p) = &overview_partner {
                if !members.iter().any(|m| m.user_id == p.user_id) {
                    let mut member = Member::new(&row.id, &p.user_id, Role::Member);
                    member.profile = Some(p.profile.clone());
                    members.push(member);
                }
            }
            if !members.iter().any(|m| m.user_id == viewer) {
                let mut member = Member::new(&row.id, viewer, Role::Member);
                member.profile = profiles.get(viewer).cloned();
                members.push(member);
            }

            partner = members
                .iter()
                .find(|m| m.user_id != viewer)
                .map(|m| {
                    let profile = match (&m.profile, &overview_partner) {
                        (Some(profile), _) if !profile.name.is_empty() => profile.clone(),
                        (_, Some(p)) if p.user_id == m.user_id => p.profile.clone(),
                        (profile, _) => profile.clone().unwrap_or_default(),
                    };
                    Partner { user_id: m.user_id.clone(), profile }
                });
        }

        Conversation {
            id: row.id.clone(),
            kind: row.kind,
            name: row.name.clone(),
            team_id: row.team_id.clone(),
            recruitment_id: row.recruitment_id.clone(),
            admin_only: derive_admin_only(&members),
            created_at: row.created_at,
            archived: row.archived,
            last_message: None,
            unread_count: 0,
            members,
            partner,
            placeholder: false,
        }
    }

    fn overlay_overview(&self, conversation: &mut Conversation, entry: &OverviewEntry) {
        conversation.unread_count = entry.unread_count;
        conversation.last_message = entry.last_message.as_ref().map(|last| {
            let text = decode_or_sentinel(self.cipher.as_ref(), &last.message_id, &last.ciphertext);
            LastMessage {
                message_id: last.message_id.clone(),
                sender_id: last.sender_id.clone(),
                preview: preview(&text, self.preview_len),
                at: last.at,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AesContentCipher, PlainContentCipher, DECRYPTION_SENTINEL};
    use crate::model::ConversationKind;
    use crate::storage::{Database, OverviewLastMessage};
    use crate::sync::MembershipResolver;

    async fn database() -> Arc<Database> {
        let db = Database::open(None).await.unwrap();
        db.upsert_user("alice", "Alice", "alice", None).unwrap();
        db.upsert_user("bob", "Bob", "bob", Some("https://cdn/bob.png")).unwrap();
        db.upsert_user("carol", "Carol", "carol", None).unwrap();
        Arc::new(db)
    }

    fn hydrator(db: &Arc<Database>, cipher: Arc<dyn ContentCipher>) -> RosterHydrator {
        let identities = Arc::new(IdentityCache::new(db.clone()));
        RosterHydrator::new(db.clone(), identities, cipher, 10)
    }

    fn group(id: &str) -> ConversationRow {
        ConversationRow {
            id: id.into(),
            kind: ConversationKind::Group,
            name: Some("Hackathon".into()),
            team_id: None,
            recruitment_id: None,
            created_at: 1,
            archived: false,
        }
    }

    #[test]
    fn test_admin_only_derivation() {
        let owner = Member::new("c", "a", Role::Owner);
        let mut member = Member::new("c", "b", Role::Member);
        assert!(!derive_admin_only(&[owner.clone(), member.clone()]));

        member.can_post = false;
        assert!(derive_admin_only(&[owner.clone(), member]));

        let mut admin = Member::new("c", "c", Role::Admin);
        admin.can_post = false;
        assert!(!derive_admin_only(&[owner, admin]));
    }

    #[tokio::test]
    async fn test_hydrates_profiles_and_overview() {
        let db = database().await;
        db.create_conversation(&group("g1")).unwrap();
        db.add_member(&Member::new("g1", "alice", Role::Owner)).unwrap();
        db.add_member(&Member::new("g1", "bob", Role::Member)).unwrap();
        db.store_message(crate::storage::NewMessage {
            conversation_id: "g1".into(),
            sender_id: "bob".into(),
            ciphertext: "a rather long message body".into(),
            reply_to: None,
            forwarded_from: None,
        })
        .unwrap();

        let resolution = MembershipResolver::new(db.clone()).resolve("alice").await;
        let conversations = hydrator(&db, Arc::new(PlainContentCipher))
            .hydrate("alice", &resolution)
            .await
            .unwrap();

        assert_eq!(conversations.len(), 1);
        let conv = &conversations[0];
        assert_eq!(conv.members.len(), 2);
        assert_eq!(conv.member("bob").unwrap().profile.as_ref().unwrap().name, "Bob");
        assert_eq!(conv.unread_count, 1);
        assert_eq!(conv.last_message.as_ref().unwrap().preview, "a rather l…");
        assert!(!conv.admin_only);
        assert!(!conv.placeholder);
    }

    #[tokio::test]
    async fn test_direct_partner_overlay_when_roster_is_stale() {
        let db = database().await;
        db.create_conversation(&ConversationRow {
            id: "d1".into(),
            kind: ConversationKind::Direct,
            name: None,
            team_id: None,
            recruitment_id: None,
            created_at: 5,
            archived: false,
        })
        .unwrap();
        db.add_member(&Member::new("d1", "alice", Role::Member)).unwrap();
        // Partner row has not landed yet; overview already knows the partner
        db.upsert_overview(
            "alice",
            &OverviewEntry {
                conversation_id: "d1".into(),
                kind: ConversationKind::Direct,
                name: None,
                partner: Some(Partner {
                    user_id: "dave".into(),
                    profile: Profile { name: "Dave".into(), handle: "dave".into(), avatar: None },
                }),
                last_message: None,
                unread_count: 0,
                created_at: 5,
            },
        )
        .unwrap();

        let resolution = MembershipResolver::new(db.clone()).resolve("alice").await;
        let conversations = hydrator(&db, Arc::new(PlainContentCipher))
            .hydrate("alice", &resolution)
            .await
            .unwrap();

        let conv = &conversations[0];
        assert_eq!(conv.members.len(), 2);
        let partner = conv.partner.as_ref().unwrap();
        assert_eq!(partner.user_id, "dave");
        assert_eq!(partner.profile.name, "Dave");
        assert_eq!(conv.display_name(), "Dave");
    }

    fn stale_direct_entry(id: &str, partner: &str) -> OverviewEntry {
        OverviewEntry {
            conversation_id: id.into(),
            kind: ConversationKind::Direct,
            name: None,
            partner: Some(Partner {
                user_id: partner.into(),
                profile: Profile { name: partner.into(), handle: partner.into(), avatar: None },
            }),
            last_message: None,
            unread_count: 0,
            created_at: 1,
        }
    }

    #[tokio::test]
    async fn test_unrepaired_id_with_row_yields_both_representations() {
        let db = database().await;
        db.create_conversation(&group("g1")).unwrap();
        db.add_member(&Member::new("g1", "alice", Role::Owner)).unwrap();
        db.add_member(&Member::new("g1", "bob", Role::Member)).unwrap();

        let entry = stale_direct_entry("g1", "alice");
        let resolution = Resolution {
            ids: vec!["g1".into()],
            overview: vec![entry.clone()],
            placeholders: vec![entry],
            ..Default::default()
        };
        let conversations = hydrator(&db, Arc::new(PlainContentCipher))
            .hydrate("carol", &resolution)
            .await
            .unwrap();
        assert_eq!(conversations.len(), 2);
        assert!(conversations[0].placeholder);
        assert!(!conversations[1].placeholder);

        // The named group with its roster outscores the placeholder
        let kept = crate::sync::deduplicate(conversations);
        assert_eq!(kept.len(), 1);
        assert!(!kept[0].placeholder);
        assert_eq!(kept[0].kind, ConversationKind::Group);
        assert_eq!(kept[0].name.as_deref(), Some("Hackathon"));
    }

    #[tokio::test]
    async fn test_equally_rich_row_keeps_placeholder() {
        let db = database().await;
        db.create_conversation(&ConversationRow {
            id: "d2".into(),
            kind: ConversationKind::Direct,
            name: None,
            team_id: None,
            recruitment_id: None,
            created_at: 1,
            archived: false,
        })
        .unwrap();

        let entry = stale_direct_entry("d2", "bob");
        let resolution = Resolution {
            ids: vec!["d2".into()],
            overview: vec![entry.clone()],
            placeholders: vec![entry],
            ..Default::default()
        };
        let conversations = hydrator(&db, Arc::new(PlainContentCipher))
            .hydrate("alice", &resolution)
            .await
            .unwrap();
        let kept = crate::sync::deduplicate(conversations);
        assert_eq!(kept.len(), 1);
        assert!(kept[0].placeholder);
    }

    #[tokio::test]
    async fn test_placeholder_synthesis() {
        let entry = OverviewEntry {
            conversation_id: "d9".into(),
            kind: ConversationKind::Direct,
            name: None,
            partner: Some(Partner {
                user_id: "bob".into(),
                profile: Profile { name: "Bob".into(), handle: "bob".into(), avatar: None },
            }),
            last_message: None,
            unread_count: 3,
            created_at: 7,
        };
        let conv = synthesize_placeholder(&entry, "alice");
        assert!(conv.placeholder);
        assert_eq!(conv.members.len(), 2);
        assert!(conv.member("alice").is_some() && conv.member("bob").is_some());
        assert_eq!(conv.unread_count, 3);
    }

    #[tokio::test]
    async fn test_undecodable_preview_uses_sentinel() {
        let db = database().await;
        db.create_conversation(&group("g1")).unwrap();
        db.add_member(&Member::new("g1", "alice", Role::Owner)).unwrap();
        db.upsert_overview(
            "alice",
            &OverviewEntry {
                conversation_id: "g1".into(),
                kind: ConversationKind::Group,
                name: Some("Hackathon".into()),
                partner: None,
                last_message: Some(OverviewLastMessage {
                    message_id: "m1".into(),
                    sender_id: "bob".into(),
                    ciphertext: "not-a-valid-ciphertext".into(),
                    at: 9,
                }),
                unread_count: 1,
                created_at: 1,
            },
        )
        .unwrap();

        let resolution = MembershipResolver::new(db.clone()).resolve("alice").await;
        let conversations = hydrator(&db, Arc::new(AesContentCipher::new(b"k")))
            .hydrate("alice", &resolution)
            .await
            .unwrap();
        let last = conversations[0].last_message.as_ref().unwrap();
        assert_eq!(last.preview, preview(DECRYPTION_SENTINEL, 10));
    }
}
