//! # Sync Engine Demo
//!
//! Runs two sessions against one in-memory backend:
//! 1. Seeds a group and two users
//! 2. Alice and Bob start their sessions and load their lists
//! 3. Alice sends; Bob's list picks it up through the realtime feed
//! 4. Bob opens the group, replies, and reacts
//! 5. Alice restricts posting and Bob's next send is rejected locally
//!
//! ## Run
//!
//! ```bash
//! RUST_LOG=quad_core=debug cargo run --example sync_demo
//! ```

use std::sync::Arc;
use std::time::Duration;

use quad_core::model::{ConversationKind, Member, Role};
use quad_core::storage::ConversationRow;
use quad_core::{
    AesContentCipher, ChatSession, Database, IdentityCache, LocalChangeFeed, Services, SyncConfig,
};

const SECRET: &[u8] = b"quad demo session secret";

fn session(db: &Arc<Database>, feed: &Arc<LocalChangeFeed>, viewer: &str) -> ChatSession {
    let services = Services::new(
        db.clone(),
        feed.clone(),
        Arc::new(AesContentCipher::new(SECRET)),
        Arc::new(IdentityCache::new(db.clone())),
    );
    ChatSession::new(viewer, SyncConfig::default(), services)
}

fn print_list(label: &str, session: &ChatSession) {
    println!("   {}'s conversations:", label);
    for conversation in session.conversations() {
        let preview = conversation
            .last_message
            .as_ref()
            .map(|m| m.preview.clone())
            .unwrap_or_else(|| "(no messages)".into());
        println!(
            "   - {:<12} unread={} last={:?}",
            conversation.display_name(),
            conversation.unread_count,
            preview
        );
    }
    println!();
}

async fn wait_for_timers() {
    tokio::time::sleep(Duration::from_millis(250)).await;
}

#[tokio::main]
async fn main() -> quad_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quad_core=info".into()),
        )
        .init();

    println!("=================================================");
    println!("            QUAD SYNC ENGINE DEMO");
    println!("=================================================\n");

    // =========================================================================
    // STEP 1: Seed the backend
    // =========================================================================
    println!("1. Seeding users and the Robotics group...\n");

    let feed = Arc::new(LocalChangeFeed::new());
    let db = Arc::new(Database::open(None).await?.with_change_feed(feed.clone()));
    db.upsert_user("alice", "Alice", "alice", None)?;
    db.upsert_user("bob", "Bob", "bob", None)?;
    db.create_conversation(&ConversationRow {
        id: "robotics".into(),
        kind: ConversationKind::Group,
        name: Some("Robotics".into()),
        team_id: None,
        recruitment_id: None,
        created_at: 0,
        archived: false,
    })?;
    db.add_member(&Member::new("robotics", "alice", Role::Owner))?;
    db.add_member(&Member::new("robotics", "bob", Role::Member))?;

    // =========================================================================
    // STEP 2: Start both sessions
    // =========================================================================
    println!("2. Starting sessions...\n");

    let alice = session(&db, &feed, "alice");
    let bob = session(&db, &feed, "bob");
    alice.start().await?;
    bob.start().await?;
    print_list("Bob", &bob);

    // =========================================================================
    // STEP 3: Alice sends, Bob's list follows
    // =========================================================================
    println!("3. Alice sends a message...\n");

    alice.send_message("robotics", "Build night is Thursday", None).await?;
    wait_for_timers().await;
    print_list("Bob", &bob);

    // =========================================================================
    // STEP 4: Bob opens the thread, replies and reacts
    // =========================================================================
    println!("4. Bob opens the group and replies...\n");

    bob.open_conversation("robotics").await?;
    let first = bob
        .messages("robotics")
        .first()
        .map(|m| m.id.as_str().to_string())
        .unwrap_or_default();
    bob.send_message("robotics", "I'll bring the soldering kit", Some(first.as_str())).await?;
    bob.toggle_reaction(&first, "👍").await?;
    wait_for_timers().await;

    for message in bob.messages("robotics") {
        println!(
            "   [{}] {}: {} {:?}",
            message.created_at,
            message.sender.as_ref().map(|p| p.name.as_str()).unwrap_or("?"),
            message.text,
            message.reactions.iter().map(|r| r.symbol.as_str()).collect::<Vec<_>>()
        );
    }
    println!();
    print_list("Alice", &alice);

    // =========================================================================
    // STEP 5: Posting restrictions are enforced before any network call
    // =========================================================================
    println!("5. Alice restricts Bob's posting...\n");

    alice.set_member_posting("robotics", "bob", false).await?;
    wait_for_timers().await;
    match bob.send_message("robotics", "Can I still post?", None).await {
        Ok(_) => println!("   Unexpected: Bob's message went through"),
        Err(e) => println!("   Rejected locally: {} (code {})", e, e.code()),
    }
    println!();

    alice.shutdown();
    bob.shutdown();

    println!("=================================================");
    println!("                 DEMO COMPLETE");
    println!("=================================================");
    Ok(())
}
