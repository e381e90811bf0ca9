//! Walk-through of a comment session against a seeded in-memory store.

use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use reel_comments::{
    AuthorProfile, CommentRepository, CommentSession, CommentsConfig, PageCache, SessionSnapshot,
};
use reel_store::{Fault, MemoryStore, Operation};
use tracing::info;

use crate::commands::render;

const POST: &str = "demo-post";

fn profile(id: &str, name: &str) -> AuthorProfile {
    AuthorProfile {
        id: id.to_string(),
        display_name: name.to_string(),
        avatar_url: None,
    }
}

fn print_snapshot(title: &str, snapshot: &SessionSnapshot) {
    println!(
        "== {} ({} shown, {} total{}{})",
        title,
        snapshot.comments.len(),
        snapshot.total_count,
        if snapshot.has_more { ", more available" } else { "" },
        if snapshot.degraded { ", offline" } else { "" },
    );
    if let Some(error) = &snapshot.error {
        println!("!! {}", error);
    }
    for comment in &snapshot.comments {
        print!("{}", render(comment));
    }
}

fn err(e: impl std::fmt::Display) -> miette::Report {
    miette::miette!("{}", e)
}

pub async fn run(mut config: CommentsConfig, offline: bool) -> Result<()> {
    config.page_size = config.page_size.min(3);
    config.delete_settle_ms = config.delete_settle_ms.min(100);

    let store = Arc::new(MemoryStore::new());
    // A second client on the same backend, with its own cache.
    let friend = CommentRepository::new(
        store.clone(),
        PageCache::new(config.cache_ttl()),
        config.clone(),
    );
    let repo = Arc::new(CommentRepository::new(
        store.clone(),
        PageCache::new(config.cache_ttl()),
        config,
    ));

    let alex = profile("u-alex", "Alex");
    let sam = profile("u-sam", "Sam");

    for text in ["First!", "Love the transition at 0:12", "What song is this?", "Saved for later"] {
        friend.add_comment(POST, text, &sam, None).await.map_err(err)?;
    }
    info!(post_id = POST, "seeded demo thread");

    if offline {
        store.fail_next(Operation::Query, Fault::Unavailable);
    }

    let session = CommentSession::open(repo, POST, Some(alex)).await;
    print_snapshot("opened", &session.snapshot().await);

    if session.snapshot().await.degraded {
        session.refresh_comments().await;
        print_snapshot("after pull to refresh", &session.snapshot().await);
    }

    let mine = session.add_comment("This is great", None).await;
    print_snapshot("posted", &session.snapshot().await);

    friend
        .add_comment(POST, "Agreed, watched it three times", &sam, None)
        .await
        .map_err(err)?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    print_snapshot("realtime comment from Sam", &session.snapshot().await);

    session.load_more_comments().await;
    print_snapshot("loaded more", &session.snapshot().await);

    if let Some(mine) = mine {
        session.like_comment(&mine.id).await.map_err(err)?;
        session.add_comment("Thanks!", Some(&mine.id)).await;
        print_snapshot("liked and replied", &session.snapshot().await);

        session.delete_comment(&mine.id).await.map_err(err)?;
        print_snapshot("deleted", &session.snapshot().await);
    }

    session.close().await;
    Ok(())
}
