//! Subcommands that talk to a configured store.

use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use reel_comments::{AuthorProfile, Comment, CommentId, CommentRepository, CommentSession};
use tracing::info;

/// Render one comment (and its replies) as indented text lines.
pub fn render(comment: &Comment) -> String {
    let mut out = format!(
        "{}  {} ({})  likes={} replies={}\n    {}\n",
        comment.created_at.format("%Y-%m-%d %H:%M"),
        comment.author_display_name,
        comment.id,
        comment.like_count,
        comment.reply_count,
        comment.text,
    );
    for reply in &comment.replies {
        out.push_str(&format!(
            "      > {} ({}): {}\n",
            reply.author_display_name, reply.id, reply.text
        ));
    }
    out
}

pub async fn count(repo: &CommentRepository, post_id: &str) -> Result<()> {
    println!("{}", repo.comment_count(post_id).await);
    Ok(())
}

pub async fn recount(repo: &CommentRepository, post_ids: &[String]) -> Result<()> {
    repo.counts()
        .batch_recompute(post_ids)
        .await
        .map_err(|e| miette::miette!("recount failed: {}", e))?;
    for post_id in post_ids {
        println!("{}\t{}", post_id, repo.comment_count(post_id).await);
    }
    Ok(())
}

pub async fn thread(repo: &CommentRepository, post_id: &str, pages: usize, fresh: bool) -> Result<()> {
    let page_size = repo.config().page_size;
    let mut cursor = None;

    for n in 1..=pages.max(1) {
        let page = repo
            .get_page(post_id, page_size, cursor.as_ref(), fresh)
            .await
            .map_err(|e| miette::miette!("failed to load page {}: {}", n, e))?;

        if n == 1 {
            println!("{} comments", page.total_count);
        }
        for comment in &page.comments {
            print!("{}", render(comment));
        }

        if !page.has_more {
            break;
        }
        cursor = page.next_cursor;
    }
    Ok(())
}

pub async fn post(
    repo: &CommentRepository,
    post_id: &str,
    text: &str,
    author_id: &str,
    author_name: &str,
    parent: Option<&str>,
) -> Result<()> {
    let author = AuthorProfile {
        id: author_id.to_string(),
        display_name: author_name.to_string(),
        avatar_url: None,
    };
    let parent = parent.map(CommentId::from);
    let comment = repo
        .add_comment(post_id, text, &author, parent.as_ref())
        .await
        .map_err(|e| miette::miette!("failed to post comment: {}", e))?;
    println!("{}", comment.id);
    Ok(())
}

pub async fn delete(repo: &CommentRepository, post_id: &str, comment_id: &str) -> Result<()> {
    repo.delete_comment(&CommentId::from(comment_id), post_id)
        .await
        .map_err(|e| miette::miette!("failed to delete comment: {}", e))
}

pub async fn like(repo: &CommentRepository, post_id: &str, comment_id: &str, undo: bool) -> Result<()> {
    let delta = if undo { -1 } else { 1 };
    let likes = repo
        .like_comment(&CommentId::from(comment_id), post_id, delta)
        .await
        .map_err(|e| miette::miette!("failed to update like: {}", e))?;
    println!("{}", likes);
    Ok(())
}

/// Print the thread, then reprint whenever it changes, until Ctrl-C.
pub async fn watch(repo: Arc<CommentRepository>, post_id: &str) -> Result<()> {
    let session = CommentSession::open(repo, post_id, None).await;
    let mut shown = None;
    let mut ticker = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c() => {
                info!(post_id, "interrupted");
                break;
            }
            _ = ticker.tick() => {
                let snapshot = session.snapshot().await;
                if shown.as_ref() == Some(&snapshot) {
                    continue;
                }
                println!("--- {} comments{}", snapshot.total_count, if snapshot.degraded { " (offline)" } else { "" });
                for comment in &snapshot.comments {
                    print!("{}", render(comment));
                }
                shown = Some(snapshot);
            }
        }
    }

    session.close().await;
    Ok(())
}
