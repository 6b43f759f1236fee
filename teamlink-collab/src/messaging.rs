//! Chat messages and inline code comments.
//!
//! Both are optimistic: the local copy is recorded and announced before the
//! frame reaches the relay. History is kept in memory for the current
//! session only.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::CollabConfig;
use crate::error::CollabError;
use crate::events::{CollabEvent, EventBus};
use crate::model::{Comment, CommentReply, DocumentUri, Message, Range};
use crate::protocol::OutboundFrame;
use crate::session::SessionView;
use crate::transport::Outbox;

/// Bounded, id-deduplicated chat history. Oldest first.
#[derive(Debug)]
struct MessageLog {
    messages: VecDeque<Message>,
    limit: usize,
}

impl MessageLog {
    fn new(limit: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    fn record(&mut self, message: Message) -> bool {
        if self.messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        if self.messages.len() == self.limit {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
        true
    }

    /// Newest-last slice of the history, filtered by `before` and capped at
    /// `limit` most recent entries.
    fn query(&self, limit: Option<usize>, before: Option<u64>) -> Vec<Message> {
        let matching: Vec<&Message> = self
            .messages
            .iter()
            .filter(|m| before.map_or(true, |cutoff| m.timestamp < cutoff))
            .collect();
        let skip = limit.map_or(0, |n| matching.len().saturating_sub(n));
        matching.into_iter().skip(skip).cloned().collect()
    }
}

#[derive(Debug, Clone)]
pub struct Messaging {
    view: SessionView,
    outbox: Outbox,
    events: EventBus,
    history: Arc<RwLock<MessageLog>>,
    /// Comments in arrival order
    comments: Arc<RwLock<Vec<Comment>>>,
    chat_enabled: bool,
    comments_enabled: bool,
    show_resolved: bool,
}

impl Messaging {
    pub fn new(view: SessionView, outbox: Outbox, events: EventBus, config: &CollabConfig) -> Self {
        Self {
            view,
            outbox,
            events,
            history: Arc::new(RwLock::new(MessageLog::new(config.message_history_limit))),
            comments: Arc::new(RwLock::new(Vec::new())),
            chat_enabled: config.chat_enabled,
            comments_enabled: config.comments_enabled,
            show_resolved: config.comments_show_resolved,
        }
    }

    // ─── Chat ───────────────────────────────────────────────────────

    /// Post a chat message. `MessageReceived` is raised before this returns.
    pub async fn send_message(
        &self,
        content: impl Into<String>,
        mentions: Vec<String>,
        parent_id: Option<String>,
    ) -> Option<Message> {
        if !self.chat_enabled {
            log::debug!("Chat disabled, not sending message");
            return None;
        }
        let ctx = self.view.context().await?;

        let message = Message::new(ctx.session_id, &ctx.user, content, mentions, parent_id);
        self.history.write().await.record(message.clone());

        self.outbox.send(OutboundFrame::ChatMessage { message: message.clone() });
        self.events.emit(CollabEvent::MessageReceived(message.clone()));
        Some(message)
    }

    pub async fn get_messages(&self, limit: Option<usize>, before: Option<u64>) -> Vec<Message> {
        self.history.read().await.query(limit, before)
    }

    pub(crate) async fn handle_message(&self, message: Message) {
        if !self.history.write().await.record(message.clone()) {
            log::debug!("Ignoring duplicate message {}", message.id);
            return;
        }
        log::debug!("Chat message from {}", message.user_name);
        self.events.emit(CollabEvent::MessageReceived(message));
    }

    // ─── Comments ───────────────────────────────────────────────────

    /// Anchor a new comment to a document range.
    pub async fn add_comment(
        &self,
        document_uri: impl Into<DocumentUri>,
        range: Range,
        content: impl Into<String>,
    ) -> Result<Comment, CollabError> {
        if !self.comments_enabled {
            return Err(CollabError::FeatureDisabled("comments"));
        }
        let ctx = self.view.context().await.ok_or(CollabError::NoActiveSession)?;

        let comment = Comment::new(document_uri, range, &ctx.user, content);
        self.comments.write().await.push(comment.clone());

        self.outbox.send(OutboundFrame::AddComment {
            session_id: ctx.session_id,
            comment: comment.clone(),
        });
        self.events.emit(CollabEvent::CommentAdded(comment.clone()));
        Ok(comment)
    }

    pub async fn reply_to_comment(
        &self,
        comment_id: &str,
        content: impl Into<String>,
    ) -> Option<CommentReply> {
        let ctx = self.view.context().await?;
        let reply = CommentReply::new(&ctx.user, content);

        self.outbox.send(OutboundFrame::ReplyComment {
            session_id: ctx.session_id,
            comment_id: comment_id.to_string(),
            reply: reply.clone(),
        });

        let updated = self
            .modify_comment(comment_id, |c| c.replies.push(reply.clone()))
            .await;
        if let Some(comment) = updated {
            self.events.emit(CollabEvent::CommentUpdated(comment));
        }
        Some(reply)
    }

    pub async fn resolve_comment(&self, comment_id: &str, resolved: bool) {
        let Some(session_id) = self.view.session_id().await else {
            return;
        };

        self.outbox.send(OutboundFrame::ResolveComment {
            session_id,
            comment_id: comment_id.to_string(),
            resolved,
        });

        if let Some(comment) = self.modify_comment(comment_id, |c| c.is_resolved = resolved).await {
            self.events.emit(CollabEvent::CommentUpdated(comment));
        }
    }

    /// Comments seen for a document, in arrival order. Resolved comments
    /// are included only when configured.
    pub async fn get_comments(&self, document_uri: &str) -> Vec<Comment> {
        self.comments
            .read()
            .await
            .iter()
            .filter(|c| c.document_uri == document_uri)
            .filter(|c| self.show_resolved || !c.is_resolved)
            .cloned()
            .collect()
    }

    pub(crate) async fn handle_comment_added(&self, comment: Comment) {
        self.upsert_comment(comment.clone()).await;
        self.events.emit(CollabEvent::CommentAdded(comment));
    }

    pub(crate) async fn handle_comment_updated(&self, comment: Comment) {
        self.upsert_comment(comment.clone()).await;
        self.events.emit(CollabEvent::CommentUpdated(comment));
    }

    pub(crate) async fn handle_comment_deleted(&self, comment_id: String) {
        self.comments.write().await.retain(|c| c.id != comment_id);
        self.events.emit(CollabEvent::CommentDeleted(comment_id));
    }

    pub async fn clear(&self) {
        self.history.write().await.messages.clear();
        self.comments.write().await.clear();
    }

    async fn upsert_comment(&self, comment: Comment) {
        let mut comments = self.comments.write().await;
        match comments.iter_mut().find(|c| c.id == comment.id) {
            Some(existing) => *existing = comment,
            None => comments.push(comment),
        }
    }

    async fn modify_comment<F>(&self, comment_id: &str, f: F) -> Option<Comment>
    where
        F: FnOnce(&mut Comment),
    {
        let mut comments = self.comments.write().await;
        let comment = comments.iter_mut().find(|c| c.id == comment_id)?;
        f(comment);
        Some(comment.clone())
    }
}
