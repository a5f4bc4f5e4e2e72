//! Chat session controller.
//!
//! The controller owns the conversation.  Submitting a question checks the rate
//! limit, appends the user's message straight away, and spawns a task that drives
//! the answer stream.  Streamed text is mirrored into a transient buffer until the
//! terminal event turns it into an assistant message.  Observers follow along
//! through [`ChatEvent`]s.
//!
//! At most one query runs at a time.  Every query is tagged with a generation number;
//! submitting, cancelling or clearing bumps the generation so a superseded task can
//! no longer touch the conversation.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chat::config::{ChatConfig, DEFAULT_HISTORY_CONTEXT};
use crate::client::QueryBackend;
use crate::error::{Error, Result};
use crate::notice::ErrorNotice;
use crate::observability::{CHAT_CANCELLATIONS, CHAT_FAILURES, CHAT_QUERIES, CHAT_RATE_LIMITED};
use crate::rate_limit::RateLimiter;
use crate::session_store::SessionStore;
use crate::types::{Citation, DoneSummary, Message, QueryEvent, QueryRequest, Session};

/// Assistant text used when an answer completes without any content.
pub const FALLBACK_RESPONSE: &str =
    "I apologize, but I encountered an error generating a response.";

const EVENT_CAPACITY: usize = 256;

/// Where the current query is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryPhase {
    /// No query is running.
    #[default]
    Idle,
    /// The request has been sent; no response yet.
    Submitting,
    /// The answer is streaming in.
    Streaming,
}

/// Something observers of the conversation may want to react to.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// The query phase changed.
    PhaseChanged(QueryPhase),
    /// A message was added to the conversation.
    MessageAppended(Message),
    /// A message was taken back out of the conversation, ahead of a retry.
    MessageRemoved(Message),
    /// A fragment of answer text arrived.
    Chunk(String),
    /// A citation for the answer in progress arrived.
    Citation(Citation),
    /// The answer finished.
    Completed(DoneSummary),
    /// The query failed.  The user's message stays; no answer is added.
    Failed(Error),
    /// The query was cancelled by the caller.
    Cancelled,
    /// The conversation was discarded and a new session started.
    HistoryCleared {
        /// Identifier of the new session.
        session_id: String,
    },
    /// The message list changed and views should scroll to the end.
    ScrollToBottom,
}

#[derive(Debug, Default)]
struct ChatState {
    session: Session,
    phase: QueryPhase,
    streaming: String,
    error: Option<Error>,
    notice: Option<ErrorNotice>,
    selected_text: Option<String>,
    generation: u64,
    revision: u64,
}

impl ChatState {
    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.phase != QueryPhase::Idle
    }

    fn touch(&mut self) {
        self.session.last_activity = Some(OffsetDateTime::now_utc());
    }

    /// Marks the message list changed and copies the session for persistence.
    fn snapshot(&mut self) -> Snapshot {
        self.revision += 1;
        Snapshot {
            revision: self.revision,
            session: self.session.clone(),
        }
    }
}

struct Snapshot {
    revision: u64,
    session: Session,
}

struct Shared {
    state: Mutex<ChatState>,
    sessions: SessionStore,
    /// Revision of the last snapshot written; serializes writers.
    persisted: Mutex<u64>,
    events: broadcast::Sender<ChatEvent>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ChatState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes `snapshot` unless a newer one already reached the store.
    ///
    /// Called without the state lock held.
    fn persist(&self, snapshot: Snapshot) {
        let mut persisted = self.persisted.lock().unwrap_or_else(PoisonError::into_inner);
        if *persisted >= snapshot.revision {
            debug!(revision = snapshot.revision, "skipping stale session snapshot");
            return;
        }
        self.sessions.save(&snapshot.session);
        *persisted = snapshot.revision;
    }

    fn emit(&self, event: ChatEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_all(&self, events: impl IntoIterator<Item = ChatEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    fn begin_streaming(&self, generation: u64) -> bool {
        {
            let mut state = self.state();
            if !state.is_current(generation) {
                return false;
            }
            state.phase = QueryPhase::Streaming;
        }
        self.emit(ChatEvent::PhaseChanged(QueryPhase::Streaming));
        true
    }

    fn stream_chunk(&self, generation: u64, buffer: &str, chunk: String) -> bool {
        {
            let mut state = self.state();
            if !state.is_current(generation) {
                return false;
            }
            state.streaming.clear();
            state.streaming.push_str(buffer);
        }
        self.emit(ChatEvent::Chunk(chunk));
        true
    }

    fn stream_citation(&self, generation: u64, citation: Citation) -> bool {
        if !self.state().is_current(generation) {
            return false;
        }
        self.emit(ChatEvent::Citation(citation));
        true
    }

    fn complete(
        &self,
        generation: u64,
        content: String,
        citations: Vec<Citation>,
        summary: DoneSummary,
    ) {
        let (message, snapshot) = {
            let mut state = self.state();
            if !state.is_current(generation) {
                return;
            }
            let content = if content.is_empty() {
                FALLBACK_RESPONSE.to_string()
            } else {
                content
            };
            let message = Message::assistant(content, citations);
            state.session.messages.push(message.clone());
            state.touch();
            state.streaming.clear();
            state.phase = QueryPhase::Idle;
            state.selected_text = None;
            (message, state.snapshot())
        };
        self.persist(snapshot);
        debug!(query_id = ?summary.query_id, "answer complete");
        self.emit_all([
            ChatEvent::MessageAppended(message),
            ChatEvent::ScrollToBottom,
            ChatEvent::Completed(summary),
            ChatEvent::PhaseChanged(QueryPhase::Idle),
        ]);
    }

    fn fail(&self, generation: u64, err: Error) {
        {
            let mut state = self.state();
            if !state.is_current(generation) {
                return;
            }
            state.notice = Some(ErrorNotice::for_error(&err, 0));
            state.error = Some(err.clone());
            state.streaming.clear();
            state.phase = QueryPhase::Idle;
        }
        CHAT_FAILURES.click();
        warn!(error = %err, "query failed");
        self.emit_all([
            ChatEvent::Failed(err),
            ChatEvent::PhaseChanged(QueryPhase::Idle),
        ]);
    }
}

struct ActiveQuery {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Orchestrates the conversation, the rate limiter and the query backend.
pub struct ChatController {
    backend: Arc<dyn QueryBackend>,
    shared: Arc<Shared>,
    limiter: Arc<RateLimiter>,
    history_context: usize,
    active: Option<ActiveQuery>,
}

impl ChatController {
    /// Creates a controller, loading the persisted session from `sessions`.
    pub fn new(
        backend: Arc<dyn QueryBackend>,
        sessions: SessionStore,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let session = sessions.load();
        info!(session_id = %session.session_id, messages = session.messages.len(), "session loaded");
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = ChatState {
            session,
            ..ChatState::default()
        };
        Self {
            backend,
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                sessions,
                persisted: Mutex::new(0),
                events,
            }),
            limiter,
            history_context: DEFAULT_HISTORY_CONTEXT,
            active: None,
        }
    }

    /// Creates a controller using the limits in `config`.
    pub fn with_config(
        backend: Arc<dyn QueryBackend>,
        sessions: SessionStore,
        limiter: Arc<RateLimiter>,
        config: &ChatConfig,
    ) -> Self {
        Self::new(
            backend,
            sessions.with_max_messages(config.max_persisted_messages),
            limiter,
        )
        .with_history_context(config.history_context_messages)
    }

    /// Sets how many prior messages accompany each question.
    pub fn with_history_context(mut self, messages: usize) -> Self {
        self.history_context = messages;
        self
    }

    /// Asks `question`.
    ///
    /// Blank questions are ignored.  A query already in flight is cancelled first.
    /// The call returns once the request is under way; the answer arrives through
    /// [`ChatEvent`]s and the controller's state.  Returns a rate-limit error, without
    /// touching the conversation, if the quota is exhausted.
    pub async fn submit_query(&mut self, question: &str) -> Result<()> {
        if question.trim().is_empty() {
            return Ok(());
        }
        self.check_rate_limit()?;
        self.abort_active();
        self.limiter.record_query();
        CHAT_QUERIES.click();

        let cancel = CancellationToken::new();
        let (generation, request, user_message, snapshot) = {
            let mut state = self.shared.state();
            state.generation += 1;
            state.error = None;
            state.notice = None;
            state.streaming.clear();
            state.phase = QueryPhase::Submitting;

            let skip = state.session.messages.len().saturating_sub(self.history_context);
            let history = state.session.messages[skip..]
                .iter()
                .map(Message::to_history_entry)
                .collect();
            let user_message = Message::user(question);
            state.session.messages.push(user_message.clone());
            state.touch();
            let snapshot = state.snapshot();

            let request = QueryRequest::new(state.session.session_id.clone(), question)
                .with_history(history)
                .with_selected_text(state.selected_text.clone());
            (state.generation, request, user_message, snapshot)
        };
        self.shared.persist(snapshot);
        debug!(generation, endpoint = request.endpoint(), "submitting query");
        self.shared.emit_all([
            ChatEvent::MessageAppended(user_message),
            ChatEvent::ScrollToBottom,
            ChatEvent::PhaseChanged(QueryPhase::Submitting),
        ]);

        let task = tokio::spawn(run_query(
            Arc::clone(&self.shared),
            Arc::clone(&self.backend),
            request,
            generation,
            cancel.clone(),
        ));
        self.active = Some(ActiveQuery {
            generation,
            cancel,
            task,
        });
        Ok(())
    }

    /// Asks the most recent question again.
    ///
    /// A failed attempt never leaves an assistant message behind, so only a trailing
    /// unanswered question is taken back out before it is resubmitted; the
    /// conversation never shows it twice.  Answers already given are kept.  Does
    /// nothing if no question has been asked.
    pub async fn retry(&mut self) -> Result<()> {
        let question = {
            let state = self.shared.state();
            state
                .session
                .messages
                .iter()
                .rev()
                .find(|m| m.is_user())
                .map(|m| m.content.clone())
        };
        let Some(question) = question else {
            return Ok(());
        };
        self.check_rate_limit()?;
        self.abort_active();

        let (removed, snapshot) = {
            let mut state = self.shared.state();
            let unanswered = state
                .session
                .messages
                .last()
                .is_some_and(|m| m.is_user() && m.content == question);
            let removed = if unanswered {
                state.session.messages.pop()
            } else {
                None
            };
            let snapshot = removed.is_some().then(|| {
                state.touch();
                state.snapshot()
            });
            (removed, snapshot)
        };
        if let Some(snapshot) = snapshot {
            self.shared.persist(snapshot);
        }
        if let Some(message) = removed {
            self.shared.emit_all([
                ChatEvent::MessageRemoved(message),
                ChatEvent::ScrollToBottom,
            ]);
        }
        info!("retrying last question");
        self.submit_query(&question).await
    }

    /// Discards the conversation and starts a new session with a fresh id.
    ///
    /// Any query in flight is cancelled.
    pub fn clear_history(&mut self) {
        self.abort_active();
        let (session_id, snapshot) = {
            let mut state = self.shared.state();
            state.generation += 1;
            state.session = Session::new();
            state.streaming.clear();
            state.error = None;
            state.notice = None;
            state.selected_text = None;
            state.phase = QueryPhase::Idle;
            (state.session.session_id.clone(), state.snapshot())
        };
        self.shared.persist(snapshot);
        info!(%session_id, "conversation cleared");
        self.shared.emit_all([
            ChatEvent::HistoryCleared { session_id },
            ChatEvent::ScrollToBottom,
        ]);
    }

    /// Cancels the query in flight, if any.
    ///
    /// Loading, streaming and error state are reset; the messages are left alone.
    /// Returns false, and changes nothing, when no query is running.
    pub fn cancel(&mut self) -> bool {
        let Some(generation) = self.abort_active() else {
            return false;
        };
        CHAT_CANCELLATIONS.click();
        {
            let mut state = self.shared.state();
            if state.generation == generation {
                state.generation += 1;
            }
            state.phase = QueryPhase::Idle;
            state.streaming.clear();
            state.error = None;
            state.notice = None;
        }
        debug!(generation, "query cancelled");
        self.shared.emit_all([
            ChatEvent::Cancelled,
            ChatEvent::PhaseChanged(QueryPhase::Idle),
        ]);
        true
    }

    /// Waits for the query in flight, if any, to finish.
    pub async fn wait(&mut self) {
        if let Some(active) = self.active.take() {
            if let Err(err) = active.task.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "query task failed");
                }
            }
        }
    }

    /// Attaches a passage to subsequent questions, or detaches it with `None`.
    ///
    /// The passage is dropped automatically after the next successful answer.
    pub fn set_selected_text(&mut self, text: Option<String>) {
        self.shared.state().selected_text = text.filter(|t| !t.trim().is_empty());
    }

    /// Returns the attached passage.
    pub fn selected_text(&self) -> Option<String> {
        self.shared.state().selected_text.clone()
    }

    /// Returns the current session id.
    pub fn session_id(&self) -> String {
        self.shared.state().session.session_id.clone()
    }

    /// Returns a copy of the conversation.
    pub fn messages(&self) -> Vec<Message> {
        self.shared.state().session.messages.clone()
    }

    /// Returns a copy of the session.
    pub fn session(&self) -> Session {
        self.shared.state().session.clone()
    }

    /// Returns the answer text streamed so far.
    pub fn streaming_content(&self) -> String {
        self.shared.state().streaming.clone()
    }

    /// Returns the current query phase.
    pub fn phase(&self) -> QueryPhase {
        self.shared.state().phase
    }

    /// Returns true while a query is running.
    pub fn is_loading(&self) -> bool {
        self.phase() != QueryPhase::Idle
    }

    /// Returns the error from the last query, if it failed.
    pub fn error(&self) -> Option<Error> {
        self.shared.state().error.clone()
    }

    /// Returns what to tell the user about the last failure.
    pub fn error_notice(&self) -> Option<ErrorNotice> {
        self.shared.state().notice.clone()
    }

    /// Returns how many prior messages accompany each question.
    pub fn history_context(&self) -> usize {
        self.history_context
    }

    /// Returns the rate limiter.
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Subscribes to conversation events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.shared.events.subscribe()
    }

    fn check_rate_limit(&self) -> Result<()> {
        let (limited, wait_seconds) = self.limiter.is_limited();
        if !limited {
            return Ok(());
        }
        CHAT_RATE_LIMITED.click();
        let err = Error::rate_limit(
            format!("Rate limit exceeded. Please wait {wait_seconds} seconds."),
            Some(wait_seconds),
        );
        // The refusal is not a query failure; only the notice is shown.
        self.shared.state().notice = Some(ErrorNotice::rate_limited(wait_seconds));
        info!(wait_seconds, "query refused by rate limiter");
        Err(err)
    }

    /// Stops the running query task.  Returns its generation if it was still running.
    fn abort_active(&mut self) -> Option<u64> {
        let active = self.active.take()?;
        if active.task.is_finished() {
            return None;
        }
        active.cancel.cancel();
        active.task.abort();
        Some(active.generation)
    }
}

impl Drop for ChatController {
    fn drop(&mut self) {
        self.abort_active();
    }
}

async fn run_query(
    shared: Arc<Shared>,
    backend: Arc<dyn QueryBackend>,
    request: QueryRequest,
    generation: u64,
    cancel: CancellationToken,
) {
    let mut stream = match backend.query(request, cancel.clone()).await {
        Ok(stream) => stream,
        Err(err) if err.is_abort() => {
            debug!(generation, "request aborted");
            return;
        }
        Err(err) => {
            shared.fail(generation, err);
            return;
        }
    };
    if !shared.begin_streaming(generation) {
        return;
    }

    let mut content = String::new();
    let mut citations = Vec::new();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(QueryEvent::Chunk(chunk))) => {
                content.push_str(&chunk);
                if !shared.stream_chunk(generation, &content, chunk) {
                    return;
                }
            }
            Some(Ok(QueryEvent::Citation(citation))) => {
                citations.push(citation.clone());
                if !shared.stream_citation(generation, citation) {
                    return;
                }
            }
            Some(Ok(QueryEvent::Done(summary))) => {
                shared.complete(generation, content, citations, summary);
                return;
            }
            Some(Err(err)) => {
                shared.fail(generation, err);
                return;
            }
            None => {
                if !cancel.is_cancelled() {
                    shared.complete(generation, content, citations, DoneSummary::default());
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::stream;

    use super::*;
    use crate::client::QueryStream;
    use crate::error::ErrorKind;
    use crate::rate_limit::RateLimitConfig;
    use crate::storage::{KeyValueStore, MemoryStore, SESSION_KEY};
    use crate::utils::ManualClock;

    enum Reply {
        Answer(Vec<Result<QueryEvent>>),
        Refuse(Error),
        Hang,
    }

    #[derive(Default)]
    struct FakeBackend {
        replies: Mutex<VecDeque<Reply>>,
        requests: Mutex<Vec<QueryRequest>>,
    }

    impl FakeBackend {
        fn new(replies: impl IntoIterator<Item = Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().collect()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<QueryRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl QueryBackend for FakeBackend {
        async fn query(
            &self,
            request: QueryRequest,
            cancel: CancellationToken,
        ) -> Result<QueryStream> {
            self.requests.lock().unwrap().push(request);
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Reply::Answer(vec![Ok(QueryEvent::Done(DoneSummary::default()))]));
            match reply {
                Reply::Answer(events) => Ok(QueryStream::new(stream::iter(events), cancel)),
                Reply::Refuse(err) => Err(err),
                Reply::Hang => Ok(QueryStream::new(stream::pending(), cancel)),
            }
        }
    }

    fn answer(parts: &[&str]) -> Reply {
        let mut events: Vec<Result<QueryEvent>> = parts
            .iter()
            .map(|p| Ok(QueryEvent::Chunk(p.to_string())))
            .collect();
        events.push(Ok(QueryEvent::Done(DoneSummary::default())));
        Reply::Answer(events)
    }

    struct Harness {
        controller: ChatController,
        backend: Arc<FakeBackend>,
        store: Arc<MemoryStore>,
    }

    fn harness(replies: impl IntoIterator<Item = Reply>) -> Harness {
        harness_with(replies, RateLimitConfig::default(), Arc::new(MemoryStore::new()))
    }

    fn harness_with(
        replies: impl IntoIterator<Item = Reply>,
        rate_limit: RateLimitConfig,
        store: Arc<MemoryStore>,
    ) -> Harness {
        let backend = FakeBackend::new(replies);
        let limiter = Arc::new(RateLimiter::new(
            store.clone(),
            Arc::new(ManualClock::new(1_765_880_000_000)),
            rate_limit,
        ));
        let controller =
            ChatController::new(backend.clone(), SessionStore::new(store.clone()), limiter);
        Harness {
            controller,
            backend,
            store,
        }
    }

    async fn next_matching(
        events: &mut broadcast::Receiver<ChatEvent>,
        pred: impl Fn(&ChatEvent) -> bool,
    ) -> ChatEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn streamed_answer_becomes_assistant_message() {
        let citation = Citation::new("Chapter 5", "Perception", None, "/docs/chapter-5");
        let mut h = harness([Reply::Answer(vec![
            Ok(QueryEvent::Chunk("Hello ".to_string())),
            Ok(QueryEvent::Citation(citation.clone())),
            Ok(QueryEvent::Chunk("world".to_string())),
            Ok(QueryEvent::Done(DoneSummary::default())),
        ])]);
        let mut events = h.controller.subscribe();
        h.controller.submit_query("Say hello").await.unwrap();
        assert!(h.controller.is_loading());
        h.controller.wait().await;

        let messages = h.controller.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].is_user());
        assert_eq!(messages[1].content, "Hello world");
        assert_eq!(messages[1].citations, vec![citation]);
        assert_eq!(h.controller.phase(), QueryPhase::Idle);
        assert_eq!(h.controller.streaming_content(), "");
        assert!(h.controller.error().is_none());

        next_matching(&mut events, |e| matches!(e, ChatEvent::Completed(_))).await;

        let persisted: Session =
            serde_json::from_str(&h.store.get(SESSION_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(persisted.messages.len(), 2);
        assert!(persisted.last_activity.is_some());
    }

    #[tokio::test]
    async fn empty_answer_uses_fallback() {
        let mut h = harness([answer(&[])]);
        h.controller.submit_query("Anything?").await.unwrap();
        h.controller.wait().await;
        assert_eq!(h.controller.messages()[1].content, FALLBACK_RESPONSE);
    }

    #[tokio::test]
    async fn blank_question_is_ignored() {
        let mut h = harness([]);
        h.controller.submit_query("   \n").await.unwrap();
        assert!(h.controller.messages().is_empty());
        assert!(h.backend.requests().is_empty());
        assert_eq!(h.controller.rate_limiter().queries_in_window(), 0);
    }

    #[tokio::test]
    async fn failure_keeps_user_message_only() {
        let mut h = harness([Reply::Answer(vec![
            Ok(QueryEvent::Chunk("partial".to_string())),
            Err(Error::backend("An error occurred: request timed out", None)),
        ])]);
        let mut events = h.controller.subscribe();
        h.controller.submit_query("What is SLAM?").await.unwrap();
        h.controller.wait().await;

        assert_eq!(h.controller.messages().len(), 1);
        assert_eq!(h.controller.streaming_content(), "");
        let notice = h.controller.error_notice().unwrap();
        assert_eq!(notice.kind, ErrorKind::Timeout);
        assert!(notice.retryable);
        next_matching(&mut events, |e| matches!(e, ChatEvent::Failed(_))).await;
    }

    #[tokio::test]
    async fn retry_resubmits_without_duplicating_question() {
        let mut h = harness([
            Reply::Refuse(Error::connection("Failed to fetch", None)),
            answer(&["SLAM is simultaneous localization and mapping."]),
        ]);
        h.controller.submit_query("What is SLAM?").await.unwrap();
        h.controller.wait().await;
        assert!(h.controller.error().is_some());
        assert_eq!(h.controller.messages().len(), 1);

        let mut events = h.controller.subscribe();
        h.controller.retry().await.unwrap();
        h.controller.wait().await;

        next_matching(&mut events, |e| matches!(e, ChatEvent::MessageRemoved(m) if m.is_user()))
            .await;
        assert!(matches!(events.recv().await.unwrap(), ChatEvent::ScrollToBottom));

        let requests = h.backend.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].question, "What is SLAM?");
        assert!(requests[1].conversation_history.is_empty());

        let messages = h.controller.messages();
        let questions = messages.iter().filter(|m| m.is_user()).count();
        assert_eq!(questions, 1);
        assert_eq!(messages.len(), 2);
        assert!(h.controller.error().is_none());
    }

    #[tokio::test]
    async fn retry_after_rate_limit_keeps_stored_answer() {
        let config = RateLimitConfig {
            max_queries: 1,
            ..RateLimitConfig::default()
        };
        let mut h = harness_with(
            [answer(&["A1"]), answer(&["A1 again"])],
            config,
            Arc::new(MemoryStore::new()),
        );
        h.controller.submit_query("Q1").await.unwrap();
        h.controller.wait().await;
        assert!(h.controller.submit_query("Q2").await.unwrap_err().is_rate_limit());
        assert!(h.controller.error().is_none());
        assert!(h.controller.error_notice().is_some());

        h.controller.rate_limiter().reset();
        let mut events = h.controller.subscribe();
        h.controller.retry().await.unwrap();
        h.controller.wait().await;

        let contents: Vec<_> = h
            .controller
            .messages()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["Q1", "A1", "Q1", "A1 again"]);
        assert_eq!(h.backend.requests()[1].question, "Q1");
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, ChatEvent::MessageRemoved(_)));
        }
    }

    #[tokio::test]
    async fn older_snapshot_never_overwrites_newer() {
        let h = harness([]);
        let shared = &h.controller.shared;
        let (older, newer) = {
            let mut state = shared.state();
            state.session.messages.push(Message::user("first"));
            let older = state.snapshot();
            state.session.messages.push(Message::user("second"));
            (older, state.snapshot())
        };
        shared.persist(newer);
        shared.persist(older);

        let persisted: Session =
            serde_json::from_str(&h.store.get(SESSION_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(persisted.messages.len(), 2);
    }

    #[tokio::test]
    async fn retry_without_questions_does_nothing() {
        let mut h = harness([]);
        h.controller.retry().await.unwrap();
        assert!(h.backend.requests().is_empty());
    }

    #[tokio::test]
    async fn cancel_without_query_changes_nothing() {
        let mut h = harness([answer(&["done"])]);
        assert!(!h.controller.cancel());
        h.controller.submit_query("Q").await.unwrap();
        h.controller.wait().await;

        let before = (h.controller.messages(), h.controller.phase(), h.controller.session_id());
        assert!(!h.controller.cancel());
        assert!(!h.controller.cancel());
        let after = (h.controller.messages(), h.controller.phase(), h.controller.session_id());
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn cancel_stops_streaming_and_keeps_history() {
        let mut h = harness([Reply::Hang]);
        let mut events = h.controller.subscribe();
        h.controller.submit_query("Explain PID control").await.unwrap();
        next_matching(&mut events, |e| {
            matches!(e, ChatEvent::PhaseChanged(QueryPhase::Streaming))
        })
        .await;

        assert!(h.controller.cancel());
        assert_eq!(h.controller.phase(), QueryPhase::Idle);
        assert!(!h.controller.is_loading());
        assert!(h.controller.error().is_none());
        assert_eq!(h.controller.messages().len(), 1);
        next_matching(&mut events, |e| matches!(e, ChatEvent::Cancelled)).await;

        assert!(!h.controller.cancel());
    }

    #[tokio::test]
    async fn new_question_preempts_running_one() {
        let mut h = harness([Reply::Hang, answer(&["Second."])]);
        let mut events = h.controller.subscribe();
        h.controller.submit_query("First?").await.unwrap();
        next_matching(&mut events, |e| {
            matches!(e, ChatEvent::PhaseChanged(QueryPhase::Streaming))
        })
        .await;
        h.controller.submit_query("Second?").await.unwrap();
        h.controller.wait().await;

        let contents: Vec<_> = h
            .controller
            .messages()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["First?", "Second?", "Second."]);
        assert!(h.controller.error().is_none());
        assert_eq!(h.backend.requests()[1].conversation_history.len(), 1);
    }

    #[tokio::test]
    async fn history_context_is_bounded() {
        let store = Arc::new(MemoryStore::new());
        let mut session = Session::new();
        for i in 0..12 {
            session.messages.push(if i % 2 == 0 {
                Message::user(format!("q{i}"))
            } else {
                Message::assistant(format!("a{i}"), Vec::new())
            });
        }
        SessionStore::new(store.clone()).save(&session);

        let mut h = harness_with([answer(&["ok"])], RateLimitConfig::default(), store);
        assert_eq!(h.controller.session_id(), session.session_id);
        h.controller.submit_query("q12").await.unwrap();
        h.controller.wait().await;

        let request = &h.backend.requests()[0];
        assert_eq!(request.session_id, session.session_id);
        assert_eq!(request.conversation_history.len(), 10);
        assert_eq!(request.conversation_history[0].content, "q2");
        assert_eq!(request.conversation_history[9].content, "a11");
    }

    #[tokio::test]
    async fn rate_limit_blocks_before_network() {
        let config = RateLimitConfig {
            max_queries: 1,
            ..RateLimitConfig::default()
        };
        let mut h = harness_with([answer(&["ok"])], config, Arc::new(MemoryStore::new()));
        h.controller.submit_query("One").await.unwrap();
        h.controller.wait().await;

        let err = h.controller.submit_query("Two").await.unwrap_err();
        assert!(err.is_rate_limit());
        assert_eq!(err.retry_after(), Some(60));
        assert_eq!(h.backend.requests().len(), 1);
        assert_eq!(h.controller.messages().len(), 2);
        let notice = h.controller.error_notice().unwrap();
        assert_eq!(notice.title, "Query Limit Reached");
        assert!(!notice.retryable);

        // Retrying is refused the same way and leaves the conversation intact.
        assert!(h.controller.retry().await.unwrap_err().is_rate_limit());
        assert_eq!(h.controller.messages().len(), 2);
    }

    #[tokio::test]
    async fn clear_history_starts_new_session() {
        let mut h = harness([answer(&["ok"]), Reply::Hang]);
        h.controller.submit_query("Q").await.unwrap();
        h.controller.wait().await;
        let old_id = h.controller.session_id();
        h.controller.submit_query("Still running").await.unwrap();

        let mut events = h.controller.subscribe();
        h.controller.clear_history();
        assert!(h.controller.messages().is_empty());
        assert_ne!(h.controller.session_id(), old_id);
        assert!(!h.controller.is_loading());

        let persisted: Session =
            serde_json::from_str(&h.store.get(SESSION_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(persisted.session_id, h.controller.session_id());
        assert!(persisted.messages.is_empty());
        match next_matching(&mut events, |e| matches!(e, ChatEvent::HistoryCleared { .. })).await {
            ChatEvent::HistoryCleared { session_id } => {
                assert_eq!(session_id, h.controller.session_id())
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn selected_text_goes_with_next_question_only() {
        let mut h = harness([answer(&["It means..."]), answer(&["Sure."])]);
        h.controller
            .set_selected_text(Some("The Jacobian relates joint and end-effector velocities.".into()));
        h.controller.submit_query("Explain this").await.unwrap();
        h.controller.wait().await;
        assert!(h.controller.selected_text().is_none());

        h.controller.submit_query("And more?").await.unwrap();
        h.controller.wait().await;

        let requests = h.backend.requests();
        assert_eq!(requests[0].endpoint(), "/query-selection");
        assert!(requests[0].selected_text.is_some());
        assert_eq!(requests[1].endpoint(), "/query");
    }

    #[tokio::test]
    async fn selected_text_survives_failure() {
        let mut h = harness([Reply::Refuse(Error::service_unavailable("down", None))]);
        h.controller.set_selected_text(Some("A passage about odometry.".into()));
        h.controller.submit_query("Explain").await.unwrap();
        h.controller.wait().await;
        assert!(h.controller.error().is_some());
        assert_eq!(
            h.controller.selected_text().as_deref(),
            Some("A passage about odometry.")
        );
    }
}
