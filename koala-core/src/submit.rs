//! One chat turn: dispatch, stream, account, title.
//!
//! Lifecycle: `Idle -> Dispatching -> Streaming -> Finalizing -> Idle`, or
//! `Failed` from any active phase. The generating flag is cleared on every
//! exit and whatever was merged into the assistant message stays there.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tracing::{Instrument, Span, debug, field, info, info_span, warn};

use crate::collab::{ChallengeTokenProvider, ConversationStore, TokenTrimmer, UsageSink, estimate_usage};
use crate::config::Settings;
use crate::error::{CoreResult, KoalaError};
use crate::http_client::HttpClient;
use crate::model::{EndpointAuth, Message, Role, TokenUsage};
use crate::normalizer::{clean_title, normalize_config, normalize_messages};
use crate::request::{CallKind, CompletionParams, build, build_title};
use crate::stream::{Disposition, StreamConsumer};
use crate::telemetry::keys::{KEY_ERROR_KIND, KEY_MODEL, KEY_TOKENS_COMPLETION, KEY_TOKENS_PROMPT};

/// Characters of each message quoted in the title prompt.
const TITLE_EXCERPT_CHARS: usize = 800;

pub struct Collaborators {
    pub store: Arc<dyn ConversationStore>,
    pub trimmer: Arc<dyn TokenTrimmer>,
    pub usage: Option<Arc<dyn UsageSink>>,
    pub challenge: Option<Arc<dyn ChallengeTokenProvider>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Dispatching,
    Streaming,
    Finalizing,
    Failed,
}

impl Phase {
    fn is_busy(&self) -> bool {
        matches!(self, Self::Dispatching | Self::Streaming)
    }
}

/// Shared generating flag. Clearing it stops the read loop before its next read.
#[derive(Debug, Clone, Default)]
pub struct GenerationHandle(Arc<AtomicBool>);

impl GenerationHandle {
    pub fn is_generating(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    fn start(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Busy,
    NoSuchChat,
    NoPendingUserMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TitleStatus {
    Skipped,
    Generated(String),
    /// Human-readable failure; the submission itself still succeeded.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completed {
    pub content: String,
    pub usage: TokenUsage,
    pub disposition: Disposition,
    pub title: TitleStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    Completed(Completed),
    Rejected(RejectReason),
}

#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct SubmissionError {
    #[source]
    pub error: KoalaError,
    /// Whether any assistant text reached the store before the failure.
    pub partial_merged: bool,
}

impl From<KoalaError> for SubmissionError {
    fn from(error: KoalaError) -> Self {
        Self { error, partial_merged: false }
    }
}

// Single-shot completion document: {choices: [{message: {content}}]}
#[derive(Deserialize)]
struct CompletionDocument {
    #[serde(default)]
    choices: Vec<DocumentChoice>,
}

#[derive(Deserialize)]
struct DocumentChoice {
    message: DocumentMessage,
}

#[derive(Deserialize)]
struct DocumentMessage {
    #[serde(default)]
    content: String,
}

pub struct Orchestrator {
    http: HttpClient,
    settings: Arc<Settings>,
    collab: Collaborators,
    consumer: StreamConsumer,
    generating: GenerationHandle,
    phase: Mutex<Phase>,
    last_error: Mutex<Option<String>>,
}

impl Orchestrator {
    pub fn new(http: HttpClient, settings: Arc<Settings>, collab: Collaborators) -> Self {
        let consumer = StreamConsumer::new(settings.stream.flush_policy());
        Self {
            http,
            settings,
            collab,
            consumer,
            generating: GenerationHandle::default(),
            phase: Mutex::new(Phase::Idle),
            last_error: Mutex::new(None),
        }
    }

    /// Build the HTTP client from the settings' `http` section.
    pub fn from_settings(settings: Arc<Settings>, collab: Collaborators) -> CoreResult<Self> {
        let http = HttpClient::new(&settings.http)?;
        Ok(Self::new(http, settings, collab))
    }

    pub fn handle(&self) -> GenerationHandle {
        self.generating.clone()
    }

    pub fn phase(&self) -> Phase {
        *lock(&self.phase)
    }

    /// Message of the most recent failed submission.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    fn set_phase(&self, phase: Phase) {
        *lock(&self.phase) = phase;
    }

    fn try_begin(&self) -> bool {
        let mut phase = lock(&self.phase);
        if phase.is_busy() {
            return false;
        }
        *phase = Phase::Dispatching;
        self.generating.start();
        true
    }

    pub async fn submit(&self, chat_index: usize) -> Result<Submission, SubmissionError> {
        if !self.try_begin() {
            debug!(chat.index = chat_index, "submission rejected: busy");
            return Ok(Submission::Rejected(RejectReason::Busy));
        }

        let span = info_span!(
            "submit",
            chat.index = chat_index,
            llm.model = field::Empty,
            tokens.prompt = field::Empty,
            tokens.completion = field::Empty,
            error.kind = field::Empty,
        );
        let outcome = self.run(chat_index).instrument(span.clone()).await;
        self.generating.stop();

        match &outcome {
            Ok(_) => self.set_phase(Phase::Idle),
            Err(e) => {
                span.record(KEY_ERROR_KIND, e.error.kind());
                span.in_scope(|| warn!(partial = e.partial_merged, "submission failed: {}", e.error));
                *lock(&self.last_error) = Some(e.error.to_string());
                self.set_phase(Phase::Failed);
            }
        }
        outcome
    }

    async fn run(&self, chat_index: usize) -> Result<Submission, SubmissionError> {
        let store = &self.collab.store;
        let mut chats = store.snapshot();
        let Some(chat) = chats.get_mut(chat_index) else {
            return Ok(Submission::Rejected(RejectReason::NoSuchChat));
        };
        if chat.messages.is_empty() {
            return Err(KoalaError::EmptySubmission("No messages submitted!".into()).into());
        }
        if !chat.has_pending_user_message() {
            return Ok(Submission::Rejected(RejectReason::NoPendingUserMessage));
        }

        let history = normalize_messages(&chat.messages);
        let config = chat.config.clone();
        chat.messages.push(Message::assistant(""));
        // Messages are only appended while a submission runs, so the slot is stable.
        let slot = chat.messages.len() - 1;
        store.commit(chats);

        let model_index = config.model_selection;
        let model = self.settings.model(model_index)?;
        let auth = self.settings.endpoint(model.endpoint)?;
        Span::current().record(KEY_MODEL, model.model.as_str());

        let max_context = config.max_context.unwrap_or(model.model_max_context);
        let trimmed =
            self.collab
                .trimmer
                .trim_to_budget(&history, &model.model, max_context, config.max_tokens);
        if trimmed.is_empty() {
            return Err(KoalaError::EmptySubmission("Message exceeds max token!".into()).into());
        }

        let api_key = auth.key();
        if api_key.is_none() && auth.endpoint == self.settings.official_endpoint {
            return Err(KoalaError::NoCredential { endpoint: auth.endpoint.clone() }.into());
        }
        let challenge = self.challenge_token(auth, "submit").await?;

        let request_config = normalize_config(config);
        let desc = build(&CompletionParams {
            endpoint: &auth.endpoint,
            messages: &trimmed,
            config: &request_config,
            model,
            api_key,
            challenge_token: challenge.as_deref(),
            extra_headers: &[],
            kind: CallKind::Stream,
        })?;

        self.set_phase(Phase::Streaming);
        let mut stream = self.http.post_stream(&desc).await?;

        let mut merged_any = false;
        let mut sink = |text: &str| -> CoreResult<()> {
            let mut chats = store.snapshot();
            let reply = chats
                .get_mut(chat_index)
                .and_then(|c| c.messages.get_mut(slot))
                .ok_or_else(|| {
                    KoalaError::Validation(format!("chat {chat_index} disappeared while streaming"))
                })?;
            reply.content.push_str(text);
            store.commit(chats);
            merged_any = true;
            Ok(())
        };
        let handle = self.generating.clone();
        let summary = self
            .consumer
            .pump(&mut stream, || handle.is_generating(), &mut sink)
            .await
            .map_err(|error| SubmissionError { error, partial_merged: merged_any })?;

        self.set_phase(Phase::Finalizing);
        let chats = store.snapshot();
        let chat = chats.get(chat_index).ok_or_else(|| {
            KoalaError::Validation(format!("chat {chat_index} disappeared while streaming"))
        })?;
        let completion = chat
            .messages
            .get(slot)
            .ok_or_else(|| KoalaError::Validation("assistant message missing".into()))?;
        let prompt = &chat.messages[..slot];
        let usage = estimate_usage(prompt, completion);
        Span::current().record(KEY_TOKENS_PROMPT, usage.prompt_tokens);
        Span::current().record(KEY_TOKENS_COMPLETION, usage.completion_tokens);
        if self.settings.count_total_tokens
            && let Some(sink) = &self.collab.usage
        {
            sink.record(model_index, prompt, completion);
        }

        let title = if self.settings.auto_title && !chat.title_set {
            self.generate_title(chat_index, auth).await
        } else {
            TitleStatus::Skipped
        };

        info!(
            disposition = summary.disposition.as_str(),
            chunks = summary.chunks_read,
            chars = summary.merged_chars,
            "submission finished"
        );
        Ok(Submission::Completed(Completed {
            content: completion.content.clone(),
            usage,
            disposition: summary.disposition,
            title,
        }))
    }

    async fn challenge_token(&self, auth: &EndpointAuth, action: &str) -> CoreResult<Option<String>> {
        if auth.key().is_some() {
            return Ok(None);
        }
        match &self.collab.challenge {
            Some(provider) => provider.acquire(action).await.map(Some),
            None => Ok(None),
        }
    }

    async fn generate_title(&self, chat_index: usize, auth: &EndpointAuth) -> TitleStatus {
        match self.request_title(chat_index, auth).await {
            Ok(title) => TitleStatus::Generated(title),
            Err(e) => {
                let err = KoalaError::TitleGeneration(e.to_string());
                warn!(error.kind = e.kind(), "{err}");
                TitleStatus::Failed(err.to_string())
            }
        }
    }

    async fn request_title(&self, chat_index: usize, auth: &EndpointAuth) -> CoreResult<String> {
        let store = &self.collab.store;
        let chats = store.snapshot();
        let chat = chats
            .get(chat_index)
            .ok_or_else(|| KoalaError::Validation(format!("chat {chat_index} not found")))?;
        let last_of = |role: Role| {
            chat.messages
                .iter()
                .rev()
                .find(|m| m.role == role)
                .map(|m| excerpt(&m.content))
                .unwrap_or_default()
        };
        let prompt = format!(
            "Generate a title in less than 6 words for the following message (language: {}):\n\"\"\"\nUser: {}\nAssistant: {}\n\"\"\"",
            self.settings.language,
            last_of(Role::User),
            last_of(Role::Assistant),
        );
        let messages = [Message::user(prompt)];

        let challenge = self.challenge_token(auth, "title").await?;
        let (desc, title_model) = build_title(
            &auth.endpoint,
            &messages,
            &self.settings.models,
            auth.key(),
            challenge.as_deref(),
        )?;
        let doc: CompletionDocument = self.http.post_document(&desc).await?;
        let raw = doc
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| KoalaError::Decode("completion has no choices".into()))?;
        let title = clean_title(&raw);

        let mut chats = store.snapshot();
        if let Some(chat) = chats.get_mut(chat_index) {
            chat.title = title.clone();
            chat.title_set = true;
        }
        store.commit(chats);

        if self.settings.count_total_tokens
            && let Some(sink) = &self.collab.usage
        {
            sink.record(title_model, &messages, &Message::assistant(title.clone()));
        }
        Ok(title)
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(TITLE_EXCERPT_CHARS).collect()
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
