//! Seams the orchestrator talks through, with in-process implementations.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;

use crate::error::CoreResult;
use crate::model::{Chat, Message, ModelDefinition, Role, TokenUsage};

/// Fixed per-message cost for role and framing tokens.
const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

/// Conversation list. `snapshot` must return the latest committed state.
pub trait ConversationStore: Send + Sync {
    fn snapshot(&self) -> Vec<Chat>;
    fn commit(&self, chats: Vec<Chat>);
}

pub trait TokenTrimmer: Send + Sync {
    /// History that fits the model's context once room for the reply is
    /// reserved. An empty result means nothing fits.
    fn trim_to_budget(
        &self,
        messages: &[Message],
        model_id: &str,
        max_context: u32,
        max_output_tokens: u32,
    ) -> Vec<Message>;
}

/// Anti-abuse token for keyless endpoints.
#[async_trait]
pub trait ChallengeTokenProvider: Send + Sync {
    async fn acquire(&self, action: &str) -> CoreResult<String>;
}

pub trait UsageSink: Send + Sync {
    fn record(&self, model_index: usize, prompt: &[Message], completion: &Message);
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    chats: RwLock<Vec<Chat>>,
}

impl InMemoryStore {
    pub fn new(chats: Vec<Chat>) -> Self {
        Self { chats: RwLock::new(chats) }
    }
}

impl ConversationStore for InMemoryStore {
    fn snapshot(&self) -> Vec<Chat> {
        match self.chats.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn commit(&self, chats: Vec<Chat>) {
        match self.chats.write() {
            Ok(mut guard) => *guard = chats,
            Err(poisoned) => *poisoned.into_inner() = chats,
        }
    }
}

/// Rough token count, ~4 characters per token.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count() as u32;
    chars.div_ceil(4)
}

fn message_tokens(m: &Message) -> u32 {
    estimate_tokens(&m.content) + MESSAGE_OVERHEAD_TOKENS
}

pub fn estimate_usage(prompt: &[Message], completion: &Message) -> TokenUsage {
    TokenUsage {
        prompt_tokens: prompt.iter().map(message_tokens).sum(),
        completion_tokens: estimate_tokens(&completion.content),
    }
}

/// Keeps a leading system message plus the newest messages that fit.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharBudgetTrimmer;

impl TokenTrimmer for CharBudgetTrimmer {
    fn trim_to_budget(
        &self,
        messages: &[Message],
        _model_id: &str,
        max_context: u32,
        max_output_tokens: u32,
    ) -> Vec<Message> {
        let mut budget = max_context.saturating_sub(max_output_tokens);
        let (system, rest) = match messages.split_first() {
            Some((first, rest)) if first.role == Role::System => (Some(first), rest),
            _ => (None, messages),
        };
        if let Some(sys) = system {
            budget = budget.saturating_sub(message_tokens(sys));
        }

        let mut kept = Vec::new();
        for m in rest.iter().rev() {
            let cost = message_tokens(m);
            if cost > budget {
                break;
            }
            budget -= cost;
            kept.push(m.clone());
        }
        if kept.is_empty() {
            return kept;
        }
        kept.extend(system.cloned());
        kept.reverse();
        kept
    }
}

/// Returns the same token for every action.
#[derive(Debug, Clone)]
pub struct StaticChallengeToken(pub String);

#[async_trait]
impl ChallengeTokenProvider for StaticChallengeToken {
    async fn acquire(&self, _action: &str) -> CoreResult<String> {
        Ok(self.0.clone())
    }
}

/// Running per-model usage totals.
#[derive(Debug, Default)]
pub struct UsageTally {
    totals: Mutex<HashMap<usize, TokenUsage>>,
}

impl UsageTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn totals(&self, model_index: usize) -> TokenUsage {
        self.lock().get(&model_index).copied().unwrap_or_default()
    }

    /// Accumulated cost in the currency the model prices are quoted in.
    pub fn cost(&self, models: &[ModelDefinition]) -> f64 {
        self.lock()
            .iter()
            .filter_map(|(idx, usage)| models.get(*idx).map(|m| (m, usage)))
            .map(|(m, u)| {
                f64::from(u.prompt_tokens) / 1000.0 * m.prompt_cost_1000
                    + f64::from(u.completion_tokens) / 1000.0 * m.completion_cost_1000
            })
            .sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<usize, TokenUsage>> {
        self.totals.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl UsageSink for UsageTally {
    fn record(&self, model_index: usize, prompt: &[Message], completion: &Message) {
        let usage = estimate_usage(prompt, completion);
        let mut totals = self.lock();
        let entry = totals.entry(model_index).or_default();
        entry.prompt_tokens = entry.prompt_tokens.saturating_add(usage.prompt_tokens);
        entry.completion_tokens = entry.completion_tokens.saturating_add(usage.completion_tokens);
    }
}
