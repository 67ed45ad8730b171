use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }
}

/// Per-chat request configuration. Everything except `model_selection` and
/// `max_context` is sent upstream verbatim.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ChatConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub presence_penalty: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    /// Index into the configured model list. Local only.
    pub model_selection: usize,
    /// Local only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_context: Option<u32>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            max_tokens: 4096,
            temperature: 1.0,
            presence_penalty: 0.0,
            top_p: 1.0,
            frequency_penalty: 0.0,
            model_selection: 0,
            max_context: None,
        }
    }
}

/// One conversation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Chat {
    pub title: String,
    #[serde(default)]
    pub title_set: bool,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub config: ChatConfig,
}

impl Chat {
    pub fn new(config: ChatConfig) -> Self {
        Self {
            title: "New Chat".into(),
            title_set: false,
            messages: Vec::new(),
            config,
        }
    }

    /// True when the last message is a user message still waiting for a reply.
    pub fn has_pending_user_message(&self) -> bool {
        matches!(self.messages.last(), Some(m) if m.role == Role::User)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ModelDefinition {
    /// Display name.
    pub name: String,
    /// Identifier sent upstream.
    pub model: String,
    /// Index into the endpoint list.
    pub endpoint: usize,
    pub model_max_context: u32,
    pub model_max_tokens: u32,
    pub prompt_cost_1000: f64,
    pub completion_cost_1000: f64,
}

impl ModelDefinition {
    pub fn new(name: &str, model: &str, cost: (f64, f64)) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            endpoint: 0,
            model_max_context: 128_000,
            model_max_tokens: 4096,
            prompt_cost_1000: cost.0,
            completion_cost_1000: cost.1,
        }
    }

    fn unit_cost(&self) -> f64 {
        self.prompt_cost_1000 + self.completion_cost_1000
    }
}

/// Index of the cheapest model (prompt + completion cost), earliest on ties.
pub fn cheapest_model(models: &[ModelDefinition]) -> Option<usize> {
    models
        .iter()
        .enumerate()
        .min_by(|(ia, a), (ib, b)| {
            a.unit_cost()
                .total_cmp(&b.unit_cost())
                .then_with(|| ia.cmp(ib))
        })
        .map(|(i, _)| i)
}

#[derive(Debug, Deserialize)]
pub struct EndpointAuth {
    pub endpoint: String,
    #[serde(default, deserialize_with = "secret_opt")]
    pub api_key: Option<SecretString>,
}

fn secret_opt<'de, D: Deserializer<'de>>(d: D) -> Result<Option<SecretString>, D::Error> {
    Ok(Option::<String>::deserialize(d)?.map(SecretString::from))
}

impl EndpointAuth {
    pub fn new(endpoint: impl Into<String>, api_key: Option<&str>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.map(|k| SecretString::from(k.to_string())),
        }
    }

    /// The API key, treating an empty string as absent.
    pub fn key(&self) -> Option<&str> {
        self.api_key
            .as_ref()
            .map(|k| k.expose_secret())
            .filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}
