use serde_json::Value;

use crate::error::{CoreResult, KoalaError};
use crate::model::{ChatConfig, Message, ModelDefinition, cheapest_model};

/// API version appended to Azure-style deployment URLs.
pub const AZURE_API_VERSION: &str = "2023-03-15-preview";
/// Header carrying anti-abuse material when no API key is configured.
pub const CHALLENGE_HEADER: &str = "X-Challenge-Token";

/// Configuration fields that never leave the process.
const LOCAL_ONLY_FIELDS: [&str; 2] = ["model_selection", "max_context"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Stream,
    Single,
}

/// Everything needed to build one completion call.
#[derive(Debug, Clone, Copy)]
pub struct CompletionParams<'a> {
    pub endpoint: &'a str,
    pub messages: &'a [Message],
    pub config: &'a ChatConfig,
    pub model: &'a ModelDefinition,
    pub api_key: Option<&'a str>,
    pub challenge_token: Option<&'a str>,
    pub extra_headers: &'a [(String, String)],
    pub kind: CallKind,
}

/// Transport-agnostic outbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
    pub stream: bool,
    /// The `user` value placed in the body; fresh on every build.
    pub correlation_id: String,
}

impl RequestDescriptor {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub fn is_azure_endpoint(endpoint: &str) -> bool {
    endpoint.contains("openai.azure.com")
}

/// Azure deployments use dotless aliases for some model names.
pub fn deployment_alias(model_name: &str) -> &str {
    match model_name {
        "gpt-3.5-turbo" => "gpt-35-turbo",
        "gpt-3.5-turbo-16k" => "gpt-35-turbo-16k",
        other => other,
    }
}

/// Append the deployment path unless the URL already ends with it.
pub fn rewrite_azure_url(endpoint: &str, deployment: &str) -> String {
    let path = format!(
        "openai/deployments/{deployment}/chat/completions?api-version={AZURE_API_VERSION}"
    );
    if endpoint.ends_with(&path) {
        return endpoint.to_string();
    }
    let mut url = endpoint.to_string();
    if !url.ends_with('/') {
        url.push('/');
    }
    url.push_str(&path);
    url
}

fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    match headers.iter_mut().find(|slot| slot.0.eq_ignore_ascii_case(name)) {
        Some(slot) => slot.1 = value.to_string(),
        None => headers.push((name.to_string(), value.to_string())),
    }
}

pub fn build(p: &CompletionParams<'_>) -> CoreResult<RequestDescriptor> {
    let mut url = p.endpoint.to_string();
    let mut headers = Vec::new();
    set_header(&mut headers, "Content-Type", "application/json");
    for (k, v) in p.extra_headers {
        set_header(&mut headers, k, v);
    }

    match p.api_key {
        Some(key) => {
            set_header(&mut headers, "Authorization", &format!("Bearer {key}"));
            if is_azure_endpoint(&url) {
                set_header(&mut headers, "api-key", key);
                url = rewrite_azure_url(&url, deployment_alias(&p.model.name));
            }
        }
        None => {
            if let Some(token) = p.challenge_token {
                set_header(&mut headers, CHALLENGE_HEADER, token);
            }
        }
    }

    let correlation_id = uuid::Uuid::new_v4().to_string();
    let mut body = match serde_json::to_value(p.config) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            return Err(KoalaError::Validation(format!(
                "chat config serialized to {other}, expected an object"
            )));
        }
        Err(e) => return Err(KoalaError::Other(e.into())),
    };
    for field in LOCAL_ONLY_FIELDS {
        body.remove(field);
    }
    body.insert("model".into(), Value::String(p.model.model.clone()));
    body.insert("user".into(), Value::String(correlation_id.clone()));
    body.insert(
        "messages".into(),
        serde_json::to_value(p.messages).map_err(|e| KoalaError::Other(e.into()))?,
    );
    let stream = p.kind == CallKind::Stream;
    if stream {
        body.insert("stream".into(), Value::Bool(true));
    }

    Ok(RequestDescriptor {
        url,
        headers,
        body: Value::Object(body),
        stream,
        correlation_id,
    })
}

/// Single-shot title request: default configuration and the cheapest model.
/// Returns the descriptor and the index of the model it targets.
pub fn build_title(
    endpoint: &str,
    messages: &[Message],
    models: &[ModelDefinition],
    api_key: Option<&str>,
    challenge_token: Option<&str>,
) -> CoreResult<(RequestDescriptor, usize)> {
    let index = cheapest_model(models)
        .ok_or_else(|| KoalaError::Validation("no model definitions configured".into()))?;
    let model = &models[index];
    let config = ChatConfig {
        model: model.model.clone(),
        model_selection: index,
        ..ChatConfig::default()
    };
    let desc = build(&CompletionParams {
        endpoint,
        messages,
        config: &config,
        model,
        api_key,
        challenge_token,
        extra_headers: &[],
        kind: CallKind::Single,
    })?;
    Ok((desc, index))
}
