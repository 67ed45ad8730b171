use serde::Deserialize;
use std::{fs, path::Path};

use crate::error::{CoreResult, KoalaError};
use crate::model::{ChatConfig, EndpointAuth, ModelDefinition};
use crate::stream::FlushPolicy;

/// Endpoint that refuses keyless requests.
pub const OFFICIAL_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total timeout for single-shot requests in milliseconds (default 60000ms).
    /// Streaming requests are never cut off by this.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct StreamCfg {
    /// Coalescing window for merging deltas; 0 merges after every read.
    #[serde(default)]
    pub flush_window_ms: u64,
}

impl StreamCfg {
    pub fn flush_policy(&self) -> FlushPolicy {
        FlushPolicy::from_window_ms(self.flush_window_ms)
    }
}

fn default_endpoints() -> Vec<EndpointAuth> {
    vec![EndpointAuth::new(OFFICIAL_ENDPOINT, None)]
}

fn default_models() -> Vec<ModelDefinition> {
    vec![
        ModelDefinition::new("gpt-4o", "gpt-4o", (0.1, 0.3)),
        ModelDefinition::new("gpt-4o-mini", "gpt-4o-mini", (0.1, 0.3)),
        ModelDefinition::new("o3-mini", "o3-mini", (0.5, 0.5)),
        ModelDefinition::new("gpt-3.5-turbo", "gpt-3.5-turbo", (0.1, 0.3)),
        ModelDefinition::new("claude-3-5-sonnet", "claude-3-5-sonnet-20241022", (0.1, 0.3)),
        ModelDefinition::new("deepseek-r1", "deepseek-reasoner", (0.1, 0.3)),
    ]
}

fn default_official_endpoint() -> String {
    OFFICIAL_ENDPOINT.to_string()
}

fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<EndpointAuth>,
    #[serde(default = "default_models")]
    pub models: Vec<ModelDefinition>,
    #[serde(default = "default_official_endpoint")]
    pub official_endpoint: String,
    /// Generate a title after the first reply of an untitled chat.
    #[serde(default)]
    pub auto_title: bool,
    /// Forward usage to the accounting sink.
    #[serde(default)]
    pub count_total_tokens: bool,
    /// Language named in the title prompt.
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub default_chat_config: ChatConfig,
    #[serde(default)]
    pub stream: StreamCfg,
    /// HTTP client configuration (timeouts, pooling). Missing in older configs → defaults.
    #[serde(default)]
    pub http: HttpCfg,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            models: default_models(),
            official_endpoint: default_official_endpoint(),
            auto_title: false,
            count_total_tokens: false,
            language: default_language(),
            default_chat_config: ChatConfig::default(),
            stream: StreamCfg::default(),
            http: HttpCfg::default(),
        }
    }
}

impl Settings {
    /// Load settings from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(KoalaError::from)?;
        let s = std::str::from_utf8(&bytes).map_err(|e| KoalaError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str::<Self>(s).map_err(|e| KoalaError::Other(e.into()))?
            }
            Some("toml") => toml::from_str::<Self>(s).map_err(|e| KoalaError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| KoalaError::Other(e.into()))
                .or_else(|_| toml::from_str::<Self>(s).map_err(|e| KoalaError::Other(e.into())))?,
        };
        Ok(cfg)
    }

    /// Resolve a model by its selection index.
    pub fn model(&self, index: usize) -> CoreResult<&ModelDefinition> {
        self.models.get(index).ok_or_else(|| {
            KoalaError::Validation(format!(
                "model selection {index} out of range ({} models configured)",
                self.models.len()
            ))
        })
    }

    /// Resolve the credentials slot a model points at.
    pub fn endpoint(&self, index: usize) -> CoreResult<&EndpointAuth> {
        self.endpoints.get(index).ok_or_else(|| {
            KoalaError::Validation(format!(
                "endpoint {index} out of range ({} endpoints configured)",
                self.endpoints.len()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn load_from_json() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("koala.json");
        let json = r#"{
          "endpoints": [
            {"endpoint": "https://free.example/v1/chat/completions"},
            {"endpoint": "https://acme.openai.azure.com", "api_key": "sk-test"}
          ],
          "models": [
            {"name":"gpt-3.5-turbo","model":"gpt-3.5-turbo","endpoint":1,
             "model_max_context":16385,"model_max_tokens":4096,
             "prompt_cost_1000":0.0015,"completion_cost_1000":0.002}
          ],
          "auto_title": true,
          "stream": {"flush_window_ms": 40}
        }"#;
        fs::write(&file, json).unwrap();
        let cfg = Settings::from_path(&file).unwrap();
        assert_eq!(cfg.endpoints.len(), 2);
        assert_eq!(cfg.endpoints[0].key(), None);
        assert_eq!(cfg.endpoints[1].key(), Some("sk-test"));
        assert_eq!(cfg.models[0].endpoint, 1);
        assert!(cfg.auto_title);
        assert!(!cfg.count_total_tokens);
        assert_eq!(cfg.language, "en");
        assert_eq!(cfg.official_endpoint, OFFICIAL_ENDPOINT);
        assert_eq!(cfg.stream.flush_policy(), FlushPolicy::Coalesce(Duration::from_millis(40)));
        assert_eq!(cfg.http.connect_timeout_ms, 5_000);
        assert_eq!(cfg.http.request_timeout_ms, 60_000);
        assert_eq!(cfg.http.pool_max_idle_per_host, None);
    }

    #[test]
    fn load_from_toml() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("koala.toml");
        let toml = r#"
count_total_tokens = true
language = "de"

[[endpoints]]
endpoint = "https://free.example/v1/chat/completions"
api_key = ""

[default_chat_config]
temperature = 0.5

[http]
request_timeout_ms = 1000
"#;
        fs::write(&file, toml).unwrap();
        let cfg = Settings::from_path(&file).unwrap();
        assert!(cfg.count_total_tokens);
        assert_eq!(cfg.language, "de");
        assert_eq!(cfg.endpoints[0].key(), None);
        assert_eq!(cfg.default_chat_config.temperature, 0.5);
        assert_eq!(cfg.default_chat_config.max_tokens, 4096);
        assert_eq!(cfg.http.request_timeout_ms, 1000);
        assert_eq!(cfg.stream.flush_policy(), FlushPolicy::EveryRead);
        assert!(!cfg.models.is_empty());
    }

    #[test]
    fn missing_file_returns_io_error() {
        let missing = std::path::PathBuf::from("/definitely/not/here/koala-missing.json");
        let err = Settings::from_path(&missing).unwrap_err();
        match err {
            KoalaError::Io(_) => {}
            other => panic!("expected Io error, got: {:?}", other),
        }
    }

    #[test]
    fn bad_utf8_returns_other_error() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("bad.bin");
        fs::write(&file, vec![0xff, 0xfe, 0xfd, 0x00, 0x80]).unwrap();
        let err = Settings::from_path(&file).unwrap_err();
        match err {
            KoalaError::Other(_) => {}
            other => panic!("expected Other(utf8) error, got: {:?}", other),
        }
    }

    #[test]
    fn unknown_extension_falls_back_to_json_then_toml() {
        let dir = tempdir().unwrap();
        let json_path = dir.path().join("koala.conf");
        fs::write(&json_path, r#"{"auto_title": true}"#).unwrap();
        assert!(Settings::from_path(&json_path).unwrap().auto_title);

        let toml_path = dir.path().join("koala2.conf");
        fs::write(&toml_path, "auto_title = true\n").unwrap();
        assert!(Settings::from_path(&toml_path).unwrap().auto_title);
    }

    #[test]
    fn index_lookups_fail_fast() {
        let cfg = Settings::default();
        assert!(cfg.model(0).is_ok());
        assert!(matches!(cfg.model(99), Err(KoalaError::Validation(_))));
        assert!(matches!(cfg.endpoint(5), Err(KoalaError::Validation(_))));
    }
}
