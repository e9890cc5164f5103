use serde::{Deserialize, Serialize};

use crate::providers::{AnthropicChat, OpenAiChat, ProviderAdapter};

pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

pub const ANTHROPIC_MODELS: &[&str] = &[
    "claude-3-opus-20240229",
    "claude-3-sonnet-20240229",
    "claude-3-haiku-20240307",
];

pub const OPENAI_MODELS: &[&str] = &["gpt-3.5-turbo", "gpt-4", "gpt-4o"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFamily {
    OpenAi,
    Anthropic,
}

impl ProviderFamily {
    pub fn for_model(model: &str) -> Option<Self> {
        if ANTHROPIC_MODELS.contains(&model) {
            Some(Self::Anthropic)
        } else if OPENAI_MODELS.contains(&model) {
            Some(Self::OpenAi)
        } else {
            None
        }
    }
}

/// Where one request goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub family: ProviderFamily,
    pub model: String,
    /// The requested model was not recognized and the default took its place.
    pub fallback: bool,
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderCredentials {
    pub openai_api_key: String,
    pub anthropic_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub anthropic_base_url: Option<String>,
}

impl std::fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("openai_api_key", &"<redacted>")
            .field(
                "anthropic_api_key",
                &self.anthropic_api_key.as_ref().map(|_| "<redacted>"),
            )
            .field("openai_base_url", &self.openai_base_url)
            .field("anthropic_base_url", &self.anthropic_base_url)
            .finish()
    }
}

/// Static model table. Adapters are built per request from the shared
/// HTTP client, so they carry no state of their own.
#[derive(Clone, Debug)]
pub struct ProviderRouter {
    credentials: ProviderCredentials,
    http: reqwest::Client,
    default_model: String,
}

impl ProviderRouter {
    pub fn new(credentials: ProviderCredentials, http: reqwest::Client) -> Self {
        Self {
            credentials,
            http,
            default_model: DEFAULT_MODEL.to_string(),
        }
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Never fails: an unrecognized model goes to the OpenAI family with the
    /// default model.
    pub fn route(&self, model: Option<&str>) -> Route {
        let requested = model.map(str::trim).filter(|model| !model.is_empty());
        let Some(requested) = requested else {
            return self.default_route(false);
        };
        match ProviderFamily::for_model(requested) {
            Some(family) => Route {
                family,
                model: requested.to_string(),
                fallback: false,
            },
            None => {
                tracing::debug!(
                    requested_model = requested,
                    fallback_model = %self.default_model,
                    "unrecognized model, using default"
                );
                self.default_route(true)
            }
        }
    }

    fn default_route(&self, fallback: bool) -> Route {
        Route {
            family: ProviderFamily::for_model(&self.default_model)
                .unwrap_or(ProviderFamily::OpenAi),
            model: self.default_model.clone(),
            fallback,
        }
    }

    pub fn adapter(&self, route: &Route) -> ProviderAdapter {
        match route.family {
            ProviderFamily::Anthropic => {
                let api_key = self
                    .credentials
                    .anthropic_api_key
                    .clone()
                    .unwrap_or_default();
                let mut chat = AnthropicChat::new(api_key, route.model.clone())
                    .with_http_client(self.http.clone());
                if let Some(base_url) = self.credentials.anthropic_base_url.as_deref() {
                    chat = chat.with_base_url(base_url);
                }
                ProviderAdapter::Anthropic(chat)
            }
            ProviderFamily::OpenAi => {
                let mut chat = OpenAiChat::new(
                    self.credentials.openai_api_key.clone(),
                    route.model.clone(),
                )
                .with_http_client(self.http.clone());
                if let Some(base_url) = self.credentials.openai_base_url.as_deref() {
                    chat = chat.with_base_url(base_url);
                }
                ProviderAdapter::OpenAi(chat)
            }
        }
    }

    pub fn resolve(&self, model: Option<&str>) -> ProviderAdapter {
        let route = self.route(model);
        self.adapter(&route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ChatProvider;

    fn router() -> ProviderRouter {
        ProviderRouter::new(
            ProviderCredentials {
                openai_api_key: "sk-openai".to_string(),
                anthropic_api_key: Some("sk-ant".to_string()),
                ..ProviderCredentials::default()
            },
            reqwest::Client::new(),
        )
    }

    #[test]
    fn known_models_route_to_their_family() {
        let router = router();
        for model in ANTHROPIC_MODELS {
            let route = router.route(Some(model));
            assert_eq!(route.family, ProviderFamily::Anthropic);
            assert_eq!(route.model, *model);
            assert!(!route.fallback);
        }
        for model in OPENAI_MODELS {
            assert_eq!(router.route(Some(model)).family, ProviderFamily::OpenAi);
        }
    }

    #[test]
    fn unknown_model_falls_back_to_the_default() {
        let route = router().route(Some("foo-bar"));
        assert_eq!(
            route,
            Route {
                family: ProviderFamily::OpenAi,
                model: DEFAULT_MODEL.to_string(),
                fallback: true,
            }
        );

        let adapter = router().resolve(Some("foo-bar"));
        assert_eq!(adapter.provider(), "openai");
        assert_eq!(adapter.model_id(), DEFAULT_MODEL);
    }

    #[test]
    fn missing_model_uses_the_default_without_flagging_fallback() {
        let route = router().with_default_model("gpt-4o").route(None);
        assert_eq!(route.model, "gpt-4o");
        assert!(!route.fallback);
        assert!(!router().route(Some("  ")).fallback);
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let rendered = format!("{:?}", router());
        assert!(!rendered.contains("sk-openai"));
        assert!(!rendered.contains("sk-ant"));
    }
}
