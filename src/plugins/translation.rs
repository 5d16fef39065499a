//! Text translation.
//!
//! Language codes are validated against a fixed supported-language table.
//! The actual translation sits behind [`TranslationBackend`]; when no
//! backend is configured the plugin stays registered and returns a
//! structured unavailable error, so the schema keeps advertising the
//! capability while the deployment lacks a model.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::{json, Map, Value};

use crate::error::ToolError;
use crate::plugins::{opt_str, require_str};
use crate::registry::{
    FunctionSpec, Invocation, InvokeContext, ParamSpec, ParamType, Plugin, PluginDescriptor,
};

static LANGUAGES: Lazy<BTreeMap<&'static str, &'static str>> = Lazy::new(|| {
    BTreeMap::from([
        ("ar", "Arabic"),
        ("bg", "Bulgarian"),
        ("bn", "Bengali"),
        ("cs", "Czech"),
        ("da", "Danish"),
        ("de", "German"),
        ("el", "Greek"),
        ("en", "English"),
        ("es", "Spanish"),
        ("et", "Estonian"),
        ("fa", "Persian"),
        ("fi", "Finnish"),
        ("fr", "French"),
        ("he", "Hebrew"),
        ("hi", "Hindi"),
        ("hr", "Croatian"),
        ("hu", "Hungarian"),
        ("id", "Indonesian"),
        ("it", "Italian"),
        ("ja", "Japanese"),
        ("ko", "Korean"),
        ("lt", "Lithuanian"),
        ("lv", "Latvian"),
        ("ms", "Malay"),
        ("nl", "Dutch"),
        ("no", "Norwegian"),
        ("pl", "Polish"),
        ("pt", "Portuguese"),
        ("ro", "Romanian"),
        ("ru", "Russian"),
        ("sk", "Slovak"),
        ("sl", "Slovenian"),
        ("sr", "Serbian"),
        ("sv", "Swedish"),
        ("sw", "Swahili"),
        ("th", "Thai"),
        ("tr", "Turkish"),
        ("uk", "Ukrainian"),
        ("ur", "Urdu"),
        ("vi", "Vietnamese"),
        ("zh-cn", "Chinese (Simplified)"),
        ("zh-tw", "Chinese (Traditional)"),
    ])
});

#[derive(Debug, Clone)]
pub struct Translation {
    pub text: String,
    pub detected_source: String,
}

#[async_trait]
pub trait TranslationBackend: Send + Sync {
    async fn translate(
        &self,
        text: &str,
        source: &str,
        target: &str,
    ) -> Result<Translation, ToolError>;

    /// Identify the language of `text`, returned as a supported code.
    async fn detect(&self, text: &str) -> Result<String, ToolError>;
}

#[derive(Default)]
pub struct TranslationPlugin {
    backend: Option<Arc<dyn TranslationBackend>>,
}

impl TranslationPlugin {
    pub fn with_backend(backend: Arc<dyn TranslationBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }
}

pub fn language_name(code: &str) -> Option<&'static str> {
    LANGUAGES.get(code).copied()
}

#[async_trait]
impl Plugin for TranslationPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            name: "translation",
            description: "Translates text between supported languages",
            functions: vec![
                FunctionSpec {
                    name: "translate_text",
                    description: "Translate text into a target language",
                    params: vec![
                        ParamSpec::required("text", ParamType::String, "Text to translate"),
                        ParamSpec::required(
                            "target_language",
                            ParamType::String,
                            "Target language code, e.g. 'de' or 'ja'",
                        ),
                        ParamSpec::optional(
                            "source_language",
                            ParamType::String,
                            "Source language code, or 'auto' to detect",
                        )
                        .with_default(json!("auto")),
                    ],
                },
                FunctionSpec {
                    name: "detect_language",
                    description: "Identify the language a text is written in",
                    params: vec![ParamSpec::required(
                        "text",
                        ParamType::String,
                        "Text to identify",
                    )],
                },
                FunctionSpec {
                    name: "get_supported_languages",
                    description: "List the language codes translation accepts",
                    params: vec![],
                },
            ],
        }
    }

    async fn invoke(
        &self,
        _ctx: &InvokeContext,
        function: &str,
        args: Map<String, Value>,
    ) -> Result<Invocation, ToolError> {
        match function {
            "get_supported_languages" => {
                let languages: Vec<Value> = LANGUAGES
                    .iter()
                    .map(|(code, name)| json!({ "code": code, "name": name }))
                    .collect();
                Ok(Invocation::Immediate(json!({ "languages": languages })))
            }
            "detect_language" => {
                let text = require_str(&args, "text")?;
                if text.trim().is_empty() {
                    return Err(ToolError::invalid_argument("text", "must not be empty"));
                }
                let backend = self.backend.as_ref().ok_or_else(|| {
                    ToolError::Unavailable("translation backend not configured".into())
                })?;
                let code = backend.detect(text).await?.to_lowercase();
                Ok(Invocation::Immediate(json!({
                    "language": code,
                    "language_name": language_name(&code),
                })))
            }
            "translate_text" => {
                let text = require_str(&args, "text")?;
                if text.trim().is_empty() {
                    return Err(ToolError::invalid_argument("text", "must not be empty"));
                }
                let target = require_str(&args, "target_language")?.to_lowercase();
                let target_name = language_name(&target).ok_or_else(|| {
                    ToolError::invalid_argument(
                        "target_language",
                        format!("unsupported language code '{target}'"),
                    )
                })?;
                let source = opt_str(&args, "source_language")
                    .unwrap_or("auto")
                    .to_lowercase();
                if source != "auto" && language_name(&source).is_none() {
                    return Err(ToolError::invalid_argument(
                        "source_language",
                        format!("unsupported language code '{source}'"),
                    ));
                }

                let backend = self.backend.as_ref().ok_or_else(|| {
                    ToolError::Unavailable("translation backend not configured".into())
                })?;
                let translation = backend.translate(text, &source, &target).await?;
                Ok(Invocation::Immediate(json!({
                    "translated_text": translation.text,
                    "source_language": translation.detected_source,
                    "target_language": target,
                    "target_language_name": target_name,
                })))
            }
            other => Err(ToolError::UnknownFunction(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    struct UpperBackend;

    #[async_trait]
    impl TranslationBackend for UpperBackend {
        async fn translate(
            &self,
            text: &str,
            source: &str,
            _target: &str,
        ) -> Result<Translation, ToolError> {
            Ok(Translation {
                text: text.to_uppercase(),
                detected_source: if source == "auto" { "en".into() } else { source.into() },
            })
        }

        async fn detect(&self, text: &str) -> Result<String, ToolError> {
            Ok(if text.contains('ß') { "DE".into() } else { "en".into() })
        }
    }

    fn ctx() -> InvokeContext {
        InvokeContext {
            session_id: Uuid::new_v4(),
            call_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            sessions: Arc::new(crate::session::SessionManager::new()),
        }
    }

    fn args(text: &str, target: &str) -> Map<String, Value> {
        let mut args = Map::new();
        args.insert("text".into(), json!(text));
        args.insert("target_language".into(), json!(target));
        args
    }

    #[tokio::test]
    async fn missing_backend_is_a_structured_unavailable_error() {
        let plugin = TranslationPlugin::default();
        let err = plugin
            .invoke(&ctx(), "translate_text", args("hello", "de"))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Unavailable(_)));
        assert_eq!(err.code(), "unavailable");
    }

    #[tokio::test]
    async fn unknown_language_code_is_rejected_before_the_backend() {
        let plugin = TranslationPlugin::with_backend(Arc::new(UpperBackend));
        let err = plugin
            .invoke(&ctx(), "translate_text", args("hello", "xx"))
            .await
            .unwrap_err();
        match err {
            ToolError::InvalidArgument { name, .. } => assert_eq!(name, "target_language"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn translation_reports_detected_source() {
        let plugin = TranslationPlugin::with_backend(Arc::new(UpperBackend));
        let result = plugin
            .invoke(&ctx(), "translate_text", args("hello", "de"))
            .await
            .unwrap();
        match result {
            Invocation::Immediate(value) => {
                assert_eq!(value["translated_text"], "HELLO");
                assert_eq!(value["source_language"], "en");
                assert_eq!(value["target_language_name"], "German");
            }
            _ => panic!("expected immediate result"),
        }
    }

    #[tokio::test]
    async fn language_detection_normalizes_the_code_and_names_it() {
        let plugin = TranslationPlugin::with_backend(Arc::new(UpperBackend));
        let mut args = Map::new();
        args.insert("text".into(), json!("die Straße"));
        let result = plugin.invoke(&ctx(), "detect_language", args).await.unwrap();
        match result {
            Invocation::Immediate(value) => {
                assert_eq!(value["language"], "de");
                assert_eq!(value["language_name"], "German");
            }
            _ => panic!("expected immediate result"),
        }

        // Without a backend the function degrades like translate_text does.
        let plugin = TranslationPlugin::default();
        let mut args = Map::new();
        args.insert("text".into(), json!("hello"));
        let err = plugin
            .invoke(&ctx(), "detect_language", args)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unavailable");
    }

    #[tokio::test]
    async fn supported_languages_are_listed_in_code_order() {
        let plugin = TranslationPlugin::default();
        let result = plugin
            .invoke(&ctx(), "get_supported_languages", Map::new())
            .await
            .unwrap();
        match result {
            Invocation::Immediate(value) => {
                let codes: Vec<&str> = value["languages"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .map(|l| l["code"].as_str().unwrap())
                    .collect();
                let mut sorted = codes.clone();
                sorted.sort_unstable();
                assert_eq!(codes, sorted);
                assert!(codes.contains(&"ja"));
            }
            _ => panic!("expected immediate result"),
        }
    }
}
