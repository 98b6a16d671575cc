use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
        CreateChatCompletionRequestArgs, ResponseFormat, ResponseFormatJsonSchema,
    },
    Client,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;

use crate::error::AppError;
use crate::utils::config::AppConfig;

/// Sampling knobs for a single generation call (§4.1, §6 `generator.*`).
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub max_new_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub stop: Vec<String>,
}

impl GenerationParams {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_new_tokens: config.generator_max_new_tokens,
            temperature: config.generator_temperature,
            top_p: config.generator_top_p,
            stop: config.generator_stop.clone(),
        }
    }
}

/// A single reference string the generator cited among the supplied context.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneratedReference {
    pub reference: String,
}

/// The generator's grounded answer plus whatever references it cited,
/// decoded from the model's structured JSON response rather than scraped
/// from free text.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneratedAnswer {
    pub answer: String,
    #[serde(default)]
    pub references: Vec<GeneratedReference>,
}

/// Capability interface for grounded answer generation (§4.1). A single
/// production implementation (`OpenAiGenerator`) talks to a remote chat
/// completion endpoint via `async-openai`; test doubles implement the same
/// trait without a network call.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        system_prompt: &str,
        user_message: &str,
        params: &GenerationParams,
    ) -> Result<GeneratedAnswer, AppError>;
}

/// Remote chat-completion generator. Device selection does not apply here —
/// this is a network call, not a local model handle (§4.1).
pub struct OpenAiGenerator {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiGenerator {
    pub fn new(config: &AppConfig) -> Self {
        let mut openai_config = OpenAIConfig::new().with_api_base(config.openai_base_url.clone());
        if !config.openai_api_key.is_empty() {
            openai_config = openai_config.with_api_key(config.openai_api_key.clone());
        }

        Self {
            client: Client::with_config(openai_config),
            model: config.generator_model.clone(),
        }
    }
}

fn response_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "answer": { "type": "string" },
            "references": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": { "reference": { "type": "string" } },
                    "required": ["reference"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["answer", "references"],
        "additionalProperties": false
    })
}

#[async_trait]
impl Generator for OpenAiGenerator {
    #[instrument(skip(self, system_prompt, user_message), fields(model = %self.model))]
    async fn generate(
        &self,
        system_prompt: &str,
        user_message: &str,
        params: &GenerationParams,
    ) -> Result<GeneratedAnswer, AppError> {
        let response_format = ResponseFormat::JsonSchema {
            json_schema: ResponseFormatJsonSchema {
                description: Some("Grounded answer generation".into()),
                name: "grounded_answer".into(),
                schema: Some(response_schema()),
                strict: Some(true),
            },
        };

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(&self.model)
            .messages([
                ChatCompletionRequestSystemMessage::from(system_prompt).into(),
                ChatCompletionRequestUserMessage::from(user_message).into(),
            ])
            .response_format(response_format)
            .temperature(params.temperature)
            .top_p(params.top_p)
            .max_tokens(params.max_new_tokens);
        if !params.stop.is_empty() {
            builder.stop(params.stop.clone());
        }
        let request = builder.build()?;

        let response = self.client.chat().create(request).await?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_ref())
            .ok_or_else(|| AppError::SchemaMismatch("no content in generator response".into()))?;

        serde_json::from_str::<GeneratedAnswer>(content)
            .map_err(|e| AppError::SchemaMismatch(format!("generator response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_params_derive_from_config() {
        let mut config = AppConfig::default();
        config.generator_temperature = 0.0;
        config.generator_max_new_tokens = 256;
        let params = GenerationParams::from_config(&config);
        assert_eq!(params.max_new_tokens, 256);
        assert_eq!(params.temperature, 0.0);
    }

    #[test]
    fn response_schema_requires_answer_and_references() {
        let schema = response_schema();
        let required = schema["required"].as_array().unwrap();
        assert!(required.iter().any(|v| v == "answer"));
        assert!(required.iter().any(|v| v == "references"));
    }
}
