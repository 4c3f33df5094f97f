use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{EngineLoader, TranslationEngine};
use crate::config::TranslateConfig;
use crate::error::{CriticError, Result};

#[derive(Debug, Clone, Serialize)]
pub struct InferenceRequest<'a> {
    pub inputs: &'a str,
    pub parameters: InferenceParameters,
}

#[derive(Debug, Clone, Serialize)]
pub struct InferenceParameters {
    pub max_length: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InferenceOutput {
    pub translation_text: String,
}

/// One translation model served by a Hugging Face-compatible inference endpoint
pub struct HttpEngine {
    client: Client,
    url: String,
    token: Option<String>,
}

#[async_trait]
impl TranslationEngine for HttpEngine {
    async fn translate(&self, text: &str, max_length: usize) -> Result<String> {
        let request = InferenceRequest {
            inputs: text,
            parameters: InferenceParameters { max_length },
        };

        debug!("Sending translation request to: {}", self.url);
        let mut builder = self.client.post(&self.url).json(&request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| CriticError::Translation(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(CriticError::Translation(format!(
                "Inference API error {}: {}",
                status, error_text
            )));
        }

        let outputs: Vec<InferenceOutput> = response
            .json()
            .await
            .map_err(|e| CriticError::Translation(format!("Failed to parse response: {}", e)))?;

        first_translation(outputs)
    }
}

fn first_translation(outputs: Vec<InferenceOutput>) -> Result<String> {
    outputs
        .into_iter()
        .next()
        .map(|o| o.translation_text.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| CriticError::Translation("Empty translation received".to_string()))
}

/// Hands out HTTP engines, optionally checking the model exists on the hub first
pub struct HttpEngineLoader {
    client: Client,
    inference_endpoint: String,
    hub_endpoint: String,
    verify_models: bool,
    token: Option<String>,
}

impl HttpEngineLoader {
    pub fn new(config: &TranslateConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            inference_endpoint: config.inference_endpoint.trim_end_matches('/').to_string(),
            hub_endpoint: config.hub_endpoint.trim_end_matches('/').to_string(),
            verify_models: config.verify_models,
            token: config
                .api_token
                .clone()
                .or_else(|| std::env::var("HF_TOKEN").ok())
                .filter(|t| !t.is_empty()),
        })
    }

    pub fn model_url(&self, model: &str) -> String {
        format!("{}/models/{}", self.inference_endpoint, model)
    }

    async fn verify(&self, model: &str) -> Result<()> {
        let url = format!("{}/api/models/{}", self.hub_endpoint, model);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CriticError::Translation(format!("Failed to reach model hub: {}", e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(CriticError::Translation(format!(
                "Translation model '{}' not found ({})",
                model,
                response.status()
            )))
        }
    }
}

#[async_trait]
impl EngineLoader for HttpEngineLoader {
    async fn load(&self, model: &str) -> Result<Arc<dyn TranslationEngine>> {
        if self.verify_models {
            self.verify(model).await?;
        }
        info!("Translation model '{}' ready", model);

        Ok(Arc::new(HttpEngine {
            client: self.client.clone(),
            url: self.model_url(model),
            token: self.token.clone(),
        }))
    }
}
