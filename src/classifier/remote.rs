use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{Classifier, ClassifierError};
use crate::core::ClassifierResult;

/// JSON client for an external model server.
///
/// `POST {endpoint}/predict` with `{"model": .., "features": [[..]]}`; the
/// server answers `{"results": [..]}` or `{"error": ..}`.
pub struct RemoteClassifier {
    url: String,
    client: Client,
    auth: Option<String>, // base64 encoded user:pass
    expected_features: usize,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    results: Vec<ClassifierResult>,
    #[serde(default)]
    error: Option<Value>,
}

impl RemoteClassifier {
    pub fn new(endpoint: &str, expected_features: usize) -> Self {
        Self {
            url: format!("{}/predict", endpoint.trim_end_matches('/')),
            client: Client::new(),
            auth: None,
            expected_features,
        }
    }

    pub fn with_basic_auth(mut self, user: &str, pass: &str) -> Self {
        use base64::{engine::general_purpose::STANDARD, Engine};
        self.auth = Some(STANDARD.encode(format!("{user}:{pass}")));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Classifier for RemoteClassifier {
    fn name(&self) -> &str {
        "remote"
    }

    fn expected_features(&self) -> usize {
        self.expected_features
    }

    fn is_loaded(&self) -> bool {
        true
    }

    async fn predict(
        &self,
        features: &[Vec<f64>],
        model: &str,
    ) -> Result<Vec<ClassifierResult>, ClassifierError> {
        let body = json!({
            "model": model,
            "features": features,
        });

        let mut req = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(auth) = &self.auth {
            req = req.header("Authorization", format!("Basic {auth}"));
        }

        let resp = req.send().await?;
        let parsed: PredictResponse = resp.json().await?;

        if let Some(err) = parsed.error.filter(|e| !e.is_null()) {
            let msg = match err {
                Value::String(s) => s,
                other => other.to_string(),
            };
            return Err(ClassifierError::Remote(msg));
        }
        Ok(parsed.results)
    }
}
