mod alerts;
mod bridge;
mod cache;
mod classifier;
mod config;
mod core;
mod signals;

use std::io::Read;
use std::sync::Arc;

use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

use crate::bridge::BridgeError;
use crate::classifier::remote::RemoteClassifier;
use crate::classifier::{Classifier, NoModel};
use crate::config::{ClassifierConfig, Config};
use crate::core::pipeline::DetectionService;

const CONFIG_ENV: &str = "GREENSENTRY_CONFIG";

fn main() {
    // Logs go to stderr; stdout carries the response
    let filter = match "greensentry=info".parse::<Directive>() {
        Ok(directive) => EnvFilter::from_default_env().add_directive(directive),
        Err(_) => EnvFilter::from_default_env(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config_path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "config.toml".into());
    let config = Config::load(&config_path);
    tracing::debug!("Config: {:?}", config);

    match run(&config) {
        Ok(response) => println!("{response}"),
        Err(e) => {
            tracing::error!("Request failed: {e}");
            eprintln!("{}", bridge::error_response(&e));
            std::process::exit(1);
        }
    }
}

fn run(config: &Config) -> Result<serde_json::Value, BridgeError> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;

    let service = Arc::new(DetectionService::new(config, build_classifier(&config.classifier)));
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(bridge::handle(&service, &input))
}

fn build_classifier(config: &ClassifierConfig) -> Arc<dyn Classifier> {
    match &config.endpoint {
        Some(endpoint) => {
            let mut remote = RemoteClassifier::new(endpoint, config.expected_features);
            if let (Some(user), Some(pass)) = (&config.user, &config.password) {
                remote = remote.with_basic_auth(user, pass);
            }
            tracing::info!("Model server configured at {}", remote.url());
            Arc::new(remote)
        }
        None => {
            tracing::info!("No model server configured, running rule-only");
            Arc::new(NoModel)
        }
    }
}
