pub mod openai;
pub mod retry;
pub mod sse;

use std::sync::Arc;

use vigil_core::config::ModelConfig;
use vigil_core::traits::Reasoner;

pub use openai::OpenAiReasoner;
pub use retry::RetryingReasoner;

/// Build the reasoner for a model config, wrapped in retries when configured.
///
/// Every provider name maps to the OpenAI-compatible client.
pub fn create_reasoner(config: &ModelConfig, system_prompt: Option<&str>) -> Arc<dyn Reasoner> {
    let mut client = OpenAiReasoner::new(config.clone());
    if let Some(prompt) = system_prompt {
        client = client.with_system_prompt(prompt);
    }
    match config.retry.clone() {
        Some(retry) => Arc::new(RetryingReasoner::new(Box::new(client), retry)),
        None => Arc::new(client),
    }
}
