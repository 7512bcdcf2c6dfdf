// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;

use crate::{
    catalog::{InputModality, ModelCatalogEntry},
    event::EventStream,
    CompletionRequest, ModelDescriptor,
};

/// One wire-protocol adapter. `stream` is the sole required operation: take
/// a normalized request and return the already-reassembled event stream
/// (C2) — the adapter itself owns SSE/NDJSON parsing, tool-call argument
/// assembly, and stop-reason/usage normalization (§4.2).
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Logical provider id, e.g. "anthropic", "groq", "github-copilot".
    fn name(&self) -> &str;

    /// Model identifier as sent on the wire.
    fn model_name(&self) -> &str;

    /// Issue the request and return a stream of assistant-turn events.
    /// Errors returned here are request-construction/connection failures
    /// that occur before any event could be produced; once streaming has
    /// started, failures surface as `AssistantStreamEvent::Error`.
    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<EventStream>;

    /// List all models available from this provider. Default: catalog only.
    async fn list_models(&self) -> anyhow::Result<Vec<ModelCatalogEntry>> {
        let provider = self.name();
        Ok(crate::catalog::static_catalog().into_iter().filter(|e| e.provider == provider).collect())
    }

    fn catalog_max_output_tokens(&self) -> Option<u32> {
        crate::catalog::lookup(self.name(), self.model_name()).map(|e| e.max_output_tokens)
    }

    fn catalog_context_window(&self) -> Option<u32> {
        crate::catalog::lookup(self.name(), self.model_name()).map(|e| e.context_window)
    }

    /// Input modalities for this provider/model, from the catalog. Defaults
    /// to text-only for unknown models, to avoid sending images they can't
    /// accept.
    fn input_modalities(&self) -> Vec<InputModality> {
        crate::catalog::lookup(self.name(), self.model_name())
            .map(|e| e.input_modalities)
            .unwrap_or_else(|| vec![InputModality::Text])
    }

    fn supports_images(&self) -> bool {
        self.input_modalities().contains(&InputModality::Image)
    }

    /// Detect context-overflow from a terminal provider error (§4.2 point 7).
    /// Default implementation checks the enumerated regex set shared across
    /// adapters; a provider may override to add its own pattern.
    fn is_overflow_error(&self, message: &str) -> bool {
        crate::overflow::is_overflow_message(message)
    }
}

/// Build a [`ModelDescriptor`] for a provider from the static catalog,
/// falling back to conservative defaults for models the catalog does not
/// list (e.g. a freshly released model the caller already knows the id of).
pub fn descriptor_for(provider: &dyn ModelProvider) -> ModelDescriptor {
    let entry = crate::catalog::lookup(provider.name(), provider.model_name());
    ModelDescriptor {
        api: entry
            .as_ref()
            .map(|e| e.provider.clone())
            .unwrap_or_else(|| provider.name().to_string()),
        provider: provider.name().to_string(),
        id: provider.model_name().to_string(),
        base_url: String::new(),
        max_tokens: entry.as_ref().map(|e| e.max_output_tokens).unwrap_or(4096),
        context_window: entry.as_ref().map(|e| e.context_window).unwrap_or(128_000),
        input_text: true,
        input_image: provider.supports_images(),
        reasoning: entry.as_ref().map(|e| e.reasoning).unwrap_or(false),
        headers: std::collections::HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProvider;

    #[test]
    fn descriptor_for_unknown_model_uses_conservative_defaults() {
        let provider = MockProvider;
        let d = descriptor_for(&provider);
        assert_eq!(d.provider, "mock");
        assert!(d.input_text);
    }
}
