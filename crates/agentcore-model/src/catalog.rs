// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model catalog: static metadata (limits, modalities, prices) for known models.

use serde::{Deserialize, Serialize};

/// Input modalities supported by a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputModality {
    Text,
    Image,
}

fn default_input_modalities() -> Vec<InputModality> {
    vec![InputModality::Text]
}

/// Per-million-token USD prices used to derive [`crate::types::Cost`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PriceTable {
    #[serde(default)]
    pub input_per_million: f64,
    #[serde(default)]
    pub output_per_million: f64,
    #[serde(default)]
    pub cache_read_per_million: f64,
    #[serde(default)]
    pub cache_write_per_million: f64,
}

/// Metadata for a single model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelCatalogEntry {
    pub id: String,
    pub name: String,
    /// Provider identifier: "openai" | "anthropic" | "google" | "xai" | "groq" | "mock" | ...
    pub provider: String,
    pub context_window: u32,
    pub max_output_tokens: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_input_modalities")]
    pub input_modalities: Vec<InputModality>,
    #[serde(default)]
    pub reasoning: bool,
    #[serde(default)]
    pub prices: PriceTable,
}

impl ModelCatalogEntry {
    pub fn supports_images(&self) -> bool {
        self.input_modalities.contains(&InputModality::Image)
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    models: Vec<ModelCatalogEntry>,
}

/// Return all entries from the bundled static catalog.
pub fn static_catalog() -> Vec<ModelCatalogEntry> {
    let yaml = include_str!("../models.yaml");
    let catalog: CatalogFile = serde_yaml::from_str(yaml).expect("bundled models.yaml must be valid");
    catalog.models
}

pub fn lookup(provider: &str, model_id: &str) -> Option<ModelCatalogEntry> {
    static_catalog()
        .into_iter()
        .find(|e| e.provider == provider && (e.id == model_id || e.name == model_id))
}

pub fn lookup_by_model_name(model_name: &str) -> Option<ModelCatalogEntry> {
    static_catalog()
        .into_iter()
        .find(|e| e.id == model_name || e.name == model_name)
}

pub fn supports_images(provider: &str, model_id: &str) -> bool {
    lookup(provider, model_id).map(|e| e.supports_images()).unwrap_or(false)
}

pub fn context_window(provider: &str, model_id: &str, default: u32) -> u32 {
    lookup(provider, model_id).map(|e| e.context_window).unwrap_or(default)
}

pub fn max_output_tokens(provider: &str, model_id: &str, default: u32) -> u32 {
    lookup(provider, model_id).map(|e| e.max_output_tokens).unwrap_or(default)
}

// ── Unit tests ────────────────────────────────────────────────────────────────
