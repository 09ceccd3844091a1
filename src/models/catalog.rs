//! Catalog of provisionable models
//!
//! The catalog is read-only here. Installed names match an entry either
//! exactly or as `<entry>:<tag>`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Catalog classification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCategory {
    /// Eligible as a default chat/assistant model
    #[default]
    #[serde(alias = "chat")]
    Conversational,
    Embedding,
    Vision,
    #[serde(other)]
    Other,
}

/// A catalog definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    #[serde(rename = "showname", default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Approximate download size as displayed, e.g. "4.7GB"
    #[serde(default)]
    pub size: String,
    #[serde(rename = "type", default)]
    pub category: ModelCategory,
    #[serde(default)]
    pub source: String,
}

impl CatalogEntry {
    pub fn new(name: impl Into<String>, category: ModelCategory) -> Self {
        Self {
            name: name.into(),
            display_name: String::new(),
            description: String::new(),
            tags: Vec::new(),
            size: String::new(),
            category,
            source: String::new(),
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    /// `name` itself, or `name:<anything>`
    pub fn matches(&self, installed_name: &str) -> bool {
        match installed_name.strip_prefix(self.name.as_str()) {
            Some("") => true,
            Some(rest) => rest.starts_with(':'),
            None => false,
        }
    }

    pub fn display_name(&self) -> &str {
        if self.display_name.is_empty() {
            &self.name
        } else {
            &self.display_name
        }
    }

    pub fn is_conversational(&self) -> bool {
        self.category == ModelCategory::Conversational
    }
}

/// Catalog entry for an installed name, preferring an exact match
pub fn find_entry<'a>(catalog: &'a [CatalogEntry], installed_name: &str) -> Option<&'a CatalogEntry> {
    catalog
        .iter()
        .find(|e| e.name == installed_name)
        .or_else(|| catalog.iter().find(|e| e.matches(installed_name)))
}

/// Human-readable name for messages, falling back to the raw identifier
pub fn display_name(catalog: &[CatalogEntry], model: &str) -> String {
    find_entry(catalog, model)
        .map(|e| e.display_name().to_string())
        .unwrap_or_else(|| model.to_string())
}

/// Where the catalog comes from
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn load(&self) -> Result<Vec<CatalogEntry>>;
}

/// Catalog stored as a JSON array on disk
pub struct JsonFileCatalog {
    path: PathBuf,
}

impl JsonFileCatalog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl CatalogSource for JsonFileCatalog {
    async fn load(&self) -> Result<Vec<CatalogEntry>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read catalog file: {:?}", self.path))?;
        let entries: Vec<CatalogEntry> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse catalog file: {:?}", self.path))?;

        tracing::debug!(path = ?self.path, entries = entries.len(), "Catalog loaded");
        Ok(entries)
    }
}

/// Fixed in-memory catalog
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog(pub Vec<CatalogEntry>);

#[async_trait]
impl CatalogSource for StaticCatalog {
    async fn load(&self) -> Result<Vec<CatalogEntry>> {
        Ok(self.0.clone())
    }
}
