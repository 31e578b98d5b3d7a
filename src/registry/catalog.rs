//! Typed site catalog that seeds the task registry
//!
//! A catalog names the sites being scraped (with per-site priority, re-scrape
//! interval and optional detail-scrape counterpart) and the concrete
//! (site, city, operation, product) → URL entries to schedule. It is loaded
//! from TOML and imported into the registry idempotently.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::models::TaskSpec;

const DEFAULT_PRIORITY: u32 = 10;
const DEFAULT_INTERVAL_DAYS: u32 = 30;

/// Per-site scheduling defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteDefaults {
    /// Site name as used in task records
    pub name: String,

    /// Lower runs first
    #[serde(default = "default_priority")]
    pub priority: u32,

    /// Days between re-scrapes of a completed task
    #[serde(default = "default_interval")]
    pub interval_days: u32,

    /// Site whose tasks are derived from this site's output (URL lists
    /// feeding a detail scrape), if any
    #[serde(default)]
    pub detail_site: Option<String>,
}

fn default_priority() -> u32 {
    DEFAULT_PRIORITY
}

fn default_interval() -> u32 {
    DEFAULT_INTERVAL_DAYS
}

/// One concrete scrape target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub site: String,
    pub city: String,
    pub operation: String,
    pub product: String,
    pub url: String,

    /// Override of the site default
    #[serde(default)]
    pub priority: Option<u32>,

    /// Override of the site default
    #[serde(default)]
    pub interval_days: Option<u32>,
}

/// Site catalog: site defaults plus scrape targets
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    sites: Vec<SiteDefaults>,

    #[serde(default)]
    tasks: Vec<CatalogEntry>,
}

impl Catalog {
    /// Load a catalog from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog file: {}", path.display()))?;
        let catalog: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse catalog file: {}", path.display()))?;
        Ok(catalog)
    }

    /// The built-in catalog of supported listing sites. Targets still come
    /// from a user catalog; this only carries the per-site defaults.
    pub fn builtin() -> Self {
        let site = |name: &str, priority: u32, interval_days: u32, detail: Option<&str>| {
            SiteDefaults {
                name: name.to_string(),
                priority,
                interval_days,
                detail_site: detail.map(String::from),
            }
        };

        Self {
            sites: vec![
                site("inmuebles24", 1, 15, Some("inmuebles24_det")),
                site("inmuebles24_det", 1, 15, None),
                site("casas_y_terrenos", 2, 7, None),
                site("lamudi", 3, 10, Some("lamudi_det")),
                site("lamudi_det", 3, 10, None),
                site("mitula", 4, 14, None),
                site("propiedades", 5, 21, None),
                site("trovit", 6, 14, None),
            ],
            tasks: Vec::new(),
        }
    }

    /// Merge `other`'s sites and tasks over this catalog. Sites sharing a
    /// name are replaced by the incoming definition.
    pub fn merged_with(mut self, other: Catalog) -> Self {
        for incoming in other.sites {
            if let Some(existing) = self.sites.iter_mut().find(|s| s.name == incoming.name) {
                *existing = incoming;
            } else {
                self.sites.push(incoming);
            }
        }
        self.tasks.extend(other.tasks);
        self
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.tasks
    }

    pub fn sites(&self) -> &[SiteDefaults] {
        &self.sites
    }

    /// Scheduling defaults for a site, if declared
    pub fn site_defaults(&self, site: &str) -> Option<&SiteDefaults> {
        self.sites.iter().find(|s| s.name == site)
    }

    /// Detail-scrape counterpart of a site, if declared
    pub fn detail_site_for(&self, site: &str) -> Option<&str> {
        self.site_defaults(site)
            .and_then(|s| s.detail_site.as_deref())
    }

    /// Resolve every entry into a full task spec, applying per-entry
    /// overrides over site defaults
    pub fn to_specs(&self) -> Vec<TaskSpec> {
        self.tasks
            .iter()
            .map(|entry| {
                let defaults = self.site_defaults(&entry.site);
                TaskSpec {
                    site: entry.site.clone(),
                    city: entry.city.clone(),
                    operation: entry.operation.clone(),
                    product: entry.product.clone(),
                    url: entry.url.clone(),
                    priority: entry
                        .priority
                        .or(defaults.map(|d| d.priority))
                        .unwrap_or(DEFAULT_PRIORITY),
                    interval_days: entry
                        .interval_days
                        .or(defaults.map(|d| d.interval_days))
                        .unwrap_or(DEFAULT_INTERVAL_DAYS),
                }
            })
            .collect()
    }
}
