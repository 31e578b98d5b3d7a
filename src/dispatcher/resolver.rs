//! Derives follow-on tasks from a completed task's output
//!
//! List-type sites produce an artifact (a collected URL list) that seeds a
//! detail scrape on their counterpart site. The catalog declares which site
//! feeds which; everything else completes without offspring.

use crate::models::{Task, TaskSpec};
use crate::registry::catalog::Catalog;

/// Maps a completed task's output to the child task it should enqueue
pub struct DependencyResolver {
    catalog: Catalog,
}

impl DependencyResolver {
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog }
    }

    /// Child spec for a completed `parent` whose run produced `output_ref`.
    /// `None` when the parent's site has no detail counterpart.
    pub fn child_spec(&self, parent: &Task, output_ref: &str) -> Option<TaskSpec> {
        let detail_site = self.catalog.detail_site_for(&parent.site)?;
        let defaults = self.catalog.site_defaults(detail_site);

        Some(TaskSpec {
            site: detail_site.to_string(),
            city: parent.city.clone(),
            operation: parent.operation.clone(),
            product: parent.product.clone(),
            // the collected list is the detail scrape's input
            url: output_ref.to_string(),
            priority: defaults.map(|d| d.priority).unwrap_or(parent.priority),
            interval_days: defaults
                .map(|d| d.interval_days)
                .unwrap_or(parent.interval_days),
        })
    }
}
