use anyhow::Result;
use std::path::Path;

use crate::config::Config;
use crate::registry::catalog::Catalog;
use crate::registry::TaskRegistry;

/// Import a site catalog into the registry. Existing tasks (same natural
/// key) are left untouched, so re-importing an updated catalog is safe.
pub fn import(config: &Config, catalog_path: &Path) -> Result<()> {
    let user = Catalog::from_file(catalog_path)?;
    let catalog = Catalog::builtin().merged_with(user);

    let registry = TaskRegistry::open(&config.storage.registry_path)?;
    let inserted = registry.import_catalog(&catalog)?;
    let total = registry.counts()?.total();

    println!(
        "Imported {} new task(s) from {} ({} entries); registry now holds {} task(s)",
        inserted,
        catalog_path.display(),
        catalog.entries().len(),
        total
    );
    Ok(())
}
