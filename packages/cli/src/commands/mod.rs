// ABOUTME: Command handlers for the sandpit CLI
// ABOUTME: Shared helpers for loading the template catalog

pub mod run;
pub mod templates;

use anyhow::{Context, Result};
use sandpit_config::constants::SANDPIT_TEMPLATES_FILE;
use sandpit_config::parse_env_optional;
use sandpit_sandbox::TemplateRegistry;
use std::path::{Path, PathBuf};

/// Load the catalog named on the command line, else `SANDPIT_TEMPLATES_FILE`, else the builtin one
pub fn load_templates(catalog: Option<&Path>) -> Result<TemplateRegistry> {
    let catalog = catalog
        .map(Path::to_path_buf)
        .or_else(|| parse_env_optional::<PathBuf>(SANDPIT_TEMPLATES_FILE));

    match catalog {
        Some(path) => TemplateRegistry::from_file(&path)
            .with_context(|| format!("Failed to load templates from {}", path.display())),
        None => TemplateRegistry::new().context("Failed to load builtin templates"),
    }
}
