// ABOUTME: `sandpit templates`: prints the runtime template catalog as a table
// ABOUTME: Works without a container engine

use anyhow::Result;
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use sandpit_sandbox::TemplateRegistry;
use std::path::Path;

pub fn list_templates(catalog: Option<&Path>) -> Result<()> {
    let templates = super::load_templates(catalog)?;

    if templates.is_empty() {
        println!("{}", "No templates found".yellow());
        return Ok(());
    }

    println!("{}", "Runtime templates".blue().bold());
    println!();
    println!("{}", templates_table(&templates));
    println!("Total: {} templates", templates.len().to_string().cyan());

    Ok(())
}

fn templates_table(templates: &TemplateRegistry) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec!["Name", "Image", "Working dir", "Ports", "User", "Description"]);

    for template in templates.list() {
        let ports = if template.exposed_ports.is_empty() {
            "-".to_string()
        } else {
            template
                .exposed_ports
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };

        table.add_row(vec![
            template.name.clone(),
            template.image_ref.clone(),
            template.working_dir.clone(),
            ports,
            template.user.clone().unwrap_or_else(|| "-".to_string()),
            template.description.clone(),
        ]);
    }

    table
}
