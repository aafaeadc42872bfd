use anyhow::Result;

use crate::config::Config;

/// `etl sources`: one line per configured endpoint and load table.
pub fn list_sources(config: &Config) -> Result<()> {
    println!("{:<12} {:<20} {:<20} {:<12} PAGE SIZE", "KIND", "SOURCE", "ENDPOINT", "INCREMENTAL");

    for (name, source) in &config.sources.rest {
        if source.endpoints.is_empty() {
            println!("{:<12} {:<20} {:<20}", "rest", name, "(no endpoints)");
        }
        for ep in &source.endpoints {
            println!(
                "{:<12} {:<20} {:<20} {:<12} {}",
                "rest",
                name,
                ep.name,
                incremental_label(ep.incremental.as_ref()),
                ep.pagination.page_size
            );
        }
    }

    match &config.sources.quickbooks {
        Some(qb) => {
            for entity in &qb.entities {
                println!(
                    "{:<12} {:<20} {:<20} {:<12} {}",
                    "quickbooks",
                    format!("{} ({})", qb.environment, qb.company_id),
                    entity.name,
                    incremental_label(entity.incremental.as_ref()),
                    qb.pagination.page_size
                );
            }
        }
        None => println!("{:<12} NOT CONFIGURED", "quickbooks"),
    }

    if !config.load.tables.is_empty() {
        println!();
        println!("{:<28} {:<36} {:<20} CHECKS", "TABLE", "FROM", "KEYS");
        for t in &config.load.tables {
            println!(
                "{:<28} {:<36} {:<20} {}",
                t.table,
                format!("{}/{}/{}", t.layer, t.domain, t.name),
                t.keys.join(","),
                t.checks.len()
            );
        }
    }

    Ok(())
}

fn incremental_label(inc: Option<&crate::config::IncrementalConfig>) -> String {
    match inc {
        Some(i) => format!("{}d", i.from_days_ago),
        None => "full".to_string(),
    }
}
