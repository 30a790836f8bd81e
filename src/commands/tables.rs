use anyhow::Result;
use stackload::schema::{LOOKUP_TABLES, TABLES};

pub fn list_tables() -> Result<()> {
    println!("Supported dump files:");
    for table in TABLES.iter() {
        let key = table
            .primary_key
            .map(|ordinal| table.columns[ordinal].name)
            .unwrap_or("-");
        println!("\n{} (key: {})", table.name, key);
        for column in table.columns {
            println!(
                "  {:<24} {:<9}{}",
                column.name,
                column.column_type.to_string(),
                if column.nullable { "" } else { " not null" }
            );
        }
        if let Some(derived) = table.derived {
            println!(
                "  -> {} from {} (with --post-tags)",
                derived.target.name, table.columns[derived.source_ordinal].name
            );
        }
    }

    println!("\nLookup tables:");
    for lookup in LOOKUP_TABLES.iter() {
        println!("  {} ({} values)", lookup.name, lookup.values.len());
    }
    Ok(())
}
