//! Output formatting for CLI

use anyhow::Result;
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

fn table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Print any serializable value as JSON or YAML
pub fn print_serialized<T: Serialize + ?Sized>(value: &T, format: OutputFormat) -> Result<bool> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
        OutputFormat::Table => return Ok(false),
    }
    Ok(true)
}

/// Print a single item
pub fn print_item<T: Serialize + TableDisplay>(item: &T, format: OutputFormat) -> Result<()> {
    if print_serialized(item, format)? {
        return Ok(());
    }
    let mut table = table();
    table.set_header(vec!["Field", "Value"]);
    for (header, value) in T::headers().into_iter().zip(item.row()) {
        table.add_row(vec![header.to_string(), value]);
    }
    println!("{table}");
    Ok(())
}

/// Print a list of items
pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) -> Result<()> {
    if print_serialized(items, format)? {
        return Ok(());
    }
    if items.is_empty() {
        println!("No items found.");
        return Ok(());
    }
    let mut table = table();
    table.set_header(T::headers());
    for item in items {
        table.add_row(item.row());
    }
    println!("{table}");
    Ok(())
}

/// Print field/value pairs as a two-column table
pub fn print_details(rows: &[(&str, String)]) {
    let mut table = table();
    table.set_header(vec!["Field", "Value"]);
    for (field, value) in rows {
        table.add_row(vec![field.to_string(), value.clone()]);
    }
    println!("{table}");
}

/// Print success message
pub fn print_success(message: &str, format: OutputFormat) {
    if format == OutputFormat::Table {
        println!("✅ {}", message);
    } else {
        eprintln!("{}", message);
    }
}

/// Print warning message
pub fn print_warning(message: &str) {
    eprintln!("⚠️  {}", message);
}

/// Print info message
pub fn print_info(message: &str) {
    println!("ℹ️  {}", message);
}

/// `Some(x)` as text, `-` otherwise
pub fn or_dash<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Short form of a timestamp
pub fn timestamp(value: chrono::DateTime<chrono::Utc>) -> String {
    value.format("%Y-%m-%d %H:%M:%S").to_string()
}
