//! Table-name derivation from object keys.
//!
//! Everything here is a pure function of the key and the configured
//! [`TableNamingStrategy`]. Illegal characters are normalized instead of
//! rejected so every `.csv` upload maps to a catalog-legal identifier.

use std::sync::LazyLock;

use regex::Regex;

use crate::{
    config::TableNamingStrategy,
    error::{LoaderError, LoaderResult},
};

const MAX_IDENTIFIER_LEN: usize = 255;

static NON_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9_]+").expect("static identifier regex"));
static CATALOG_IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("static identifier regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    pub table: String,
    /// Suffix split off under [`TableNamingStrategy::SplitAtLastUnderscore`].
    pub discriminator: Option<String>,
}

pub fn is_catalog_identifier(value: &str) -> bool {
    value.len() <= MAX_IDENTIFIER_LEN && CATALOG_IDENTIFIER.is_match(value)
}

/// Lowercases, maps illegal characters to `_`, collapses repeats and trims
/// leading/trailing underscores. May return an empty string.
pub fn normalize_identifier(raw: &str) -> String {
    let lowered = raw.replace('\u{a0}', " ").trim().to_lowercase();
    let replaced = NON_WORD.replace_all(&lowered, "_");
    let mut collapsed = String::with_capacity(replaced.len());
    for ch in replaced.chars() {
        if ch == '_' && collapsed.ends_with('_') {
            continue;
        }
        collapsed.push(ch);
    }
    collapsed.trim_matches('_').to_string()
}

fn finish_table_name(base: &str, key: &str) -> LoaderResult<String> {
    let mut name = normalize_identifier(base);
    if name.is_empty() {
        return Err(LoaderError::Naming(format!(
            "No usable table name in '{key}'"
        )));
    }
    if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
        name.insert_str(0, "t_");
    }
    name.truncate(MAX_IDENTIFIER_LEN);
    Ok(name)
}

/// Splits the key into its base filename without the `.csv` extension.
fn csv_base_name(key: &str) -> LoaderResult<&str> {
    let filename = key.rsplit('/').next().unwrap_or(key);
    let (base, ext) = match filename.rfind('.') {
        Some(idx) if idx > 0 => (&filename[..idx], &filename[idx + 1..]),
        _ => (filename, ""),
    };
    if !ext.eq_ignore_ascii_case("csv") {
        return Err(LoaderError::Naming(format!(
            "Expected a .csv file, got '{filename}'"
        )));
    }
    Ok(base)
}

pub fn derive_table_name(key: &str, strategy: TableNamingStrategy) -> LoaderResult<TableName> {
    let base = csv_base_name(key)?;
    match strategy {
        TableNamingStrategy::FullFilename => Ok(TableName {
            table: finish_table_name(base, key)?,
            discriminator: None,
        }),
        TableNamingStrategy::SplitAtLastUnderscore => match base.rsplit_once('_') {
            Some((before, after)) if !normalize_identifier(before).is_empty() => {
                let discriminator = normalize_identifier(after);
                Ok(TableName {
                    table: finish_table_name(before, key)?,
                    discriminator: (!discriminator.is_empty()).then_some(discriminator),
                })
            }
            _ => Ok(TableName {
                table: finish_table_name(base, key)?,
                discriminator: None,
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn full_filename_keeps_the_whole_base_name() {
        let name = derive_table_name("uploads/orders_2024.csv", TableNamingStrategy::FullFilename)
            .expect("derive");
        assert_eq!(name.table, "orders_2024");
        assert_eq!(name.discriminator, None);
    }

    #[test]
    fn split_strategy_separates_the_discriminator() {
        let name = derive_table_name(
            "orders_2024.csv",
            TableNamingStrategy::SplitAtLastUnderscore,
        )
        .expect("derive");
        assert_eq!(name.table, "orders");
        assert_eq!(name.discriminator.as_deref(), Some("2024"));
    }

    #[test]
    fn split_strategy_without_underscore_falls_back() {
        let name = derive_table_name("report.csv", TableNamingStrategy::SplitAtLastUnderscore)
            .expect("derive");
        assert_eq!(name.table, "report");
        assert_eq!(name.discriminator, None);
    }

    #[test]
    fn split_strategy_with_leading_underscore_falls_back() {
        let name = derive_table_name("_2024.csv", TableNamingStrategy::SplitAtLastUnderscore)
            .expect("derive");
        assert_eq!(name.table, "t_2024");
    }

    #[test]
    fn illegal_characters_are_normalized() {
        let name = derive_table_name(
            "in/Sales Report (EU)-Q1.CSV",
            TableNamingStrategy::FullFilename,
        )
        .expect("derive");
        assert_eq!(name.table, "sales_report_eu_q1");
    }

    #[test]
    fn multi_part_split_keeps_earlier_underscores() {
        let name = derive_table_name(
            "daily_sales_eu_20240131.csv",
            TableNamingStrategy::SplitAtLastUnderscore,
        )
        .expect("derive");
        assert_eq!(name.table, "daily_sales_eu");
        assert_eq!(name.discriminator.as_deref(), Some("20240131"));
    }

    #[test]
    fn non_csv_extensions_are_rejected() {
        let err = derive_table_name("orders.parquet", TableNamingStrategy::FullFilename)
            .expect_err("not csv");
        assert_eq!(err.kind(), "NamingError");
        assert!(derive_table_name("orders", TableNamingStrategy::FullFilename).is_err());
    }

    #[test]
    fn symbol_only_names_are_rejected() {
        assert!(derive_table_name("%%%.csv", TableNamingStrategy::FullFilename).is_err());
    }

    proptest! {
        #[test]
        fn derived_names_are_always_catalog_legal(
            base in "[A-Za-z0-9 _.()-]{1,40}",
            split in any::<bool>(),
        ) {
            let strategy = if split {
                TableNamingStrategy::SplitAtLastUnderscore
            } else {
                TableNamingStrategy::FullFilename
            };
            let key = format!("drop/{base}.csv");
            if let Ok(name) = derive_table_name(&key, strategy) {
                prop_assert!(is_catalog_identifier(&name.table), "{}", name.table);
                let again = derive_table_name(&key, strategy).expect("deterministic");
                prop_assert_eq!(again, name);
            }
        }
    }
}
