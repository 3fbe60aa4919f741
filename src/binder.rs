//! Dataset Binder
//!
//! Maps dataset names to the identifiers a generated script uses to reach them.
//! Spaces and hyphens become underscores; this is the only convention in the
//! crate and the prompts quote the same identifiers.

use crate::dataset::{Dataset, DatasetTable};
use crate::error::{CityQueryError, Result};
use std::collections::BTreeMap;

/// Identifier for a dataset name.
///
/// Lower-cases, replaces spaces, hyphens and any other character outside
/// `[a-z0-9_]` with `_`, and prefixes a leading digit with `_`.
pub fn identifier_for(name: &str) -> String {
    let mut ident: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();

    if ident.is_empty() {
        ident.push('_');
    }
    if ident.starts_with(|c: char| c.is_ascii_digit()) {
        ident.insert(0, '_');
    }
    ident
}

/// One bound dataset
#[derive(Debug, Clone, Copy)]
pub struct Binding<'a> {
    pub identifier: &'a str,
    pub dataset: &'a Dataset,
}

/// Identifier → dataset map, in identifier order
#[derive(Debug, Clone)]
pub struct Bindings<'a> {
    entries: BTreeMap<String, &'a Dataset>,
}

impl<'a> Bindings<'a> {
    /// Bind every dataset of the table.
    ///
    /// Two names that normalize to the same identifier are an error; the
    /// later dataset never silently replaces the earlier one.
    pub fn bind(datasets: &'a DatasetTable) -> Result<Self> {
        let mut entries: BTreeMap<String, &'a Dataset> = BTreeMap::new();
        for dataset in datasets.iter() {
            let ident = identifier_for(&dataset.name);
            if let Some(existing) = entries.get(&ident) {
                return Err(CityQueryError::Binding(format!(
                    "datasets '{}' and '{}' both map to identifier '{}'",
                    existing.name, dataset.name, ident
                )));
            }
            entries.insert(ident, dataset);
        }
        Ok(Self { entries })
    }

    pub fn iter(&self) -> impl Iterator<Item = Binding<'_>> {
        self.entries.iter().map(|(identifier, dataset)| Binding {
            identifier: identifier.as_str(),
            dataset: *dataset,
        })
    }

    pub fn identifiers(&self) -> Vec<&str> {
        self.entries.keys().map(|k| k.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
