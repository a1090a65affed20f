//! The driver's exported-symbol table.
//!
//! A stable name-to-address mapping used as the second tier of the image
//! loader's import resolution and served to companion modules over IDC.
//! Populated once at driver construction; stable across the driver lifetime.

use std::collections::HashMap;

/// Name → address map of the driver's exported entry points.
#[derive(Debug, Default)]
pub struct ExportTable {
    symbols: HashMap<String, u64>,
}

impl ExportTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an export. Last registration wins; exports are only added
    /// during driver construction.
    pub fn register(&mut self, name: impl Into<String>, address: u64) {
        self.symbols.insert(name.into(), address);
    }

    /// Looks up an exported symbol.
    pub fn resolve(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}
