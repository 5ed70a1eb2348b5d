//! Symbol metadata directory
//!
//! Loaded once at startup from a JSON file and reloadable on mtime change.
//! The normalizer resolves external string codes to [`Symbol`] ids here and
//! pulls the per-symbol price scale.

use crate::codec::PriceCodec;
use crate::types::Symbol;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tracing::{info, warn};

/// Directory failure
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// File could not be read
    #[error("read {}: {source}", path.display())]
    Io {
        /// Offending path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// File content is not valid metadata JSON
    #[error("parse {}: {source}", path.display())]
    Parse {
        /// Offending path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },
    /// A metadata entry carries an unusable price scale
    #[error("symbol {code}: unsupported price scale {scale}")]
    BadScale {
        /// Symbol code
        code: String,
        /// Rejected exponent
        scale: u32,
    },
}

/// One entry in the metadata file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetaFileEntry {
    code: String,
    exchange: String,
    #[serde(default = "default_scale_exp")]
    price_scale: u32,
    /// Tick size as a decimal string, scaled at load time
    tick_size: String,
    #[serde(default)]
    tags: Vec<String>,
}

fn default_scale_exp() -> u32 {
    crate::codec::DEFAULT_SCALE_EXP
}

/// Per-symbol static metadata
#[derive(Debug, Clone)]
pub struct SymbolMeta {
    /// Internal id
    pub symbol: Symbol,
    /// External code (e.g. "IF2409")
    pub code: String,
    /// Exchange id
    pub exchange: String,
    /// Fixed-point codec for this symbol
    pub codec: PriceCodec,
    /// Minimum price increment, scaled
    pub tick_size: i64,
    /// Free-form classification tags
    pub tags: Vec<String>,
}

#[derive(Default)]
struct DirectoryInner {
    by_code: FxHashMap<String, Symbol>,
    by_symbol: FxHashMap<Symbol, Arc<SymbolMeta>>,
}

/// Reloadable symbol directory
///
/// Readers take `Arc<SymbolMeta>` handles; a reload swaps the maps under a
/// short write lock and existing handles stay valid.
pub struct SymbolDirectory {
    inner: RwLock<DirectoryInner>,
    source: Option<PathBuf>,
    last_mtime: RwLock<Option<SystemTime>>,
}

impl SymbolDirectory {
    /// Empty directory; symbols are registered programmatically (tests, sim)
    #[must_use]
    pub fn empty() -> Self {
        Self {
            inner: RwLock::new(DirectoryInner::default()),
            source: None,
            last_mtime: RwLock::new(None),
        }
    }

    /// Load the directory from a JSON metadata file
    pub fn load(path: &Path) -> Result<Self, DirectoryError> {
        let dir = Self {
            inner: RwLock::new(DirectoryInner::default()),
            source: Some(path.to_path_buf()),
            last_mtime: RwLock::new(None),
        };
        dir.reload()?;
        Ok(dir)
    }

    /// Register a symbol directly; ids are assigned in insertion order
    pub fn register(&self, code: &str, exchange: &str, scale_exp: u32, tick_size: i64) -> Symbol {
        let mut inner = self.inner.write();
        if let Some(sym) = inner.by_code.get(code) {
            return *sym;
        }
        let symbol = Symbol::new(u32::try_from(inner.by_symbol.len()).unwrap_or(u32::MAX));
        let codec = PriceCodec::new(scale_exp).unwrap_or_default();
        let meta = Arc::new(SymbolMeta {
            symbol,
            code: code.to_string(),
            exchange: exchange.to_string(),
            codec,
            tick_size,
            tags: Vec::new(),
        });
        inner.by_code.insert(code.to_string(), symbol);
        inner.by_symbol.insert(symbol, meta);
        symbol
    }

    /// Resolve an external code
    #[must_use]
    pub fn resolve(&self, code: &str) -> Option<Symbol> {
        self.inner.read().by_code.get(code).copied()
    }

    /// Metadata for a symbol
    #[must_use]
    pub fn meta(&self, symbol: Symbol) -> Option<Arc<SymbolMeta>> {
        self.inner.read().by_symbol.get(&symbol).cloned()
    }

    /// Number of known symbols
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().by_symbol.len()
    }

    /// True when no symbols are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-read the metadata file if its mtime changed
    ///
    /// Intended to be polled from a cold housekeeping task. Returns true when
    /// a reload happened.
    pub fn maybe_reload(&self) -> bool {
        let Some(path) = &self.source else {
            return false;
        };
        let mtime = match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) => {
                warn!("symbol metadata stat failed: {e}");
                return false;
            }
        };
        if *self.last_mtime.read() == Some(mtime) {
            return false;
        }
        match self.reload() {
            Ok(count) => {
                info!("symbol metadata reloaded, {count} symbols");
                true
            }
            Err(e) => {
                warn!("symbol metadata reload failed, keeping previous: {e}");
                false
            }
        }
    }

    fn reload(&self) -> Result<usize, DirectoryError> {
        let Some(path) = &self.source else {
            return Ok(0);
        };
        let bytes = std::fs::read(path).map_err(|source| DirectoryError::Io {
            path: path.clone(),
            source,
        })?;
        let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        let entries: Vec<MetaFileEntry> =
            serde_json::from_slice(&bytes).map_err(|source| DirectoryError::Parse {
                path: path.clone(),
                source,
            })?;

        let mut by_code = FxHashMap::default();
        let mut by_symbol = FxHashMap::default();
        {
            // Preserve ids for codes that survive the reload
            let current = self.inner.read();
            let mut next_id = u32::try_from(current.by_symbol.len()).unwrap_or(u32::MAX);
            for (idx, entry) in entries.iter().enumerate() {
                let codec = PriceCodec::new(entry.price_scale).map_err(|_| {
                    DirectoryError::BadScale {
                        code: entry.code.clone(),
                        scale: entry.price_scale,
                    }
                })?;
                let tick_size = codec
                    .parse_str(&entry.tick_size)
                    .map(|px| px.as_i64())
                    .unwrap_or(1);
                let symbol = match current.by_code.get(&entry.code) {
                    Some(sym) => *sym,
                    None if current.by_symbol.is_empty() => {
                        Symbol::new(u32::try_from(idx).unwrap_or(u32::MAX))
                    }
                    None => {
                        let sym = Symbol::new(next_id);
                        next_id += 1;
                        sym
                    }
                };
                let meta = Arc::new(SymbolMeta {
                    symbol,
                    code: entry.code.clone(),
                    exchange: entry.exchange.clone(),
                    codec,
                    tick_size,
                    tags: entry.tags.clone(),
                });
                by_code.insert(entry.code.clone(), symbol);
                by_symbol.insert(symbol, meta);
            }
        }

        let count = by_symbol.len();
        *self.inner.write() = DirectoryInner { by_code, by_symbol };
        *self.last_mtime.write() = mtime;
        Ok(count)
    }
}
