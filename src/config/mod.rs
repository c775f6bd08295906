//! Configuration: the MERAM config file and session knobs.
//!
//! - [`MeramConfig`]: reserved block ranges and IPMMUI tags parsed from the
//!   config file
//! - [`SessionConfig`]: where to find that file and how hard the region
//!   allocator may try
//!
//! # File syntax
//!
//! ```text
//! # blocks 0..=63 are owned by the LCDC
//! reserved 0 63
//! ipmmui   vpu  0x8c000000  16
//! ```

mod parser;

use crate::error::{Error, Result};
use parser::Directive;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Config file read when nothing else is specified.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/meram.conf";

/// Environment variable overriding [`DEFAULT_CONFIG_PATH`].
pub const CONFIG_PATH_ENV: &str = "MERAM_CONFIG";

/// Default cap on carve-and-retry attempts per allocation.
pub const DEFAULT_MAX_ALLOC_ATTEMPTS: usize = 64;

/// An inclusive range of scratch-memory blocks that must never be allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReservedRange {
    /// First reserved block.
    pub start_block: usize,
    /// Last reserved block (inclusive).
    pub end_block: usize,
}

impl ReservedRange {
    /// Create a range covering `start_block..=end_block`.
    pub const fn new(start_block: usize, end_block: usize) -> Self {
        Self {
            start_block,
            end_block,
        }
    }

    /// Check whether the inclusive block range `start..=end` touches this one.
    #[inline]
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        !(start > self.end_block || end < self.start_block)
    }
}

/// Immutable, file-ordered list of reserved ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservedRanges(Arc<[ReservedRange]>);

impl ReservedRanges {
    /// First range (in file order) overlapping `start..=end`.
    pub fn first_overlap(&self, start: usize, end: usize) -> Option<&ReservedRange> {
        self.0.iter().find(|r| r.overlaps(start, end))
    }

    /// Iterate over the ranges in file order.
    pub fn iter(&self) -> std::slice::Iter<'_, ReservedRange> {
        self.0.iter()
    }

    /// Number of ranges.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if nothing is reserved.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<ReservedRange> for ReservedRanges {
    fn from_iter<T: IntoIterator<Item = ReservedRange>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a ReservedRanges {
    type Item = &'a ReservedRange;
    type IntoIter = std::slice::Iter<'a, ReservedRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// A virtual address window the IPMMUI maps for one client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TagEntry {
    /// Client tag, e.g. `"vpu"`.
    pub tag: String,
    /// Virtual address the client should use.
    pub address: u64,
    /// Size of the address space in MiB.
    pub size: u32,
}

/// Immutable, file-ordered tag table. Lookups return the first match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagTable(Arc<[TagEntry]>);

impl TagTable {
    /// Look up a tag.
    pub fn get(&self, tag: &str) -> Option<&TagEntry> {
        self.0.iter().find(|e| e.tag == tag)
    }

    /// Iterate over the entries in file order.
    pub fn iter(&self) -> std::slice::Iter<'_, TagEntry> {
        self.0.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<TagEntry> for TagTable {
    fn from_iter<T: IntoIterator<Item = TagEntry>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Parsed contents of the MERAM config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeramConfig {
    /// Blocks the allocator must never hand out.
    pub reserved: ReservedRanges,
    /// IPMMUI tag table.
    pub tags: TagTable,
}

impl MeramConfig {
    /// Parse config text.
    ///
    /// # Example
    ///
    /// ```rust
    /// use meram::config::MeramConfig;
    ///
    /// let config = MeramConfig::parse("reserved 0 63\nipmmui vpu 0x8c000000 16\n").unwrap();
    /// assert_eq!(config.reserved.len(), 1);
    /// assert_eq!(config.tags.get("vpu").unwrap().size, 16);
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigLoad`] naming the first malformed line.
    pub fn parse(text: &str) -> Result<Self> {
        let mut reserved = Vec::new();
        let mut tags = Vec::new();
        for directive in parser::parse_config(text)? {
            match directive {
                Directive::Reserved(range) => reserved.push(range),
                Directive::Tag(entry) => tags.push(entry),
            }
        }

        Ok(Self {
            reserved: reserved.into_iter().collect(),
            tags: tags.into_iter().collect(),
        })
    }

    /// Read and parse a config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Load from any [`ConfigSource`].
    pub fn load(source: &ConfigSource) -> Result<Self> {
        let config = match source {
            ConfigSource::Path(path) => Self::from_file(path)?,
            ConfigSource::Inline(text) => Self::parse(text)?,
            ConfigSource::Empty => Self::default(),
        };

        tracing::debug!(
            reserved = config.reserved.len(),
            tags = config.tags.len(),
            "config loaded"
        );
        Ok(config)
    }
}

/// Where the session reads its [`MeramConfig`] from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// A config file on disk.
    Path(PathBuf),
    /// Config text held in memory.
    Inline(String),
    /// No reserved ranges, no tags.
    Empty,
}

impl Default for ConfigSource {
    fn default() -> Self {
        ConfigSource::Path(PathBuf::from(DEFAULT_CONFIG_PATH))
    }
}

/// Runtime knobs for a session registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Where to load the config file from on first open.
    pub config_source: ConfigSource,
    /// Cap on carve-and-retry attempts per region allocation.
    pub max_alloc_attempts: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            config_source: ConfigSource::default(),
            max_alloc_attempts: DEFAULT_MAX_ALLOC_ATTEMPTS,
        }
    }
}

impl SessionConfig {
    /// Default config with the file path taken from `MERAM_CONFIG` if set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
            config.config_source = ConfigSource::Path(path.into());
        }
        config
    }

    /// Use the given config source.
    pub fn with_source(mut self, source: ConfigSource) -> Self {
        self.config_source = source;
        self
    }

    /// Use inline config text.
    pub fn with_inline(self, text: impl Into<String>) -> Self {
        self.with_source(ConfigSource::Inline(text.into()))
    }

    /// Set the carve-and-retry cap (at least 1).
    pub fn with_max_alloc_attempts(mut self, attempts: usize) -> Self {
        self.max_alloc_attempts = attempts.max(1);
        self
    }
}
