#![forbid(unsafe_code)]
//! Error types for FrankenFS root recovery.
//!
//! # Error Taxonomy
//!
//! Errors are layered:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `ffs-types` | On-disk format violations detected during byte parsing |
//! | Per-block | `Unreadable` | `ffs-btrfs` | One metadata block could not be read or validated; the scan skips it |
//! | Runtime | `FfsError` | `ffs-error` (this crate) | Fatal errors for the CLI and API consumers |
//!
//! ## Mapping Policy: ParseError → FfsError
//!
//! `ffs-error` is independent of `ffs-types` and `ffs-ondisk` to avoid
//! cyclic dependencies. The conversion is implemented in `ffs-btrfs`,
//! which depends on both:
//!
//! | ParseError Variant | FfsError Variant |
//! |--------------------|------------------|
//! | `InsufficientData` | `Corruption { block, detail }` |
//! | `InvalidMagic` | `Format(detail)` |
//! | `InvalidField` | `Format` / `UnsupportedFeature` / `InvalidGeometry` |
//! | `IntegerConversion` | `Corruption { block, detail }` |
//!
//! ## What is *not* an error
//!
//! - A single unreadable metadata block during a scan. Recovery images
//!   routinely contain torn or overwritten blocks; they are counted and
//!   skipped, never surfaced as `FfsError`.
//! - A scan that finds no candidate roots. That is an empty result.
//!
//! ## Fatal classes
//!
//! | Class | Variants | When |
//! |-------|----------|------|
//! | Volume open failure | `Io`, `Format`, `Parse`, `Corruption`, `UnsupportedFeature`, `InvalidGeometry` | before any scanning |
//! | Resource exhaustion | `ResourceExhausted` | while growing the candidate index |

use thiserror::Error;

/// Unified error type for FrankenFS recovery operations.
#[derive(Debug, Error)]
pub enum FfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata corruption detected at a known logical address.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Invalid on-disk format (wrong filesystem type, bad magic, bad chunk map).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without a known block address.
    #[error("parse error: {0}")]
    Parse(String),

    /// The image uses a feature that this build cannot handle.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// On-disk geometry (sector size, node size) is out of the supported range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Growing the candidate index failed: allocation failure or the
    /// configured candidate limit was reached.
    ///
    /// Distinct from an empty result: the scan was aborted and no partial
    /// index is returned.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl FfsError {
    /// Whether this error was raised while opening the volume, before any
    /// metadata scanning could start.
    #[must_use]
    pub fn is_volume_open_failure(&self) -> bool {
        match self {
            Self::Io(_)
            | Self::Corruption { .. }
            | Self::Format(_)
            | Self::Parse(_)
            | Self::UnsupportedFeature(_)
            | Self::InvalidGeometry(_) => true,
            Self::ResourceExhausted(_) => false,
        }
    }
}

/// Result alias using `FfsError`.
pub type Result<T> = std::result::Result<T, FfsError>;
