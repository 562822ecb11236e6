//! Configuration types for shared memory segments

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{
    allocators::BuddyAllocator,
    error::{Result, ShmError},
};

/// Longest identifier that fits the header with its NUL terminator
pub const MAX_IDENTIFIER_LEN: usize = 15;

/// Default smallest block: 16 bytes
pub const DEFAULT_MIN_ORDER: u32 = 4;

/// Default storage area: 1 MiB
pub const DEFAULT_MAX_ORDER: u32 = 20;

/// Types of shared memory backing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackingType {
    /// File-backed shared memory, shareable by path
    #[default]
    FileBacked,
    /// Anonymous memory file descriptor, shareable by passing the fd
    MemFd,
}

impl BackingType {
    /// Check if this backing type is supported on the current platform
    pub fn is_supported(&self) -> bool {
        match self {
            BackingType::FileBacked => true,
            BackingType::MemFd => cfg!(target_os = "linux"),
        }
    }

    /// Get a human-readable name for the backing type
    pub fn name(&self) -> &'static str {
        match self {
            BackingType::FileBacked => "file-backed",
            BackingType::MemFd => "memfd",
        }
    }
}

/// What to do when the backing object does or does not exist yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OpenMode {
    /// Create a new segment; fail if one exists
    Create,
    /// Attach to an existing segment; fail if none exists
    Open,
    /// Attach if present, otherwise create
    #[default]
    CreateOrOpen,
}

/// Configuration for creating or attaching a segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Segment identifier, stored in the header
    pub identifier: String,
    /// Backing type for the shared memory
    pub backing_type: BackingType,
    /// Optional file path for file-backed segments
    pub file_path: Option<PathBuf>,
    /// Create/open behavior
    pub mode: OpenMode,
    /// Permissions for a newly created backing file (Unix permissions)
    pub permissions: u32,
    /// Order of the smallest block
    pub min_order: u32,
    /// Order of the whole storage area
    pub max_order: u32,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            identifier: String::new(),
            backing_type: BackingType::default(),
            file_path: None,
            mode: OpenMode::default(),
            permissions: 0o644,
            min_order: DEFAULT_MIN_ORDER,
            max_order: DEFAULT_MAX_ORDER,
        }
    }
}

impl SegmentConfig {
    /// Create a new segment configuration
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            ..Default::default()
        }
    }

    /// Set the backing type
    pub fn with_backing_type(mut self, backing_type: BackingType) -> Self {
        self.backing_type = backing_type;
        self
    }

    /// Set the file path for file-backed segments
    pub fn with_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    /// Set the open mode
    pub fn with_mode(mut self, mode: OpenMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the permissions for a newly created backing file
    pub fn with_permissions(mut self, permissions: u32) -> Self {
        self.permissions = permissions;
        self
    }

    /// Set the buddy orders
    pub fn with_orders(mut self, min_order: u32, max_order: u32) -> Self {
        self.min_order = min_order;
        self.max_order = max_order;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.identifier.is_empty() {
            return Err(ShmError::invalid_parameter(
                "identifier",
                "Segment identifier cannot be empty",
            ));
        }

        if self.identifier.len() > MAX_IDENTIFIER_LEN {
            return Err(ShmError::invalid_parameter(
                "identifier",
                format!(
                    "Segment identifier is {} bytes, at most {} allowed",
                    self.identifier.len(),
                    MAX_IDENTIFIER_LEN
                ),
            ));
        }

        if self.identifier.as_bytes().contains(&0) {
            return Err(ShmError::invalid_parameter(
                "identifier",
                "Segment identifier contains NUL bytes",
            ));
        }

        BuddyAllocator::validate_orders(self.min_order, self.max_order)?;

        if !self.backing_type.is_supported() {
            return Err(ShmError::invalid_parameter(
                "backing_type",
                format!(
                    "Backing type {} is not supported on this platform",
                    self.backing_type.name()
                ),
            ));
        }

        // A memfd has no name others can open by
        if self.backing_type == BackingType::MemFd && self.mode == OpenMode::Open {
            return Err(ShmError::invalid_parameter(
                "mode",
                "memfd segments cannot be opened by identifier; use Segment::from_fd",
            ));
        }

        Ok(())
    }

    /// Get the backing file path for this segment
    pub fn default_file_path(&self) -> PathBuf {
        self.file_path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(format!("shmkit_{}", self.identifier)))
    }
}
