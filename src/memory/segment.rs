//! Shared memory segment: mapping, header and arena

#[cfg(target_os = "linux")]
use std::ffi::CString;
use std::{
    fs::{File, OpenOptions},
    io::ErrorKind,
    os::fd::{AsFd, AsRawFd, OwnedFd, RawFd},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
    ptr::NonNull,
    time::{SystemTime, UNIX_EPOCH},
};

use memmap2::{MmapMut, MmapOptions};
#[cfg(target_os = "linux")]
use nix::{
    sys::memfd::{memfd_create, MemFdCreateFlag},
    unistd::ftruncate,
};

use crate::{
    allocators::{BuddyAllocator, BuddyStats},
    arena::{Arena, OffsetPtr},
    error::{Result, ShmError},
    utils::align_up,
};

use super::{
    config::{BackingType, OpenMode, SegmentConfig},
    header::SegmentHeader,
};

/// Alignment of every area boundary
const AREA_ALIGN: usize = 64;

/// Byte ranges of the three areas of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    pub header_size: usize,
    pub index_offset: usize,
    pub index_size: usize,
    pub storage_offset: usize,
    pub storage_size: usize,
    pub total_size: usize,
}

impl SegmentLayout {
    /// Layout for the given buddy orders
    pub fn new(min_order: u32, max_order: u32) -> Result<Self> {
        BuddyAllocator::validate_orders(min_order, max_order)?;
        let header_size = align_up(std::mem::size_of::<SegmentHeader>(), AREA_ALIGN);
        let index_size = align_up(BuddyAllocator::index_size(min_order, max_order), AREA_ALIGN);
        let storage_offset = header_size + index_size;
        let storage_size = 1usize
            .checked_shl(max_order)
            .ok_or_else(|| {
                ShmError::invalid_parameter("max_order", "storage does not fit the address space")
            })?;
        let total_size = storage_offset
            .checked_add(storage_size)
            .ok_or_else(|| {
                ShmError::invalid_parameter("max_order", "segment does not fit the address space")
            })?;
        Ok(Self {
            header_size,
            index_offset: header_size,
            index_size,
            storage_offset,
            storage_size,
            total_size,
        })
    }
}

/// An attached shared memory segment
///
/// Owns the mapping and the arena bound to this process's base address.
/// Dropping the segment unmaps it; the backing file stays in place.
#[derive(Debug)]
pub struct Segment {
    identifier: String,
    backing_type: BackingType,
    path: Option<PathBuf>,
    layout: SegmentLayout,
    created: bool,
    arena: Arena,
    mmap: MmapMut,
    /// Backing file or memfd; keeps the descriptor open while mapped
    file: File,
}

impl Segment {
    /// Create or open a segment according to `config.mode`
    pub fn attach(config: SegmentConfig) -> Result<Self> {
        config.validate()?;
        match config.backing_type {
            BackingType::FileBacked => Self::attach_file(&config),
            BackingType::MemFd => Self::create_memfd(&config),
        }
    }

    /// Attach to a memfd segment whose descriptor was received from another process
    pub fn from_fd(fd: OwnedFd) -> Result<Self> {
        let file = File::from(fd);
        let segment = Self::open_mapped(file, None, None, BackingType::MemFd)?;
        Ok(segment)
    }

    fn attach_file(config: &SegmentConfig) -> Result<Self> {
        let path = config.default_file_path();
        let layout = SegmentLayout::new(config.min_order, config.max_order)?;

        let created = match config.mode {
            OpenMode::Create => Some(Self::create_file(&path, config)?),
            OpenMode::Open => None,
            OpenMode::CreateOrOpen => match Self::create_file(&path, config) {
                Ok(file) => Some(file),
                Err(ShmError::SegmentExists { .. }) => None,
                Err(e) => return Err(e),
            },
        };

        match created {
            Some(file) => {
                let formatted = file
                    .set_len(layout.total_size as u64)
                    .map_err(|e| ShmError::from_io(e, "Failed to set segment file size"))
                    .and_then(|()| Self::format_mapped(file, config, layout, Some(path.clone())));
                if formatted.is_err() {
                    // Leave no half-formatted file behind for the next opener
                    let _ = std::fs::remove_file(&path);
                }
                formatted
            }
            None => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&path)
                    .map_err(|e| match e.kind() {
                        ErrorKind::NotFound => ShmError::segment_not_found(&config.identifier),
                        _ => ShmError::from_io(e, "Failed to open segment file"),
                    })?;
                Self::open_mapped(
                    file,
                    Some(&config.identifier),
                    Some(path),
                    BackingType::FileBacked,
                )
            }
        }
    }

    fn create_file(path: &Path, config: &SegmentConfig) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(config.permissions)
            .open(path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => ShmError::segment_exists(&config.identifier),
                _ => ShmError::from_io(e, "Failed to create segment file"),
            })
    }

    #[cfg(target_os = "linux")]
    fn create_memfd(config: &SegmentConfig) -> Result<Self> {
        let layout = SegmentLayout::new(config.min_order, config.max_order)?;
        let name = CString::new(format!("shmkit_{}", config.identifier))
            .map_err(|_| {
                ShmError::invalid_parameter("identifier", "Identifier contains null bytes")
            })?;

        let owned_fd = memfd_create(&name, MemFdCreateFlag::MFD_CLOEXEC)
            .map_err(|e| ShmError::platform(format!("Failed to create memfd: {}", e)))?;
        ftruncate(&owned_fd, layout.total_size as i64)
            .map_err(|e| ShmError::platform(format!("Failed to set memfd size: {}", e)))?;

        Self::format_mapped(File::from(owned_fd), config, layout, None)
    }

    #[cfg(not(target_os = "linux"))]
    fn create_memfd(_config: &SegmentConfig) -> Result<Self> {
        Err(ShmError::platform("memfd not supported on this platform"))
    }

    fn map(file: &File, len: usize) -> Result<MmapMut> {
        // SAFETY: the mapping is shared by design; all access to it goes
        // through the header's atomics, the allocator and container borrows.
        unsafe {
            MmapOptions::new()
                .len(len)
                .map_mut(file)
                .map_err(|e| ShmError::from_io(e, "Failed to create memory mapping"))
        }
    }

    fn format_mapped(
        file: File,
        config: &SegmentConfig,
        layout: SegmentLayout,
        path: Option<PathBuf>,
    ) -> Result<Self> {
        let identifier = config.identifier.as_str();
        let backing_type = config.backing_type;
        let (min_order, max_order) = (config.min_order, config.max_order);

        let mut mmap = Self::map(&file, layout.total_size)?;
        let (header, index, storage) = Self::areas(&mut mmap, &layout)?;

        let create_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        // SAFETY: the areas are disjoint, in bounds and exclusively ours until
        // the magic is published by `initialize`.
        let arena = unsafe {
            let arena = Arena::format(index, layout.index_size, storage, min_order, max_order)?;
            SegmentHeader::initialize(
                header.as_ptr(),
                identifier,
                layout.total_size as u64,
                min_order,
                max_order,
                create_time,
            )?;
            arena
        };

        let segment = Self {
            identifier: identifier.to_string(),
            backing_type,
            path,
            layout,
            created: true,
            arena,
            mmap,
            file,
        };
        let visits = segment.header().record_visit();
        tracing::info!(
            identifier,
            backing = backing_type.name(),
            size = layout.total_size,
            min_order,
            max_order,
            visits,
            "segment created"
        );
        Ok(segment)
    }

    fn open_mapped(
        file: File,
        identifier: Option<&str>,
        path: Option<PathBuf>,
        backing_type: BackingType,
    ) -> Result<Self> {
        let file_len = file
            .metadata()
            .map_err(|e| ShmError::from_io(e, "Failed to stat segment"))?
            .len() as usize;
        let header_size = std::mem::size_of::<SegmentHeader>();
        if file_len < header_size {
            return Err(ShmError::corruption(format!(
                "segment of {} bytes is smaller than its header ({} bytes)",
                file_len, header_size
            )));
        }

        let mut mmap = Self::map(&file, file_len)?;
        // SAFETY: the mapping is page aligned and at least one header long.
        let header = unsafe { &*mmap.as_ptr().cast::<SegmentHeader>() };
        header.validate()?;

        let stored_identifier = header.identifier();
        if let Some(expected) = identifier {
            if stored_identifier != expected {
                return Err(ShmError::corruption(format!(
                    "segment identifier is {:?}, expected {:?}",
                    stored_identifier, expected
                )));
            }
        }

        let layout = SegmentLayout::new(header.min_order(), header.max_order())
            .map_err(|e| {
                ShmError::corruption(format!("header describes an invalid layout: {}", e))
            })?;
        if header.total_size() != layout.total_size as u64 || file_len != layout.total_size {
            return Err(ShmError::corruption(format!(
                "segment size mismatch: header says {}, layout needs {}, mapping has {}",
                header.total_size(),
                layout.total_size,
                file_len
            )));
        }

        let (_, index, storage) = Self::areas(&mut mmap, &layout)?;
        // SAFETY: areas are disjoint and live as long as `mmap`, which the
        // segment owns alongside the arena.
        let arena =
            unsafe { Arena::attach(index, layout.index_size, storage, layout.storage_size)? };

        let segment = Self {
            identifier: stored_identifier,
            backing_type,
            path,
            layout,
            created: false,
            arena,
            mmap,
            file,
        };
        let visits = segment.header().record_visit();
        tracing::info!(
            identifier = %segment.identifier,
            backing = backing_type.name(),
            size = layout.total_size,
            visits,
            "segment attached"
        );
        Ok(segment)
    }

    /// Split a mapping into header, index and storage base pointers
    fn areas(
        mmap: &mut MmapMut,
        layout: &SegmentLayout,
    ) -> Result<(NonNull<SegmentHeader>, NonNull<u8>, NonNull<u8>)> {
        if mmap.len() < layout.total_size {
            return Err(ShmError::corruption(format!(
                "mapping of {} bytes cannot hold a {} byte segment",
                mmap.len(),
                layout.total_size
            )));
        }
        let base = NonNull::new(mmap.as_mut_ptr())
            .ok_or_else(|| ShmError::platform("memory mapping returned a null address"))?;
        // SAFETY: offsets lie within the mapping checked above.
        unsafe {
            Ok((
                base.cast(),
                NonNull::new_unchecked(base.as_ptr().add(layout.index_offset)),
                NonNull::new_unchecked(base.as_ptr().add(layout.storage_offset)),
            ))
        }
    }

    /// The arena bound to this mapping
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// The segment header
    pub fn header(&self) -> &SegmentHeader {
        // SAFETY: validated or initialized during attach; lives as long as `mmap`.
        unsafe { &*self.mmap.as_ptr().cast::<SegmentHeader>() }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn backing_type(&self) -> BackingType {
        self.backing_type
    }

    /// Backing file path for file-backed segments
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn layout(&self) -> SegmentLayout {
        self.layout
    }

    /// Total mapped size
    pub fn size(&self) -> usize {
        self.layout.total_size
    }

    /// True when this attach formatted the segment
    pub fn was_created(&self) -> bool {
        self.created
    }

    pub fn visit_count(&self) -> u32 {
        self.header().visit_count()
    }

    /// Base address of the mapping in this process
    pub fn base_address(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    /// Publish `ptr` in a root slot, returning the previous occupant
    pub fn set_root<T>(&self, slot: usize, ptr: OffsetPtr<T>) -> Result<OffsetPtr<T>> {
        if !ptr.is_null() {
            self.arena.resolve(ptr)?;
        }
        self.header().set_root(slot, ptr)
    }

    /// Offset published in a root slot; null when unset
    pub fn root<T>(&self, slot: usize) -> Result<OffsetPtr<T>> {
        self.header().root(slot)
    }

    /// Flush changes to the backing file
    pub fn flush(&self) -> Result<()> {
        self.mmap
            .flush()
            .map_err(|e| ShmError::from_io(e, "Failed to flush memory mapping"))
    }

    /// Flush changes asynchronously
    pub fn flush_async(&self) -> Result<()> {
        self.mmap
            .flush_async()
            .map_err(|e| ShmError::from_io(e, "Failed to flush memory mapping asynchronously"))
    }

    /// Raw descriptor of the backing file or memfd
    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Duplicate the backing descriptor, e.g. to hand a memfd to another process
    pub fn try_clone_fd(&self) -> Result<OwnedFd> {
        self.file
            .as_fd()
            .try_clone_to_owned()
            .map_err(|e| ShmError::from_io(e, "Failed to duplicate segment descriptor"))
    }

    /// Allocator and header figures for reporting
    pub fn stats(&self) -> SegmentStats {
        let header = self.header();
        SegmentStats {
            identifier: self.identifier.clone(),
            backing_type: self.backing_type,
            total_size: self.layout.total_size,
            create_time: header.create_time(),
            visit_count: header.visit_count(),
            allocator: self.arena.stats(),
        }
    }

    /// Remove the backing file of a file-backed segment
    ///
    /// Processes that still have it mapped keep working on the old pages.
    pub fn unlink(config: &SegmentConfig) -> Result<()> {
        let path = config.default_file_path();
        std::fs::remove_file(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => ShmError::segment_not_found(&config.identifier),
            _ => ShmError::from_io(e, "Failed to remove segment file"),
        })?;
        tracing::info!(identifier = %config.identifier, path = %path.display(), "segment unlinked");
        Ok(())
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        tracing::info!(identifier = %self.identifier, "segment detached");
    }
}

// SAFETY: the header is accessed through atomics, the allocator through its
// lock, and container storage through `&`/`&mut` borrows.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

/// Snapshot of a segment's header and allocator state
#[derive(Debug, Clone)]
pub struct SegmentStats {
    pub identifier: String,
    pub backing_type: BackingType,
    pub total_size: usize,
    pub create_time: i64,
    pub visit_count: u32,
    pub allocator: BuddyStats,
}

impl SegmentStats {
    /// Age of the segment in seconds
    pub fn age_seconds(&self) -> Option<u64> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs() as i64;
        u64::try_from(now - self.create_time).ok()
    }
}
