//! Segment header stored at offset 0 of every segment

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::{
    allocators::BuddyAllocator,
    arena::OffsetPtr,
    error::{Result, ShmError},
};

/// Magic number identifying a formatted segment ("SMKT")
pub const SEGMENT_MAGIC: u32 = 0x534D_4B54;

/// Version of the header and area layout
pub const LAYOUT_VERSION: u32 = 1;

/// Bytes reserved for the NUL-terminated identifier
pub const IDENTIFIER_SIZE: usize = 16;

/// Number of root slots for publishing container handles
pub const ROOT_SLOTS: usize = 4;

/// Fixed-layout segment header
///
/// Fields written once at creation are plain integers; the visit counter and
/// root slots are atomics because every attached process may update them.
#[repr(C)]
pub struct SegmentHeader {
    identifier: [u8; IDENTIFIER_SIZE],
    total_size: u64,
    create_time: i64,
    visit_count: AtomicU32,
    magic: u32,
    version: u32,
    min_order: u32,
    max_order: u32,
    _pad: u32,
    roots: [AtomicU64; ROOT_SLOTS],
    _reserved: [u8; 256],
}

impl SegmentHeader {
    /// Write a fresh header; the magic is stored last
    ///
    /// # Safety
    /// `header` must be valid for writes of `size_of::<SegmentHeader>()` bytes
    /// and not accessed concurrently during initialization.
    pub unsafe fn initialize(
        header: *mut SegmentHeader,
        identifier: &str,
        total_size: u64,
        min_order: u32,
        max_order: u32,
        create_time: i64,
    ) -> Result<()> {
        let identifier = encode_identifier(identifier)?;
        header.write(SegmentHeader {
            identifier,
            total_size,
            create_time,
            visit_count: AtomicU32::new(0),
            magic: 0,
            version: LAYOUT_VERSION,
            min_order,
            max_order,
            _pad: 0,
            roots: std::array::from_fn(|_| AtomicU64::new(OffsetPtr::<u8>::NULL_OFFSET)),
            _reserved: [0; 256],
        });
        std::sync::atomic::fence(Ordering::Release);
        std::ptr::addr_of_mut!((*header).magic).write(SEGMENT_MAGIC);
        Ok(())
    }

    /// Check magic, version and orders
    pub fn validate(&self) -> Result<()> {
        if self.magic != SEGMENT_MAGIC {
            tracing::error!(
                expected = format_args!("{:#010x}", SEGMENT_MAGIC),
                actual = format_args!("{:#010x}", self.magic),
                "segment magic mismatch"
            );
            return Err(ShmError::MagicMismatch {
                expected: SEGMENT_MAGIC,
                actual: self.magic,
            });
        }
        if self.version != LAYOUT_VERSION {
            return Err(ShmError::corruption(format!(
                "unsupported layout version {} (expected {})",
                self.version, LAYOUT_VERSION
            )));
        }
        BuddyAllocator::validate_orders(self.min_order, self.max_order)
            .map_err(|e| ShmError::corruption(format!("header orders rejected: {}", e)))
    }

    /// Identifier without NUL padding
    pub fn identifier(&self) -> String {
        let end = self
            .identifier
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(IDENTIFIER_SIZE);
        String::from_utf8_lossy(&self.identifier[..end]).into_owned()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Seconds since the Unix epoch at creation
    pub fn create_time(&self) -> i64 {
        self.create_time
    }

    pub fn magic(&self) -> u32 {
        self.magic
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn min_order(&self) -> u32 {
        self.min_order
    }

    pub fn max_order(&self) -> u32 {
        self.max_order
    }

    /// Number of attaches so far
    pub fn visit_count(&self) -> u32 {
        self.visit_count.load(Ordering::Acquire)
    }

    /// Record one more attach and return the new count
    pub fn record_visit(&self) -> u32 {
        self.visit_count.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Offset published in `slot`
    pub fn root<T>(&self, slot: usize) -> Result<OffsetPtr<T>> {
        let cell = self.root_cell(slot)?;
        Ok(OffsetPtr::from_offset(cell.load(Ordering::Acquire)))
    }

    /// Publish `ptr` in `slot`, returning the previous value
    pub fn set_root<T>(&self, slot: usize, ptr: OffsetPtr<T>) -> Result<OffsetPtr<T>> {
        let cell = self.root_cell(slot)?;
        Ok(OffsetPtr::from_offset(cell.swap(ptr.offset(), Ordering::AcqRel)))
    }

    fn root_cell(&self, slot: usize) -> Result<&AtomicU64> {
        self.roots
            .get(slot)
            .ok_or_else(|| ShmError::index_out_of_bounds(slot as u64, ROOT_SLOTS as u64))
    }
}

impl std::fmt::Debug for SegmentHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentHeader")
            .field("identifier", &self.identifier())
            .field("total_size", &self.total_size)
            .field("create_time", &self.create_time)
            .field("visit_count", &self.visit_count())
            .field("magic", &format_args!("{:#010x}", self.magic))
            .field("version", &self.version)
            .field("min_order", &self.min_order)
            .field("max_order", &self.max_order)
            .finish()
    }
}

/// Encode `identifier` as a NUL-padded fixed array
pub fn encode_identifier(identifier: &str) -> Result<[u8; IDENTIFIER_SIZE]> {
    let bytes = identifier.as_bytes();
    if bytes.len() >= IDENTIFIER_SIZE {
        return Err(ShmError::invalid_parameter(
            "identifier",
            format!("at most {} bytes allowed", IDENTIFIER_SIZE - 1),
        ));
    }
    let mut encoded = [0u8; IDENTIFIER_SIZE];
    encoded[..bytes.len()].copy_from_slice(bytes);
    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;

    fn fresh(identifier: &str) -> Box<SegmentHeader> {
        let mut slot = Box::new(MaybeUninit::<SegmentHeader>::uninit());
        unsafe {
            SegmentHeader::initialize(slot.as_mut_ptr(), identifier, 4096, 4, 10, 1_700_000_000)
                .unwrap();
            Box::from_raw(Box::into_raw(slot).cast())
        }
    }

    #[test]
    fn test_initialize_and_validate() {
        let header = fresh("orders");
        assert!(header.validate().is_ok());
        assert_eq!(header.identifier(), "orders");
        assert_eq!(header.total_size(), 4096);
        assert_eq!(header.create_time(), 1_700_000_000);
        assert_eq!(header.magic(), SEGMENT_MAGIC);
        assert_eq!(header.visit_count(), 0);
        assert_eq!(header.record_visit(), 1);
        assert_eq!(header.record_visit(), 2);
        for slot in 0..ROOT_SLOTS {
            assert!(header.root::<u64>(slot).unwrap().is_null());
        }
    }

    #[test]
    fn test_root_slots() {
        let header = fresh("roots");
        let previous = header.set_root(2, OffsetPtr::<u64>::from_offset(0x40)).unwrap();
        assert!(previous.is_null());
        assert_eq!(header.root::<u64>(2).unwrap().offset(), 0x40);
        assert!(matches!(
            header.root::<u64>(ROOT_SLOTS),
            Err(ShmError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_bad_magic_and_version() {
        let mut header = fresh("x");
        header.magic = 0x1234_5678;
        assert!(matches!(header.validate(), Err(ShmError::MagicMismatch { .. })));
        header.magic = SEGMENT_MAGIC;
        header.version = 99;
        assert!(header.validate().unwrap_err().is_corruption());
    }

    #[test]
    fn test_identifier_encoding() {
        assert_eq!(&encode_identifier("abc").unwrap()[..4], b"abc\0");
        assert!(encode_identifier("0123456789abcde").is_ok());
        assert!(encode_identifier("0123456789abcdef").is_err());
    }
}
