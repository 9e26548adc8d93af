//! Registered memory regions.
//!
//! A [`MemoryRegion`] owns a pinned byte buffer, optionally registered with
//! the verbs device, and sub-allocates it through a first-fit free list.
//! Engines share one region and compute wire addresses from its base.

mod freelist;
mod raw;

use std::sync::Mutex;

pub use self::freelist::FreeList;
use self::raw::RawBuffer;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::verbs::{Context, Gid, Pd, RegisteredMr};

/// The placement of a memory region's backing buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Plain page-aligned host memory.
    Host,
    /// Host memory backed by huge pages (falls back to regular pages when
    /// the huge-page pool is empty).
    HostHuge,
    /// Host memory bound to the given NUMA node.
    HostNuma(u32),
    /// Memory of the accelerator with the given device index. Scalar
    /// accesses bounce through a staging buffer.
    Device(u32),
}

impl MemoryKind {
    /// Whether this kind lives on an accelerator device.
    #[inline]
    pub fn is_device(&self) -> bool {
        matches!(self, MemoryKind::Device(_))
    }
}

/// Verbs-side resources of a registered region.
struct FabricState {
    context: Context,
    pd: Pd,
    mr: RegisteredMr,
    port_num: u8,
    lid: u16,
    gid: Gid,
    gid_index: Option<u8>,
}

/// A pinned byte buffer with an optional verbs registration and an internal
/// free-list allocator.
///
/// The region must outlive every engine built on top of it; engines hold it
/// through an `Arc`.
pub struct MemoryRegion {
    kind: MemoryKind,
    // Field order matters on drop: the registration must be torn down
    // while the mapping still exists.
    fabric: Option<FabricState>,
    buffer: RawBuffer,
    freelist: Mutex<FreeList>,
}

impl MemoryRegion {
    /// Allocate and register a region of `size` bytes.
    ///
    /// The device is selected by `config.device_name` (first device if
    /// unset); port attributes are read from `config.ib_port` and the GID
    /// from `config.gid_index`.
    pub fn new(kind: MemoryKind, size: usize, config: &Config) -> Result<Self> {
        Self::create(kind, size, config, true)
    }

    /// Allocate a region without a verbs registration. Such a region backs
    /// allocator and scalar use only; engines refuse it.
    pub fn new_unregistered(kind: MemoryKind, size: usize, config: &Config) -> Result<Self> {
        Self::create(kind, size, config, false)
    }

    fn create(kind: MemoryKind, size: usize, config: &Config, register: bool) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArg("zero-sized memory region".to_owned()));
        }

        // Device buffers are host-backed in this build; the index is kept so
        // the staging discipline and a future device allocator stay in place.
        if let MemoryKind::Device(index) = kind {
            log::debug!("device memory region on device {} uses host backing", index);
        }

        let buffer = RawBuffer::map(size, matches!(kind, MemoryKind::HostHuge))?;
        if let MemoryKind::HostNuma(node) = kind {
            buffer.bind_numa(node);
        }

        let fabric = if register {
            let context = Context::open(config.device_name.as_deref())
                .map_err(|e| Error::DeviceUnavailable(std::io::Error::other(e.to_string())))?;
            let pd = Pd::new(&context).map_err(Error::DeviceUnavailable)?;
            // SAFETY: the mapping is owned by `buffer` and outlives the
            // registration (see the field order of `MemoryRegion`).
            let mr = unsafe { RegisteredMr::register(&pd, buffer.as_ptr(), buffer.len()) }
                .map_err(Error::DeviceUnavailable)?;

            let port_attr = context
                .query_port(config.ib_port)
                .map_err(Error::DeviceUnavailable)?;
            let gid = match config.gid_index {
                Some(index) => context
                    .query_gid(config.ib_port, index)
                    .map_err(Error::DeviceUnavailable)?,
                None => Gid::ZERO,
            };

            Some(FabricState {
                context,
                pd,
                mr,
                port_num: config.ib_port,
                lid: port_attr.lid,
                gid,
                gid_index: config.gid_index,
            })
        } else {
            None
        };

        Ok(Self {
            kind,
            fabric,
            freelist: Mutex::new(FreeList::new(size)),
            buffer,
        })
    }

    /// The placement kind of this region.
    #[inline]
    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    /// Total size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    /// Base address of the buffer as used in wire-level addressing.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.buffer.as_ptr() as u64
    }

    /// Raw pointer to the byte at `offset`. The offset is not checked;
    /// callers normally go through the checked accessors.
    #[inline]
    pub fn ptr_at(&self, offset: usize) -> *mut u8 {
        self.buffer.as_ptr().wrapping_add(offset)
    }

    /// Whether the region carries a verbs registration.
    #[inline]
    pub fn is_registered(&self) -> bool {
        self.fabric.is_some()
    }

    fn fabric(&self) -> Result<&FabricState> {
        self.fabric.as_ref().ok_or_else(|| {
            Error::InvalidArg("memory region is not registered with the device".to_owned())
        })
    }

    /// Local key of the registration.
    pub fn lkey(&self) -> Result<u32> {
        Ok(self.fabric()?.mr.lkey())
    }

    /// Remote key of the registration.
    pub fn rkey(&self) -> Result<u32> {
        Ok(self.fabric()?.mr.rkey())
    }

    /// The device context this region is registered with.
    pub fn context(&self) -> Result<&Context> {
        Ok(&self.fabric()?.context)
    }

    /// The protection domain this region is registered with.
    pub fn pd(&self) -> Result<&Pd> {
        Ok(&self.fabric()?.pd)
    }

    /// HCA port index the region was set up for.
    pub fn port_num(&self) -> Result<u8> {
        Ok(self.fabric()?.port_num)
    }

    /// LID of the HCA port.
    pub fn lid(&self) -> Result<u16> {
        Ok(self.fabric()?.lid)
    }

    /// GID of the HCA port (zero when no GID index is configured).
    pub fn gid(&self) -> Result<Gid> {
        Ok(self.fabric()?.gid)
    }

    /// Configured GID table index, if any.
    pub fn gid_index(&self) -> Result<Option<u8>> {
        Ok(self.fabric()?.gid_index)
    }

    // ---- allocator ----

    /// Allocate `size` bytes from the region; returns the offset.
    pub fn alloc(&self, size: usize) -> Result<usize> {
        self.freelist.lock().unwrap().alloc(size)
    }

    /// Return an extent previously granted by [`Self::alloc`].
    pub fn free(&self, offset: usize) -> Result<()> {
        self.freelist.lock().unwrap().free(offset)
    }

    /// Number of free extents currently in the free list.
    pub fn free_extents(&self) -> usize {
        self.freelist.lock().unwrap().extent_count()
    }

    // ---- data access ----

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).map_or(true, |end| end > self.size()) {
            return Err(Error::InvalidArg(format!(
                "range [{}, {}+{}) exceeds region of {} bytes",
                offset, offset, len, self.size()
            )));
        }
        Ok(())
    }

    /// Copy `data` into the region at `offset`.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        // SAFETY: range checked above; the mapping is valid for writes.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr_at(offset), data.len());
        }
        Ok(())
    }

    /// Copy `buf.len()` bytes out of the region at `offset`.
    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        // SAFETY: range checked above; the mapping is valid for reads.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr_at(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Write a fixed-width integer at `offset`.
    ///
    /// Host kinds access the buffer directly; device kinds stage the value
    /// through a bounce buffer.
    pub fn write_scalar<T: Scalar>(&self, offset: usize, value: T) -> Result<()> {
        let mut staging = [0u8; 8];
        let bytes = value.put(&mut staging);
        self.write_bytes(offset, bytes)
    }

    /// Read a fixed-width integer from `offset`.
    pub fn read_scalar<T: Scalar>(&self, offset: usize) -> Result<T> {
        let mut staging = [0u8; 8];
        self.read_bytes(offset, &mut staging[..T::WIDTH])?;
        Ok(T::take(&staging))
    }

    /// Fill the whole region with a byte value.
    pub fn fill(&self, value: u8) {
        // SAFETY: the whole mapping is valid for writes.
        unsafe {
            std::ptr::write_bytes(self.buffer.as_ptr(), value, self.size());
        }
    }

    /// Fill the whole region with pseudo-random bytes.
    ///
    /// Benchmark buffers on device memory must not be compressible, or
    /// link-level compression inflates the measured throughput.
    pub fn fill_random(&self) {
        let mut state = 0x9E37_79B9_7F4A_7C15u64 ^ self.addr() ^ (self.size() as u64);
        let words = self.size() / 8;
        let ptr = self.buffer.as_ptr() as *mut u64;
        for i in 0..words {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            // SAFETY: i < size / 8; the mapping is valid for writes.
            unsafe { ptr.add(i).write_unaligned(state) };
        }
        for i in (words * 8)..self.size() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            // SAFETY: i < size.
            unsafe { self.buffer.as_ptr().add(i).write(state as u8) };
        }
    }
}

/// Fixed-width integers a region can read and write at an offset.
pub trait Scalar: Copy {
    /// Width in bytes.
    const WIDTH: usize;

    /// Serialize into the staging buffer; returns the used prefix.
    fn put(self, staging: &mut [u8; 8]) -> &[u8];

    /// Deserialize from the staging buffer.
    fn take(staging: &[u8; 8]) -> Self;
}

macro_rules! impl_scalar {
    ($($t:ty)*) => ($(
        impl Scalar for $t {
            const WIDTH: usize = std::mem::size_of::<$t>();

            fn put(self, staging: &mut [u8; 8]) -> &[u8] {
                staging[..Self::WIDTH].copy_from_slice(&self.to_ne_bytes());
                &staging[..Self::WIDTH]
            }

            fn take(staging: &[u8; 8]) -> Self {
                <$t>::from_ne_bytes(staging[..Self::WIDTH].try_into().unwrap())
            }
        }
    )*)
}

impl_scalar!(u8 i8 u16 i16 u32 i32 u64 i64);

#[cfg(test)]
mod tests {
    use super::*;

    fn host_region(size: usize) -> MemoryRegion {
        MemoryRegion::new_unregistered(MemoryKind::Host, size, &Config::default()).unwrap()
    }

    #[test]
    fn scalar_roundtrip_all_widths() {
        let region = host_region(4096);
        region.write_scalar::<u8>(0, 0xAB).unwrap();
        region.write_scalar::<i8>(8, -100).unwrap();
        region.write_scalar::<u16>(16, 0xBEEF).unwrap();
        region.write_scalar::<i16>(24, -30000).unwrap();
        region.write_scalar::<u32>(32, 0xDEAD_BEEF).unwrap();
        region.write_scalar::<i32>(40, -2_000_000_000).unwrap();
        region.write_scalar::<u64>(48, 0x0123_4567_89AB_CDEF).unwrap();
        region.write_scalar::<i64>(56, i64::MIN + 1).unwrap();

        assert_eq!(region.read_scalar::<u8>(0).unwrap(), 0xAB);
        assert_eq!(region.read_scalar::<i8>(8).unwrap(), -100);
        assert_eq!(region.read_scalar::<u16>(16).unwrap(), 0xBEEF);
        assert_eq!(region.read_scalar::<i16>(24).unwrap(), -30000);
        assert_eq!(region.read_scalar::<u32>(32).unwrap(), 0xDEAD_BEEF);
        assert_eq!(region.read_scalar::<i32>(40).unwrap(), -2_000_000_000);
        assert_eq!(region.read_scalar::<u64>(48).unwrap(), 0x0123_4567_89AB_CDEF);
        assert_eq!(region.read_scalar::<i64>(56).unwrap(), i64::MIN + 1);
    }

    #[test]
    fn device_kind_scalars_stage_through_bounce() {
        let region =
            MemoryRegion::new_unregistered(MemoryKind::Device(0), 4096, &Config::default())
                .unwrap();
        region.write_scalar::<u64>(128, 42).unwrap();
        assert_eq!(region.read_scalar::<u64>(128).unwrap(), 42);
        assert!(region.kind().is_device());
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let region = host_region(64);
        assert!(region.write_scalar::<u64>(60, 1).is_err());
        assert!(region.read_scalar::<u32>(62).is_err());
        assert!(region.write_bytes(0, &[0; 65]).is_err());
    }

    #[test]
    fn alloc_free_through_region() {
        let region = host_region(1024);
        let a = region.alloc(600).unwrap();
        assert!(matches!(region.alloc(600), Err(Error::OutOfMemory)));
        region.free(a).unwrap();
        assert_eq!(region.free_extents(), 1);
    }

    #[test]
    fn fill_random_is_not_constant() {
        let region = host_region(4096);
        region.fill(0);
        region.fill_random();
        let first = region.read_scalar::<u64>(0).unwrap();
        let second = region.read_scalar::<u64>(8).unwrap();
        let third = region.read_scalar::<u64>(1024).unwrap();
        assert!(first != second || second != third);
    }

    #[test]
    fn fill_sets_every_byte() {
        let region = host_region(128);
        region.fill(0x5A);
        let mut buf = [0u8; 128];
        region.read_bytes(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x5A));
    }
}
