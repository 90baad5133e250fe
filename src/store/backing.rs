//! Memory backings for [`ByteStore`](super::ByteStore)
//!
//! A backing hands out a contiguous, zero-initialised byte region that can
//! grow. `HeapBacking` grows a `Vec`; `VirtualBacking` reserves address space
//! up front and commits pages on demand, so the data never moves.

use crate::error::{BufferError, BufferResult};

/// Reserve/commit capability behind a byte store.
pub trait Backing: Send {
    /// Reserve room for up to `max_size` bytes without committing them.
    fn reserve(&mut self, max_size: usize) -> BufferResult<()>;

    /// Make at least `up_to` bytes usable. Newly committed bytes read as zero.
    fn commit(&mut self, up_to: usize) -> BufferResult<()>;

    /// Number of usable bytes.
    fn committed(&self) -> usize;

    fn as_slice(&self) -> &[u8];

    fn as_mut_slice(&mut self) -> &mut [u8];

    /// Move the first `len` bytes out, leaving the backing empty.
    fn take(&mut self, len: usize) -> Vec<u8>;

    /// Give back every committed byte. Any reservation and limit stay.
    fn decommit(&mut self);

    fn is_virtual(&self) -> bool;
}

/// Plain growable heap allocation.
#[derive(Debug, Default)]
pub struct HeapBacking {
    data: Vec<u8>,
    limit: Option<usize>,
}

impl HeapBacking {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backing for HeapBacking {
    fn reserve(&mut self, max_size: usize) -> BufferResult<()> {
        self.limit = Some(max_size);
        Ok(())
    }

    fn commit(&mut self, up_to: usize) -> BufferResult<()> {
        if let Some(limit) = self.limit {
            if up_to > limit {
                return Err(BufferError::capacity(up_to as u64, limit as u64));
            }
        }
        if up_to > self.data.len() {
            self.data.resize(up_to, 0);
        }
        Ok(())
    }

    fn committed(&self) -> usize {
        self.data.len()
    }

    fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn take(&mut self, len: usize) -> Vec<u8> {
        let mut data = std::mem::take(&mut self.data);
        data.truncate(len);
        data
    }

    fn decommit(&mut self) {
        self.data = Vec::new();
    }

    fn is_virtual(&self) -> bool {
        false
    }
}

#[cfg(unix)]
pub use self::unix::VirtualBacking;

#[cfg(unix)]
mod unix {
    use super::Backing;
    use crate::error::{BufferError, BufferResult};
    use std::ptr::NonNull;

    #[cfg(target_os = "linux")]
    const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
    #[cfg(not(target_os = "linux"))]
    const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

    /// Address space reserved with `mmap(PROT_NONE)`, committed with `mprotect`.
    pub struct VirtualBacking {
        base: Option<NonNull<u8>>,
        reserved: usize,
        committed: usize,
        page_size: usize,
    }

    impl VirtualBacking {
        pub fn new() -> Self {
            Self {
                base: None,
                reserved: 0,
                committed: 0,
                page_size: page_size(),
            }
        }

        fn round_to_page(&self, len: usize) -> usize {
            len.div_ceil(self.page_size) * self.page_size
        }

        fn unmap(&mut self) {
            if let Some(base) = self.base.take() {
                unsafe {
                    libc::munmap(base.as_ptr() as *mut libc::c_void, self.reserved);
                }
            }
            self.reserved = 0;
            self.committed = 0;
        }
    }

    impl Default for VirtualBacking {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Backing for VirtualBacking {
        fn reserve(&mut self, max_size: usize) -> BufferResult<()> {
            if self.base.is_some() {
                return Err(BufferError::invalid_state(
                    "virtual range is already reserved",
                ));
            }
            let len = self.round_to_page(max_size.max(1));
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_NONE,
                    RESERVE_FLAGS,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(std::io::Error::last_os_error().into());
            }
            self.base = NonNull::new(ptr as *mut u8);
            self.reserved = len;
            tracing::debug!(reserved = len, "Reserved virtual range");
            Ok(())
        }

        fn commit(&mut self, up_to: usize) -> BufferResult<()> {
            if up_to <= self.committed {
                return Ok(());
            }
            let base = match self.base {
                Some(base) => base,
                None => return Err(BufferError::capacity(up_to as u64, 0u64)),
            };
            let target = self.round_to_page(up_to).min(self.reserved);
            if up_to > target {
                return Err(BufferError::capacity(up_to as u64, self.reserved as u64));
            }
            let rc = unsafe {
                libc::mprotect(
                    base.as_ptr().add(self.committed) as *mut libc::c_void,
                    target - self.committed,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            };
            if rc != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            self.committed = target;
            Ok(())
        }

        fn committed(&self) -> usize {
            self.committed
        }

        fn as_slice(&self) -> &[u8] {
            match self.base {
                Some(base) => unsafe { std::slice::from_raw_parts(base.as_ptr(), self.committed) },
                None => &[],
            }
        }

        fn as_mut_slice(&mut self) -> &mut [u8] {
            match self.base {
                Some(base) => unsafe {
                    std::slice::from_raw_parts_mut(base.as_ptr(), self.committed)
                },
                None => &mut [],
            }
        }

        fn take(&mut self, len: usize) -> Vec<u8> {
            let data = self.as_slice()[..len.min(self.committed)].to_vec();
            self.unmap();
            data
        }

        fn decommit(&mut self) {
            let base = match self.base {
                Some(base) if self.committed > 0 => base,
                _ => return,
            };
            // map fresh PROT_NONE pages over the committed range
            let ptr = unsafe {
                libc::mmap(
                    base.as_ptr() as *mut libc::c_void,
                    self.committed,
                    libc::PROT_NONE,
                    RESERVE_FLAGS | libc::MAP_FIXED,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                tracing::warn!(
                    committed = self.committed,
                    "Failed to decommit virtual range, zeroing instead"
                );
                self.as_mut_slice().fill(0);
                return;
            }
            self.committed = 0;
        }

        fn is_virtual(&self) -> bool {
            true
        }
    }

    impl Drop for VirtualBacking {
        fn drop(&mut self) {
            self.unmap();
        }
    }

    // Safety: the mapping is owned exclusively by this value.
    unsafe impl Send for VirtualBacking {}

    fn page_size() -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    }
}

/// Hosts without `mmap` fall back to a bounded heap allocation.
#[cfg(not(unix))]
#[derive(Debug, Default)]
pub struct VirtualBacking {
    heap: HeapBacking,
}

#[cfg(not(unix))]
impl VirtualBacking {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(not(unix))]
impl Backing for VirtualBacking {
    fn reserve(&mut self, max_size: usize) -> BufferResult<()> {
        self.heap.reserve(max_size)
    }

    fn commit(&mut self, up_to: usize) -> BufferResult<()> {
        self.heap.commit(up_to)
    }

    fn committed(&self) -> usize {
        self.heap.committed()
    }

    fn as_slice(&self) -> &[u8] {
        self.heap.as_slice()
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        self.heap.as_mut_slice()
    }

    fn take(&mut self, len: usize) -> Vec<u8> {
        self.heap.take(len)
    }

    fn decommit(&mut self) {
        self.heap.decommit();
    }

    fn is_virtual(&self) -> bool {
        true
    }
}
