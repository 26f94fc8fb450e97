//! Typed access to the memory of the traced process.
//!
//! The stack walker never touches ptrace directly; it reads through the
//! [`RemoteMemory`] trait. The production implementation,
//! [`MemoryAccessor`], widens every request outward to word alignment and
//! proxies to the debugger's word-granular reads. Remote data structures
//! are described with [`RemotePtr`], a plain value carrying a target
//! virtual address and a type tag — dereferencing one copies bytes out of
//! the target, it never aliases target memory.

use crate::debugger::{Debugger, WORD_SIZE};
use crate::error::{Error, Result};
use std::fmt;
use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::slice;

/// Marker for types that mirror a remote structure byte for byte.
///
/// # Safety
///
/// Implementors must be `repr(C)` with the exact layout of the remote
/// structure, and every bit pattern must be a valid value (plain integers,
/// remote pointers and unions thereof). No host pointers or references.
pub unsafe trait Remote: Copy {}

unsafe impl Remote for u8 {}
unsafe impl Remote for i32 {}
unsafe impl Remote for u32 {}
unsafe impl Remote for i64 {}
unsafe impl Remote for u64 {}
unsafe impl Remote for f64 {}

/// A source of remote process memory.
pub trait RemoteMemory {
    /// Fills `out` with the bytes at `address`.
    ///
    /// `address` and `out.len()` may be arbitrary; implementations handle
    /// any alignment requirements of the underlying transport.
    fn read_into(&self, address: u64, out: &mut [u8]) -> Result<()>;

    /// Reads a NUL-terminated string of at most `maxlen` bytes.
    fn read_c_string(&self, address: u64, maxlen: usize) -> Result<String>;
}

/// Materializes a typed copy of remote memory.
///
/// The destination is zero-filled before the copy so padding bytes are
/// deterministic.
pub fn read_value<T: Remote>(mem: &dyn RemoteMemory, address: u64) -> Result<T> {
    let mut out = MaybeUninit::<T>::zeroed();
    let bytes = unsafe {
        slice::from_raw_parts_mut(out.as_mut_ptr() as *mut u8, mem::size_of::<T>())
    };
    mem.read_into(address, bytes)?;
    Ok(unsafe { out.assume_init() })
}

/// Word-aligned remote memory reads over a paused debugger target.
pub struct MemoryAccessor<'a> {
    debugger: &'a Debugger,
}

impl<'a> MemoryAccessor<'a> {
    /// Creates an accessor for the debugger's target.
    ///
    /// Reads only succeed while the target is paused.
    pub fn new(debugger: &'a Debugger) -> MemoryAccessor<'a> {
        MemoryAccessor { debugger }
    }
}

impl RemoteMemory for MemoryAccessor<'_> {
    fn read_into(&self, address: u64, out: &mut [u8]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }

        let low = round_down(address);
        let high = round_up(address + out.len() as u64);

        let mut buffer = vec![0; (high - low) as usize];
        let read = self.debugger.read_bytes(low, &mut buffer)?;
        debug_assert_eq!(read, buffer.len());

        let start = (address - low) as usize;
        out.copy_from_slice(&buffer[start..start + out.len()]);
        Ok(())
    }

    fn read_c_string(&self, address: u64, maxlen: usize) -> Result<String> {
        self.debugger.read_string(address, maxlen)
    }
}

fn round_down(n: u64) -> u64 {
    n & !(WORD_SIZE as u64 - 1)
}

fn round_up(n: u64) -> u64 {
    (n + WORD_SIZE as u64 - 1) & !(WORD_SIZE as u64 - 1)
}

/// A pointer into the traced process.
///
/// A remote pointer is a small copyable value: a target virtual address
/// tagged with the remote type it points at. Address zero is null. Casting
/// reinterprets the address; dereferencing copies the pointee out of the
/// target through a [`RemoteMemory`].
#[repr(C)]
pub struct RemotePtr<T> {
    address: u64,
    _type: PhantomData<*const T>,
}

impl<T> RemotePtr<T> {
    /// A pointer to the given target address.
    pub const fn new(address: u64) -> RemotePtr<T> {
        RemotePtr {
            address,
            _type: PhantomData,
        }
    }

    /// The null pointer.
    pub const fn null() -> RemotePtr<T> {
        RemotePtr::new(0)
    }

    /// Returns the target address.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Determines if the address is zero.
    pub fn is_null(&self) -> bool {
        self.address == 0
    }

    /// Reinterprets the pointer as pointing at another remote type.
    pub fn cast<P>(&self) -> RemotePtr<P> {
        RemotePtr::new(self.address)
    }

    /// Returns a pointer to the `index`th element of the array this
    /// pointer points at.
    pub fn at(&self, index: i64) -> RemotePtr<T> {
        let offset = index.wrapping_mul(mem::size_of::<T>() as i64);
        RemotePtr::new(self.address.wrapping_add(offset as u64))
    }
}

impl<T: Remote> RemotePtr<T> {
    /// Copies the pointee out of the target.
    ///
    /// Dereferencing null is an [`Error::InvalidCall`].
    pub fn read(&self, mem: &dyn RemoteMemory) -> Result<T> {
        if self.is_null() {
            return Err(Error::InvalidCall(
                "null remote pointer dereference".to_string(),
            ));
        }
        read_value(mem, self.address)
    }
}

impl<T> Default for RemotePtr<T> {
    fn default() -> RemotePtr<T> {
        RemotePtr::null()
    }
}

impl<T> Clone for RemotePtr<T> {
    fn clone(&self) -> RemotePtr<T> {
        *self
    }
}

impl<T> Copy for RemotePtr<T> {}

impl<T> PartialEq for RemotePtr<T> {
    fn eq(&self, other: &RemotePtr<T>) -> bool {
        self.address == other.address
    }
}

impl<T> Eq for RemotePtr<T> {}

impl<T> fmt::Debug for RemotePtr<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "RemotePtr({:#018x})", self.address)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// An in-process fake of target memory, for walker and accessor tests.
    pub struct ImageMemory {
        base: u64,
        bytes: Vec<u8>,
    }

    impl ImageMemory {
        pub fn new(base: u64, size: usize) -> ImageMemory {
            ImageMemory {
                base,
                bytes: vec![0; size],
            }
        }

        pub fn write_bytes(&mut self, address: u64, bytes: &[u8]) {
            let start = (address - self.base) as usize;
            self.bytes[start..start + bytes.len()].copy_from_slice(bytes);
        }

        pub fn write<T: Remote>(&mut self, address: u64, value: &T) {
            let bytes = unsafe {
                slice::from_raw_parts(value as *const T as *const u8, mem::size_of::<T>())
            };
            self.write_bytes(address, bytes);
        }
    }

    impl RemoteMemory for ImageMemory {
        fn read_into(&self, address: u64, out: &mut [u8]) -> Result<()> {
            let start = address
                .checked_sub(self.base)
                .ok_or_else(|| Error::BadState(format!("read below image at {:#x}", address)))?
                as usize;
            let end = start + out.len();
            if end > self.bytes.len() {
                return Err(Error::BadState(format!(
                    "read past image at {:#x}",
                    address
                )));
            }
            out.copy_from_slice(&self.bytes[start..end]);
            Ok(())
        }

        fn read_c_string(&self, address: u64, maxlen: usize) -> Result<String> {
            let start = (address - self.base) as usize;
            let mut out = Vec::new();
            for &b in self.bytes[start..].iter().take(maxlen) {
                if b == 0 {
                    break;
                }
                out.push(b);
            }
            Ok(String::from_utf8_lossy(&out).into_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ImageMemory;
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(round_down(0x1000), 0x1000);
        assert_eq!(round_down(0x1007), 0x1000);
        assert_eq!(round_up(0x1000), 0x1000);
        assert_eq!(round_up(0x1001), 0x1008);
        assert_eq!(round_up(0x1008), 0x1008);
    }

    #[test]
    fn pointer_arithmetic() {
        let p = RemotePtr::<u64>::new(0x1000);
        assert_eq!(p.at(2).address(), 0x1010);
        assert_eq!(p.at(0), p);
        assert_eq!(p.cast::<u8>().at(3).address(), 0x1003);
    }

    #[test]
    fn null_semantics() {
        let p = RemotePtr::<u32>::null();
        assert!(p.is_null());
        let mem = ImageMemory::new(0, 8);
        assert!(matches!(p.read(&mem), Err(Error::InvalidCall(_))));
    }

    #[test]
    fn typed_read_is_a_copy() {
        let mut mem = ImageMemory::new(0x2000, 64);
        mem.write(0x2010, &0xdead_beef_u32);
        let p = RemotePtr::<u32>::new(0x2010);
        assert_eq!(p.read(&mem).unwrap(), 0xdead_beef);
    }

    #[test]
    fn c_string_read() {
        let mut mem = ImageMemory::new(0x3000, 32);
        mem.write_bytes(0x3000, b"hello\0world");
        assert_eq!(mem.read_c_string(0x3000, 32).unwrap(), "hello");
        assert_eq!(mem.read_c_string(0x3000, 3).unwrap(), "hel");
    }
}
