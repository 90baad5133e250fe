//! Target platform descriptors
//!
//! A platform fixes the pointer width and byte order used when a buffer's
//! typed values and relocations are encoded. The two built-in targets are
//! `x86` (4-byte pointers, little-endian) and `Power32` (4-byte pointers,
//! big-endian); further targets are registered as plain descriptors.

use crate::error::{BufferError, BufferResult};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

/// Byte order of a target platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    /// Write the low `out.len()` bytes of `value` in this byte order.
    pub fn encode_uint(self, value: u64, out: &mut [u8]) {
        let width = out.len();
        debug_assert!(width <= 8);
        match self {
            Endianness::Little => out.copy_from_slice(&value.to_le_bytes()[..width]),
            Endianness::Big => out.copy_from_slice(&value.to_be_bytes()[8 - width..]),
        }
    }

    /// Read an unsigned integer of `bytes.len()` bytes in this byte order.
    pub fn decode_uint(self, bytes: &[u8]) -> u64 {
        let width = bytes.len();
        debug_assert!(width <= 8);
        let mut raw = [0u8; 8];
        match self {
            Endianness::Little => {
                raw[..width].copy_from_slice(bytes);
                u64::from_le_bytes(raw)
            }
            Endianness::Big => {
                raw[8 - width..].copy_from_slice(bytes);
                u64::from_be_bytes(raw)
            }
        }
    }
}

/// Pointer width, byte order and a human-readable label.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Platform {
    label: Cow<'static, str>,
    pointer_width: u32,
    endianness: Endianness,
}

impl Platform {
    /// Little-endian, 32-bit pointers
    pub const X86: Platform = Platform {
        label: Cow::Borrowed("x86"),
        pointer_width: 4,
        endianness: Endianness::Little,
    };

    /// Big-endian, 32-bit pointers
    pub const POWER32: Platform = Platform {
        label: Cow::Borrowed("Power32"),
        pointer_width: 4,
        endianness: Endianness::Big,
    };

    /// Describe a new target. The pointer width must be 1, 2, 4 or 8 bytes.
    pub fn new(
        label: impl Into<Cow<'static, str>>,
        pointer_width: u32,
        endianness: Endianness,
    ) -> BufferResult<Self> {
        if !is_valid_width(pointer_width) {
            return Err(BufferError::invalid_state(format!(
                "unsupported pointer width {}",
                pointer_width
            )));
        }
        Ok(Self {
            label: label.into(),
            pointer_width,
            endianness,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pointer_width(&self) -> u32 {
        self.pointer_width
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn is_big_endian(&self) -> bool {
        self.endianness == Endianness::Big
    }

    /// Two platforms are compatible when relocations encode identically,
    /// regardless of label.
    pub fn compatible_with(&self, other: &Platform) -> bool {
        self.pointer_width == other.pointer_width && self.endianness == other.endianness
    }
}

impl Default for Platform {
    /// Power32, the historical default target.
    fn default() -> Self {
        Platform::POWER32
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let order = match self.endianness {
            Endianness::Little => "le",
            Endianness::Big => "be",
        };
        write!(f, "{}({}-byte ptr, {})", self.label, self.pointer_width, order)
    }
}

/// Whether `width` is an encodable integer width.
pub fn is_valid_width(width: u32) -> bool {
    matches!(width, 1 | 2 | 4 | 8)
}

/// Whether `value` is representable as an unsigned integer of `width` bytes.
pub fn fits_unsigned(value: i128, width: u32) -> bool {
    value >= 0 && value < (1i128 << (width * 8))
}

/// Whether `value` is representable as a two's complement integer of `width` bytes.
pub fn fits_signed(value: i128, width: u32) -> bool {
    let half = 1i128 << (width * 8 - 1);
    value >= -half && value < half
}

/// Lookup table of known platforms, keyed by label.
#[derive(Debug, Clone)]
pub struct PlatformRegistry {
    platforms: BTreeMap<String, Platform>,
}

impl PlatformRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            platforms: BTreeMap::new(),
        }
    }

    /// A registry holding `x86` and `Power32`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for platform in [Platform::X86, Platform::POWER32] {
            registry
                .platforms
                .insert(platform.label().to_string(), platform);
        }
        registry
    }

    /// Add a descriptor. Labels are unique.
    pub fn register(&mut self, platform: Platform) -> BufferResult<()> {
        if self.platforms.contains_key(platform.label()) {
            return Err(BufferError::invalid_state(format!(
                "platform '{}' is already registered",
                platform.label()
            )));
        }
        tracing::debug!(platform = %platform, "Registered platform");
        self.platforms
            .insert(platform.label().to_string(), platform);
        Ok(())
    }

    pub fn get(&self, label: &str) -> Option<&Platform> {
        self.platforms.get(label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Platform> {
        self.platforms.values()
    }

    pub fn len(&self) -> usize {
        self.platforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.platforms.is_empty()
    }
}

impl Default for PlatformRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_table() {
        assert_eq!(Platform::X86.pointer_width(), 4);
        assert!(!Platform::X86.is_big_endian());
        assert_eq!(Platform::POWER32.pointer_width(), 4);
        assert!(Platform::POWER32.is_big_endian());
        assert_eq!(Platform::default(), Platform::POWER32);
    }

    #[test]
    fn test_encode_uint_orders() {
        let mut le = [0u8; 4];
        Endianness::Little.encode_uint(0x0102_0304, &mut le);
        assert_eq!(le, [0x04, 0x03, 0x02, 0x01]);

        let mut be = [0u8; 4];
        Endianness::Big.encode_uint(0x0102_0304, &mut be);
        assert_eq!(be, [0x01, 0x02, 0x03, 0x04]);

        let mut short = [0u8; 2];
        Endianness::Big.encode_uint(0xBEEF, &mut short);
        assert_eq!(short, [0xBE, 0xEF]);
        assert_eq!(Endianness::Big.decode_uint(&short), 0xBEEF);
    }

    #[test]
    fn test_fits() {
        assert!(fits_unsigned(255, 1));
        assert!(!fits_unsigned(256, 1));
        assert!(!fits_unsigned(-1, 4));
        assert!(fits_signed(-128, 1));
        assert!(!fits_signed(128, 1));
        assert!(fits_signed(i32::MIN as i128, 4));
    }

    #[test]
    fn test_registry() {
        let mut registry = PlatformRegistry::with_builtins();
        assert_eq!(registry.len(), 2);
        assert!(registry.register(Platform::X86).is_err());

        let ppc64 = Platform::new("Power64", 8, Endianness::Big).unwrap();
        registry.register(ppc64.clone()).unwrap();
        assert_eq!(registry.get("Power64"), Some(&ppc64));
        assert!(!ppc64.compatible_with(&Platform::POWER32));
    }

    #[test]
    fn test_invalid_width() {
        assert!(Platform::new("odd", 3, Endianness::Little).is_err());
    }
}
