//! Numeric storage formats and bit-exact conversions.
//!
//! Kernels only ever accumulate in `f32`. Storage elements are converted up
//! on read and down once on the final store:
//!
//! ```text
//! bf16 -> f32   zero-extend the 16 bits into the upper half of the word
//! f32  -> bf16  keep the upper half (optionally round-to-nearest-even first),
//!               forcing a mantissa bit on for NaNs whose payload lives in
//!               the dropped half
//! f16 <-> f32   IEEE conversion from the `half` crate
//! ```

use std::fmt;

use clap::ValueEnum;
use half::f16;
use serde::{Deserialize, Serialize};

/// Element formats understood by the kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Fp32,
    Fp16,
    Bf16,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fp32 => "fp32",
            Self::Fp16 => "fp16",
            Self::Bf16 => "bf16",
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        match self {
            Self::Fp32 => 4,
            Self::Fp16 | Self::Bf16 => 2,
        }
    }

    /// Stable tag used by the dump file format.
    pub(crate) fn tag(&self) -> u8 {
        match self {
            Self::Fp32 => 0,
            Self::Fp16 => 1,
            Self::Bf16 => 2,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Fp32),
            1 => Some(Self::Fp16),
            2 => Some(Self::Bf16),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How `f32 -> bf16` treats the discarded low half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bf16Rounding {
    /// Drop the low 16 bits.
    Truncate,
    /// Add `0x7fff + lsb` before dropping the low 16 bits.
    NearestEven,
}

impl Default for Bf16Rounding {
    fn default() -> Self {
        if cfg!(feature = "rne-bfloat16") {
            Self::NearestEven
        } else {
            Self::Truncate
        }
    }
}

/// Widen a bfloat16 bit pattern to `f32`.
#[inline]
pub fn bf16_to_f32(bits: u16) -> f32 {
    f32::from_bits(u32::from(bits) << 16)
}

/// Narrow an `f32` to a bfloat16 bit pattern.
#[inline]
pub fn f32_to_bf16(value: f32, rounding: Bf16Rounding) -> u16 {
    let mut bits = value.to_bits();
    if (!bits & 0x7f80_0000) == 0 {
        // Inf or NaN: a NaN whose payload sits only in the low half would
        // otherwise truncate to Inf.
        if bits & 0xffff != 0 {
            bits |= 0x1_0000;
        }
    } else if rounding == Bf16Rounding::NearestEven {
        bits += 0x7fff + ((bits >> 16) & 1);
    }
    (bits >> 16) as u16
}

/// bfloat16 storage element.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Bf16(u16);

impl Bf16 {
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn to_bits(self) -> u16 {
        self.0
    }

    /// Narrow with an explicit rounding mode.
    pub fn from_f32_with(value: f32, rounding: Bf16Rounding) -> Self {
        Self(f32_to_bf16(value, rounding))
    }
}

impl fmt::Debug for Bf16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bf16({:#06x} = {})", self.0, bf16_to_f32(self.0))
    }
}

/// A storage element the kernels can read and write.
pub trait Element: Copy + Default + Send + Sync + PartialEq + fmt::Debug + 'static {
    const DATA_TYPE: DataType;

    fn to_f32(self) -> f32;

    fn from_f32(value: f32) -> Self;

    /// Raw bit pattern, zero-extended.
    fn to_bits_u32(self) -> u32;

    fn from_bits_u32(bits: u32) -> Self;
}

impl Element for f32 {
    const DATA_TYPE: DataType = DataType::Fp32;

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        value
    }

    fn to_bits_u32(self) -> u32 {
        self.to_bits()
    }

    fn from_bits_u32(bits: u32) -> Self {
        f32::from_bits(bits)
    }
}

impl Element for f16 {
    const DATA_TYPE: DataType = DataType::Fp16;

    #[inline]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        f16::from_f32(value)
    }

    fn to_bits_u32(self) -> u32 {
        u32::from(self.to_bits())
    }

    fn from_bits_u32(bits: u32) -> Self {
        f16::from_bits(bits as u16)
    }
}

impl Element for Bf16 {
    const DATA_TYPE: DataType = DataType::Bf16;

    #[inline]
    fn to_f32(self) -> f32 {
        bf16_to_f32(self.0)
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        Self(f32_to_bf16(value, Bf16Rounding::default()))
    }

    fn to_bits_u32(self) -> u32 {
        u32::from(self.0)
    }

    fn from_bits_u32(bits: u32) -> Self {
        Self(bits as u16)
    }
}

/// Convert a slice of `f32` values into storage elements.
pub fn convert_from_f32<E: Element>(values: &[f32]) -> Vec<E> {
    values.iter().map(|&v| E::from_f32(v)).collect()
}

/// Widen storage elements to `f32`.
pub fn convert_to_f32<E: Element>(values: &[E]) -> Vec<f32> {
    values.iter().map(|v| v.to_f32()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bf16_widening_is_zero_extension() {
        assert_eq!(bf16_to_f32(0x3f80), 1.0);
        assert_eq!(bf16_to_f32(0xc000), -2.0);
        assert_eq!(bf16_to_f32(0x0000), 0.0);
        assert_eq!(bf16_to_f32(0x7f80), f32::INFINITY);
    }

    #[test]
    fn truncation_drops_low_half() {
        // 1.0 + 2^-8 + 2^-9 has bits below the bf16 mantissa.
        let value = f32::from_bits(0x3f80_c000);
        assert_eq!(f32_to_bf16(value, Bf16Rounding::Truncate), 0x3f80);
    }

    #[test]
    fn nearest_even_rounds_half_to_even() {
        // Exactly half way, lsb 0 -> stays.
        assert_eq!(f32_to_bf16(f32::from_bits(0x3f80_8000), Bf16Rounding::NearestEven), 0x3f80);
        // Exactly half way, lsb 1 -> rounds up to even.
        assert_eq!(f32_to_bf16(f32::from_bits(0x3f81_8000), Bf16Rounding::NearestEven), 0x3f82);
        // Above half way rounds up.
        assert_eq!(f32_to_bf16(f32::from_bits(0x3f80_8001), Bf16Rounding::NearestEven), 0x3f81);
    }

    #[test]
    fn nearest_even_overflows_to_infinity() {
        assert_eq!(f32_to_bf16(f32::MAX, Bf16Rounding::NearestEven), 0x7f80);
        assert_eq!(f32_to_bf16(f32::MAX, Bf16Rounding::Truncate), 0x7f7f);
    }

    #[test]
    fn signaling_nan_payload_survives() {
        // Payload only in the low half: plain truncation would yield +Inf.
        let snan = f32::from_bits(0x7f80_0001);
        for rounding in [Bf16Rounding::Truncate, Bf16Rounding::NearestEven] {
            let bits = f32_to_bf16(snan, rounding);
            assert_eq!(bits, 0x7f81);
            assert!(bf16_to_f32(bits).is_nan());
        }
        let neg_snan = f32::from_bits(0xff80_4000);
        assert_eq!(f32_to_bf16(neg_snan, Bf16Rounding::Truncate), 0xff81);
    }

    #[test]
    fn infinity_is_not_turned_into_nan() {
        assert_eq!(f32_to_bf16(f32::INFINITY, Bf16Rounding::NearestEven), 0x7f80);
        assert_eq!(f32_to_bf16(f32::NEG_INFINITY, Bf16Rounding::Truncate), 0xff80);
    }

    #[test]
    fn every_bf16_pattern_round_trips() {
        for bits in 0..=u16::MAX {
            let wide = bf16_to_f32(bits);
            assert_eq!(f32_to_bf16(wide, Bf16Rounding::Truncate), bits);
            assert_eq!(f32_to_bf16(wide, Bf16Rounding::NearestEven), bits);
        }
    }

    #[test]
    fn element_conversions_agree() {
        assert_eq!(<f16 as Element>::from_f32(0.5).to_f32(), 0.5);
        assert_eq!(Bf16::from_f32(-3.0).to_bits(), 0xc040);
        assert_eq!(Bf16::from_bits(0x4040).to_f32(), 3.0);
        assert_eq!(<f32 as Element>::from_bits_u32(1.5f32.to_bits()), 1.5);
    }

    #[test]
    fn data_type_tags_round_trip() {
        for dt in [DataType::Fp32, DataType::Fp16, DataType::Bf16] {
            assert_eq!(DataType::from_tag(dt.tag()), Some(dt));
        }
        assert_eq!(DataType::from_tag(9), None);
    }
}
