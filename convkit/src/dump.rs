//! Binary tensor dump format for handing buffers between runs.
//!
//! Format (all multi-byte integers are big-endian):
//! ```text
//! [magic:   4 bytes]  "CKTD"
//! [version: 1 byte ]  0x01
//! [dtype:   1 byte ]  0 = fp32, 1 = fp16, 2 = bf16
//! [rank:    1 byte ]
//! [dims:    4 bytes x rank]
//! [payload: product(dims) raw bit patterns, 4 or 2 bytes each]
//! ```

use std::io::{Cursor, Read, Write};
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use half::f16;
use sha2::{Digest, Sha256};

use crate::dtype::{Bf16, DataType, Element};

const MAGIC: [u8; 4] = *b"CKTD";
const VERSION: u8 = 1;
const MAX_RANK: u8 = 8;

/// Element payload of a dump, kept in its storage format.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Fp32(Vec<f32>),
    Fp16(Vec<f16>),
    Bf16(Vec<Bf16>),
}

impl TensorData {
    /// Copy a typed buffer.
    pub fn from_elements<E: Element>(values: &[E]) -> Self {
        let bits = values.iter().map(|v| v.to_bits_u32());
        match E::DATA_TYPE {
            DataType::Fp32 => Self::Fp32(bits.map(f32::from_bits).collect()),
            DataType::Fp16 => Self::Fp16(bits.map(|b| f16::from_bits(b as u16)).collect()),
            DataType::Bf16 => Self::Bf16(bits.map(|b| Bf16::from_bits(b as u16)).collect()),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Self::Fp32(_) => DataType::Fp32,
            Self::Fp16(_) => DataType::Fp16,
            Self::Bf16(_) => DataType::Bf16,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Fp32(v) => v.len(),
            Self::Fp16(v) => v.len(),
            Self::Bf16(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Widen every element to `f32` for comparison.
    pub fn to_f32(&self) -> Vec<f32> {
        match self {
            Self::Fp32(v) => v.clone(),
            Self::Fp16(v) => v.iter().map(|x| x.to_f32()).collect(),
            Self::Bf16(v) => v.iter().map(|x| Element::to_f32(*x)).collect(),
        }
    }

    fn write_payload(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::Fp32(v) => {
                for x in v {
                    buf.write_u32::<BigEndian>(x.to_bits())?;
                }
            }
            Self::Fp16(v) => {
                for x in v {
                    buf.write_u16::<BigEndian>(x.to_bits())?;
                }
            }
            Self::Bf16(v) => {
                for x in v {
                    buf.write_u16::<BigEndian>(x.to_bits())?;
                }
            }
        }
        Ok(())
    }

    fn read_payload(cur: &mut Cursor<&[u8]>, data_type: DataType, len: usize) -> Result<Self> {
        let available = cur.get_ref().len().saturating_sub(cur.position() as usize);
        ensure!(
            available >= len * data_type.size_in_bytes(),
            "payload truncated: {len} {data_type} elements need {} bytes, {available} left",
            len * data_type.size_in_bytes()
        );
        Ok(match data_type {
            DataType::Fp32 => Self::Fp32(
                (0..len)
                    .map(|_| cur.read_u32::<BigEndian>().map(f32::from_bits))
                    .collect::<std::io::Result<_>>()?,
            ),
            DataType::Fp16 => Self::Fp16(
                (0..len)
                    .map(|_| cur.read_u16::<BigEndian>().map(f16::from_bits))
                    .collect::<std::io::Result<_>>()?,
            ),
            DataType::Bf16 => Self::Bf16(
                (0..len)
                    .map(|_| cur.read_u16::<BigEndian>().map(Bf16::from_bits))
                    .collect::<std::io::Result<_>>()?,
            ),
        })
    }
}

/// A shaped tensor on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDump {
    pub shape: Vec<usize>,
    pub data: TensorData,
}

impl TensorDump {
    pub fn new(shape: &[usize], data: TensorData) -> Result<Self> {
        let expected: usize = shape.iter().product();
        ensure!(
            expected == data.len(),
            "shape {shape:?} holds {expected} elements, data has {}",
            data.len()
        );
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        ensure!(
            self.shape.len() <= MAX_RANK as usize,
            "rank {} exceeds {MAX_RANK}",
            self.shape.len()
        );
        let mut buf = Vec::new();
        buf.write_all(&MAGIC)?;
        buf.write_u8(VERSION)?;
        buf.write_u8(self.data.data_type().tag())?;
        buf.write_u8(self.shape.len() as u8)?;
        for &dim in &self.shape {
            let dim = u32::try_from(dim).with_context(|| format!("dimension {dim} does not fit in u32"))?;
            buf.write_u32::<BigEndian>(dim)?;
        }
        self.data.write_payload(&mut buf)?;
        Ok(buf)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(data);

        let mut magic = [0u8; 4];
        cur.read_exact(&mut magic).context("failed to read dump magic")?;
        ensure!(magic == MAGIC, "invalid dump magic: expected CKTD");

        let version = cur.read_u8().context("failed to read dump version")?;
        ensure!(
            version == VERSION,
            "unsupported dump version {version}, expected {VERSION}"
        );

        let tag = cur.read_u8().context("failed to read data type")?;
        let Some(data_type) = DataType::from_tag(tag) else {
            bail!("unknown data type tag {tag}");
        };

        let rank = cur.read_u8().context("failed to read rank")?;
        if rank > MAX_RANK {
            bail!("unreasonable rank: {rank}");
        }
        let mut shape = Vec::with_capacity(rank as usize);
        for i in 0..rank {
            let dim = cur
                .read_u32::<BigEndian>()
                .with_context(|| format!("failed to read dimension {i}"))?;
            shape.push(dim as usize);
        }

        let len = shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .context("element count overflows")?;
        let payload = TensorData::read_payload(&mut cur, data_type, len)?;
        ensure!(
            cur.position() as usize == data.len(),
            "{} trailing bytes after payload",
            data.len() - cur.position() as usize
        );

        Ok(Self {
            shape,
            data: payload,
        })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        std::fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_bytes(&bytes).with_context(|| format!("failed to decode {}", path.display()))
    }

    /// SHA-256 of the big-endian payload, hex encoded.
    pub fn fingerprint(&self) -> Result<String> {
        let mut payload = Vec::with_capacity(self.data.len() * self.data.data_type().size_in_bytes());
        self.data.write_payload(&mut payload)?;
        Ok(format!("{:x}", Sha256::digest(&payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_keeps_bits() {
        let values = [Bf16::from_bits(0x7f81), Bf16::from_bits(0x3f80), Bf16::from_bits(0x8000)];
        let dump = TensorDump::new(&[1, 3], TensorData::from_elements(&values)).unwrap();
        let bytes = dump.to_bytes().unwrap();
        assert_eq!(&bytes[..4], b"CKTD");
        let decoded = TensorDump::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, dump);
        assert_eq!(decoded.data.data_type(), DataType::Bf16);
    }

    #[test]
    fn fingerprint_depends_on_bits() {
        let a = TensorDump::new(&[2], TensorData::Fp32(vec![0.0, 1.0])).unwrap();
        let b = TensorDump::new(&[2], TensorData::Fp32(vec![-0.0, 1.0])).unwrap();
        let fa = a.fingerprint().unwrap();
        assert_eq!(fa.len(), 64);
        assert_ne!(fa, b.fingerprint().unwrap());
        assert_eq!(fa, a.clone().fingerprint().unwrap());
    }

    #[test]
    fn corrupt_input_is_rejected() {
        let dump = TensorDump::new(&[2, 2], TensorData::Fp16(vec![f16::ONE; 4])).unwrap();
        let bytes = dump.to_bytes().unwrap();
        assert!(TensorDump::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(TensorDump::from_bytes(&bad_magic).is_err());
        let mut trailing = bytes;
        trailing.push(0);
        assert!(TensorDump::from_bytes(&trailing).is_err());
        assert!(TensorDump::new(&[3], TensorData::Fp32(vec![1.0])).is_err());
    }

    #[test]
    fn file_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.ckt");
        let dump = TensorDump::new(&[3], TensorData::Fp32(vec![1.0, 2.0, 3.0])).unwrap();
        dump.write(&path).unwrap();
        assert_eq!(TensorDump::read(&path).unwrap().data.to_f32(), vec![1.0, 2.0, 3.0]);
    }
}
