//! `.npy` array loading
//!
//! Reads format versions 1.0 to 3.0 for every plain numeric dtype, in either
//! byte order and either memory order. Element bytes are kept raw and
//! normalized to little-endian; the memory order is recorded so the MAT
//! writer can skip the transpose for Fortran-ordered arrays.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::TrajError;

const MAGIC: &[u8; 6] = b"\x93NUMPY";

/// Element types a `.npy` file can hold that this loader understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NpyDType {
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float16,
    Float32,
    Float64,
}

impl NpyDType {
    /// Parse the kind/size part of a descr such as `i4` or `f8`
    fn from_kind(kind: &str) -> Option<Self> {
        Some(match kind {
            "b1" => NpyDType::Bool,
            "i1" => NpyDType::Int8,
            "u1" => NpyDType::UInt8,
            "i2" => NpyDType::Int16,
            "u2" => NpyDType::UInt16,
            "i4" => NpyDType::Int32,
            "u4" => NpyDType::UInt32,
            "i8" => NpyDType::Int64,
            "u8" => NpyDType::UInt64,
            "f2" => NpyDType::Float16,
            "f4" => NpyDType::Float32,
            "f8" => NpyDType::Float64,
            _ => return None,
        })
    }

    /// Bytes per element
    pub fn size(self) -> usize {
        match self {
            NpyDType::Bool | NpyDType::Int8 | NpyDType::UInt8 => 1,
            NpyDType::Int16 | NpyDType::UInt16 | NpyDType::Float16 => 2,
            NpyDType::Int32 | NpyDType::UInt32 | NpyDType::Float32 => 4,
            NpyDType::Int64 | NpyDType::UInt64 | NpyDType::Float64 => 8,
        }
    }
}

/// Parsed `.npy` header dictionary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpyHeader {
    pub dtype: NpyDType,
    pub big_endian: bool,
    pub fortran_order: bool,
    pub shape: Vec<usize>,
}

/// Text following `'key':` in the header dictionary
fn dict_value<'a>(header: &'a str, key: &str) -> Result<&'a str> {
    let needle = format!("'{key}':");
    let start = header
        .find(&needle)
        .with_context(|| format!("header has no '{key}' entry"))?;
    Ok(header[start + needle.len()..].trim_start())
}

fn parse_descr(header: &str) -> Result<(NpyDType, bool)> {
    let value = dict_value(header, "descr")?;
    let Some(rest) = value.strip_prefix('\'') else {
        bail!("structured dtypes are not supported");
    };
    let descr = rest.split('\'').next().unwrap_or_default();

    let (order, kind) = match descr.chars().next() {
        Some(c @ ('<' | '>' | '|' | '=')) => (c, &descr[1..]),
        _ => ('=', descr),
    };
    let dtype =
        NpyDType::from_kind(kind).with_context(|| format!("unsupported dtype '{descr}'"))?;
    let big_endian = match order {
        '>' => true,
        '=' => cfg!(target_endian = "big"),
        _ => false,
    };
    Ok((dtype, big_endian && dtype.size() > 1))
}

fn parse_fortran_order(header: &str) -> Result<bool> {
    let value = dict_value(header, "fortran_order")?;
    if value.starts_with("True") {
        Ok(true)
    } else if value.starts_with("False") {
        Ok(false)
    } else {
        bail!("malformed fortran_order entry")
    }
}

fn parse_shape(header: &str) -> Result<Vec<usize>> {
    let value = dict_value(header, "shape")?;
    let inner = value
        .strip_prefix('(')
        .and_then(|v| v.split_once(')'))
        .map(|(inner, _)| inner)
        .context("malformed shape entry")?;
    inner
        .split(',')
        .map(str::trim)
        .filter(|dim| !dim.is_empty())
        .map(|dim| {
            // Python 2 era writers emit `3L`
            dim.trim_end_matches('L')
                .parse::<usize>()
                .with_context(|| format!("bad dimension '{dim}'"))
        })
        .collect()
}

impl NpyHeader {
    /// Parse the Python-literal header dictionary
    pub fn parse(header: &str) -> Result<Self> {
        let (dtype, big_endian) = parse_descr(header)?;
        Ok(Self {
            dtype,
            big_endian,
            fortran_order: parse_fortran_order(header)?,
            shape: parse_shape(header)?,
        })
    }

    pub fn elem_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Read the magic, version and header of a `.npy` stream
fn read_header<R: Read>(reader: &mut R) -> Result<NpyHeader> {
    let mut magic = [0u8; 6];
    reader.read_exact(&mut magic).context("file too short")?;
    if &magic != MAGIC {
        bail!("missing .npy magic string");
    }
    let major = reader.read_u8()?;
    let _minor = reader.read_u8()?;
    let header_len = match major {
        1 => usize::from(reader.read_u16::<LittleEndian>()?),
        2 | 3 => reader.read_u32::<LittleEndian>()? as usize,
        other => bail!("unsupported .npy format version {other}"),
    };
    let mut header = vec![0u8; header_len];
    reader.read_exact(&mut header).context("truncated header")?;
    NpyHeader::parse(&String::from_utf8_lossy(&header))
}

/// One array paired with the variable name it is stored under
#[derive(Debug, Clone, PartialEq)]
pub struct NamedArray {
    pub name: String,
    pub dtype: NpyDType,
    pub shape: Vec<usize>,
    /// Element bytes stored in Fortran (column-major) order
    pub fortran_order: bool,
    /// Little-endian element bytes
    pub data: Vec<u8>,
}

impl NamedArray {
    /// Load a `.npy` file, naming the array after the file's base name
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrajError> {
        let path = path.as_ref();
        let read = || -> Result<Self> {
            let file =
                File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
            Self::read(array_name(path), &mut BufReader::new(file))
        };
        read()
            .context("not a readable .npy array")
            .map_err(|source| TrajError::Load {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Decode a `.npy` stream
    pub fn read<R: Read>(name: String, reader: &mut R) -> Result<Self> {
        let header = read_header(reader)?;
        let nbytes = header
            .shape
            .iter()
            .try_fold(header.dtype.size(), |acc, &dim| acc.checked_mul(dim))
            .context("array size overflows")?;
        let mut data = vec![0u8; nbytes];
        reader
            .read_exact(&mut data)
            .with_context(|| format!("expected {nbytes} bytes of array data"))?;
        if header.big_endian {
            for elem in data.chunks_exact_mut(header.dtype.size()) {
                elem.reverse();
            }
        }
        Ok(Self {
            name,
            dtype: header.dtype,
            shape: header.shape,
            fortran_order: header.fortran_order,
            data,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn elem_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Base name of a path with its extension removed ("out/a.b.npy" -> "a.b")
pub fn array_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Build a version 1.0 `.npy` image; used to produce fixtures in tests
#[cfg(test)]
pub(crate) fn npy_bytes(descr: &str, fortran_order: bool, shape: &[usize], data: &[u8]) -> Vec<u8> {
    let dims: Vec<String> = shape.iter().map(ToString::to_string).collect();
    let shape = match dims.len() {
        1 => format!("({},)", dims[0]),
        _ => format!("({})", dims.join(", ")),
    };
    let order = if fortran_order { "True" } else { "False" };
    let mut header =
        format!("{{'descr': '{descr}', 'fortran_order': {order}, 'shape': {shape}, }}");
    while (10 + header.len() + 1) % 64 != 0 {
        header.push(' ');
    }
    header.push('\n');

    let mut bytes = MAGIC.to_vec();
    bytes.extend_from_slice(&[1, 0]);
    bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
    bytes.extend_from_slice(header.as_bytes());
    bytes.extend_from_slice(data);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};

    #[test]
    fn test_array_name() {
        assert_eq!(array_name(Path::new("data/trajectories.npy")), "trajectories");
        assert_eq!(array_name(Path::new("a.b.npy")), "a.b");
        assert_eq!(array_name(Path::new("noext")), "noext");
    }

    #[test]
    fn test_header_parse() {
        let header = NpyHeader::parse(
            "{'descr': '<i4', 'fortran_order': False, 'shape': (2, 3), }",
        )
        .unwrap();
        assert_eq!(header.dtype, NpyDType::Int32);
        assert!(!header.big_endian);
        assert!(!header.fortran_order);
        assert_eq!(header.shape, vec![2, 3]);

        let scalar = NpyHeader::parse("{'descr': '>f8', 'fortran_order': True, 'shape': (), }")
            .unwrap();
        assert!(scalar.big_endian);
        assert!(scalar.fortran_order);
        assert!(scalar.shape.is_empty());
        assert_eq!(scalar.elem_count(), 1);

        let vector =
            NpyHeader::parse("{'descr': '|u1', 'fortran_order': False, 'shape': (5,), }").unwrap();
        assert_eq!(vector.shape, vec![5]);
    }

    #[test]
    fn test_unsupported_descr_rejected() {
        assert!(NpyHeader::parse("{'descr': '<c16', 'fortran_order': False, 'shape': (1,), }")
            .is_err());
        assert!(NpyHeader::parse(
            "{'descr': [('a', '<i4')], 'fortran_order': False, 'shape': (1,), }"
        )
        .is_err());
    }

    #[test]
    fn test_load_candle_written_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("singular_vectors.npy");
        Tensor::arange(0f64, 6.0, &Device::Cpu)
            .unwrap()
            .reshape((3, 2))
            .unwrap()
            .write_npy(&path)
            .unwrap();

        let array = NamedArray::load(&path).unwrap();
        assert_eq!(array.name, "singular_vectors");
        assert_eq!(array.shape(), &[3, 2]);
        assert_eq!(array.dtype, NpyDType::Float64);
        assert!(!array.fortran_order);
        assert_eq!(&array.data[8..16], &1f64.to_le_bytes());
    }

    #[test]
    fn test_load_int32() {
        let data: Vec<u8> = [1i32, -2, 3].iter().flat_map(|v| v.to_le_bytes()).collect();
        let bytes = npy_bytes("<i4", false, &[3], &data);

        let array = NamedArray::read("ids".to_string(), &mut bytes.as_slice()).unwrap();
        assert_eq!(array.dtype, NpyDType::Int32);
        assert_eq!(array.shape(), &[3]);
        assert_eq!(array.data, data);
    }

    #[test]
    fn test_big_endian_normalized() {
        let data: Vec<u8> = [258u16, 1].iter().flat_map(|v| v.to_be_bytes()).collect();
        let bytes = npy_bytes(">u2", false, &[2], &data);

        let array = NamedArray::read("x".to_string(), &mut bytes.as_slice()).unwrap();
        assert_eq!(array.data, vec![2, 1, 1, 0]);
    }

    #[test]
    fn test_truncated_data_rejected() {
        let bytes = npy_bytes("<f4", false, &[4], &[0u8; 8]);
        assert!(NamedArray::read("x".to_string(), &mut bytes.as_slice()).is_err());
    }

    #[test]
    fn test_load_failure_keeps_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.npy");
        std::fs::write(&path, b"not an array").unwrap();

        let err = NamedArray::load(&path).unwrap_err();
        assert!(matches!(err, TrajError::Load { .. }));
        assert_eq!(err.path(), Some(path.as_path()));
    }

    #[test]
    fn test_candle_f32_descr() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.npy");
        Tensor::zeros(2, DType::F32, &Device::Cpu)
            .unwrap()
            .write_npy(&path)
            .unwrap();
        let array = NamedArray::load(&path).unwrap();
        assert_eq!(array.dtype, NpyDType::Float32);
        assert_eq!(array.data.len(), 8);
    }
}
