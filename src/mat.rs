//! MATLAB Level 5 MAT-file codec
//!
//! Writes one uncompressed, little-endian variable per file, laid out the way
//! `scipy.io.savemat` does by default:
//!
//! ```text
//! [ 116 bytes text | 8 bytes subsys offset | u16 version 0x0100 | "IM" ]
//! [ miMATRIX tag ]
//!   [ array flags (miUINT32, 8 bytes) ]
//!   [ dimensions  (miINT32)           ]
//!   [ name        (miINT8)            ]
//!   [ real part   (class data type)   ]
//! ```
//!
//! Every sub-element is padded to an 8-byte boundary. Data is column-major.
//! The header text carries no timestamp so equal inputs give equal files.

use std::borrow::Cow;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::Context;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::TrajError;
use crate::npy::{NamedArray, NpyDType};

const HEADER_TEXT_LEN: usize = 116;
const HEADER_LEN: usize = 128;
const VERSION: u16 = 0x0100;
const ENDIAN_INDICATOR: &[u8; 2] = b"IM";

const MI_INT8: u32 = 1;
const MI_UINT8: u32 = 2;
const MI_INT16: u32 = 3;
const MI_UINT16: u32 = 4;
const MI_INT32: u32 = 5;
const MI_UINT32: u32 = 6;
const MI_SINGLE: u32 = 7;
const MI_DOUBLE: u32 = 9;
const MI_INT64: u32 = 12;
const MI_UINT64: u32 = 13;
const MI_MATRIX: u32 = 14;
const MI_COMPRESSED: u32 = 15;

/// Array-flags bit marking a logical (boolean) array
const LOGICAL_FLAG: u32 = 0x0200;

/// MATLAB numeric array classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatClass {
    Double,
    Single,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
}

impl MatClass {
    /// `mx*_CLASS` code stored in the array flags
    pub fn class_code(self) -> u8 {
        match self {
            MatClass::Double => 6,
            MatClass::Single => 7,
            MatClass::Int8 => 8,
            MatClass::UInt8 => 9,
            MatClass::Int16 => 10,
            MatClass::UInt16 => 11,
            MatClass::Int32 => 12,
            MatClass::UInt32 => 13,
            MatClass::Int64 => 14,
            MatClass::UInt64 => 15,
        }
    }

    pub fn from_class_code(code: u8) -> Option<Self> {
        Some(match code {
            6 => MatClass::Double,
            7 => MatClass::Single,
            8 => MatClass::Int8,
            9 => MatClass::UInt8,
            10 => MatClass::Int16,
            11 => MatClass::UInt16,
            12 => MatClass::Int32,
            13 => MatClass::UInt32,
            14 => MatClass::Int64,
            15 => MatClass::UInt64,
            _ => return None,
        })
    }

    /// `mi*` data type of the real part
    fn data_type(self) -> u32 {
        match self {
            MatClass::Double => MI_DOUBLE,
            MatClass::Single => MI_SINGLE,
            MatClass::Int8 => MI_INT8,
            MatClass::UInt8 => MI_UINT8,
            MatClass::Int16 => MI_INT16,
            MatClass::UInt16 => MI_UINT16,
            MatClass::Int32 => MI_INT32,
            MatClass::UInt32 => MI_UINT32,
            MatClass::Int64 => MI_INT64,
            MatClass::UInt64 => MI_UINT64,
        }
    }

    /// Class for an `.npy` dtype; booleans are uint8, half floats widen to single
    pub fn for_dtype(dtype: NpyDType) -> Self {
        match dtype {
            NpyDType::Bool | NpyDType::UInt8 => MatClass::UInt8,
            NpyDType::Int8 => MatClass::Int8,
            NpyDType::Int16 => MatClass::Int16,
            NpyDType::UInt16 => MatClass::UInt16,
            NpyDType::Int32 => MatClass::Int32,
            NpyDType::UInt32 => MatClass::UInt32,
            NpyDType::Int64 => MatClass::Int64,
            NpyDType::UInt64 => MatClass::UInt64,
            NpyDType::Float16 | NpyDType::Float32 => MatClass::Single,
            NpyDType::Float64 => MatClass::Double,
        }
    }
}

/// Name, class and shape of one variable found in a MAT-file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatVariable {
    pub name: String,
    /// Raw `mx*_CLASS` code
    pub class_code: u8,
    /// Logical flag set in the array flags
    pub logical: bool,
    pub dims: Vec<usize>,
}

impl MatVariable {
    pub fn class(&self) -> Option<MatClass> {
        MatClass::from_class_code(self.class_code)
    }
}

fn padded(len: usize) -> usize {
    len.next_multiple_of(8)
}

/// MAT dimensions: at least two, 1-d arrays become row vectors
pub fn mat_dims(shape: &[usize]) -> Vec<usize> {
    match shape {
        [] => vec![1, 1],
        [n] => vec![1, *n],
        dims => dims.to_vec(),
    }
}

/// Reorder C-order element bytes into column-major (Fortran) order
fn column_major(data: &[u8], shape: &[usize], elem_size: usize) -> Vec<u8> {
    if shape.len() < 2 {
        return data.to_vec();
    }
    let mut strides = vec![1usize; shape.len()];
    for axis in (0..shape.len() - 1).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }

    let count: usize = shape.iter().product();
    let mut out = Vec::with_capacity(data.len());
    let mut index = vec![0usize; shape.len()];
    for _ in 0..count {
        let offset: usize = index.iter().zip(&strides).map(|(i, s)| i * s).sum();
        out.extend_from_slice(&data[offset * elem_size..(offset + 1) * elem_size]);
        // First axis varies fastest
        for (axis, i) in index.iter_mut().enumerate() {
            *i += 1;
            if *i < shape[axis] {
                break;
            }
            *i = 0;
        }
    }
    out
}

/// IEEE half-precision bits to f32 (exact)
fn f16_to_f32(bits: u16) -> f32 {
    let sign = u32::from(bits >> 15) << 31;
    let exponent = u32::from((bits >> 10) & 0x1f);
    let mantissa = u32::from(bits & 0x3ff);
    let bits32 = match (exponent, mantissa) {
        (0, 0) => sign,
        (0, _) => {
            // Subnormal: renormalize into the f32 exponent range
            let shift = mantissa.leading_zeros() - 21;
            let mantissa = (mantissa << shift) & 0x3ff;
            sign | ((113 - shift) << 23) | (mantissa << 13)
        }
        (0x1f, _) => sign | 0x7f80_0000 | (mantissa << 13),
        _ => sign | ((exponent + 112) << 23) | (mantissa << 13),
    };
    f32::from_bits(bits32)
}

/// Widen little-endian f16 element bytes to f32
fn widen_f16(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(2 * data.len());
    for chunk in data.chunks_exact(2) {
        let bits = u16::from_le_bytes([chunk[0], chunk[1]]);
        out.write_f32::<LittleEndian>(f16_to_f32(bits))?;
    }
    Ok(out)
}

/// Real-part bytes of `array` in MAT order
fn encode_payload(array: &NamedArray) -> anyhow::Result<Vec<u8>> {
    let (data, elem_size): (Cow<'_, [u8]>, usize) = match array.dtype {
        NpyDType::Float16 => (Cow::Owned(widen_f16(&array.data)?), 4),
        dtype => (Cow::Borrowed(array.data.as_slice()), dtype.size()),
    };
    if array.fortran_order {
        return Ok(data.into_owned());
    }
    Ok(column_major(&data, &array.shape, elem_size))
}

fn write_padding<W: Write>(writer: &mut W, len: usize) -> std::io::Result<()> {
    let pad = padded(len) - len;
    writer.write_all(&[0u8; 8][..pad])
}

fn write_tag<W: Write>(writer: &mut W, data_type: u32, nbytes: u32) -> std::io::Result<()> {
    writer.write_u32::<LittleEndian>(data_type)?;
    writer.write_u32::<LittleEndian>(nbytes)
}

fn write_header<W: Write>(writer: &mut W) -> std::io::Result<()> {
    let text = format!(
        "MATLAB 5.0 MAT-file, Platform: {}, Created by: traj-rs {}",
        std::env::consts::OS,
        env!("CARGO_PKG_VERSION")
    );
    let mut header_text = [b' '; HEADER_TEXT_LEN];
    let n = text.len().min(HEADER_TEXT_LEN);
    header_text[..n].copy_from_slice(&text.as_bytes()[..n]);
    writer.write_all(&header_text)?;
    writer.write_all(&[0u8; 8])?;
    writer.write_u16::<LittleEndian>(VERSION)?;
    writer.write_all(ENDIAN_INDICATOR)
}

fn to_u32(len: usize) -> Result<u32, TrajError> {
    u32::try_from(len).map_err(|_| TrajError::ArrayTooLarge { bytes: len as u64 })
}

/// Encode a complete MAT-file holding `array` under its name
pub fn encode_mat<W: Write>(writer: &mut W, array: &NamedArray) -> Result<(), TrajError> {
    let name = array.name.as_str();
    let class = MatClass::for_dtype(array.dtype);
    let dims = mat_dims(array.shape())
        .into_iter()
        .map(|d| i32::try_from(d).map_err(|_| TrajError::DimensionTooLarge { dim: d }))
        .collect::<Result<Vec<i32>, _>>()?;

    let payload = encode_payload(array).map_err(|source| TrajError::Save {
        path: name.into(),
        source,
    })?;

    let dims_len = 4 * dims.len();
    let matrix_len = 16
        + 8
        + padded(dims_len)
        + 8
        + padded(name.len())
        + 8
        + padded(payload.len());

    let io_err = |e: std::io::Error| TrajError::Save {
        path: name.into(),
        source: e.into(),
    };

    let mut flags = u32::from(class.class_code());
    if array.dtype == NpyDType::Bool {
        flags |= LOGICAL_FLAG;
    }

    write_header(writer).map_err(io_err)?;
    write_tag(writer, MI_MATRIX, to_u32(matrix_len)?).map_err(io_err)?;

    write_tag(writer, MI_UINT32, 8).map_err(io_err)?;
    writer
        .write_u32::<LittleEndian>(flags)
        .and_then(|()| writer.write_u32::<LittleEndian>(0))
        .map_err(io_err)?;

    write_tag(writer, MI_INT32, to_u32(dims_len)?).map_err(io_err)?;
    for &d in &dims {
        writer.write_i32::<LittleEndian>(d).map_err(io_err)?;
    }
    write_padding(writer, dims_len).map_err(io_err)?;

    write_tag(writer, MI_INT8, to_u32(name.len())?).map_err(io_err)?;
    writer.write_all(name.as_bytes()).map_err(io_err)?;
    write_padding(writer, name.len()).map_err(io_err)?;

    write_tag(writer, class.data_type(), to_u32(payload.len())?).map_err(io_err)?;
    writer.write_all(&payload).map_err(io_err)?;
    write_padding(writer, payload.len()).map_err(io_err)?;

    Ok(())
}

/// Write `array` to a MAT-file at `path`
pub fn write_mat(path: impl AsRef<Path>, array: &NamedArray) -> Result<(), TrajError> {
    let path = path.as_ref();
    let save_err = |source: anyhow::Error| TrajError::Save {
        path: path.to_path_buf(),
        source,
    };

    let file = File::create(path)
        .with_context(|| format!("cannot create {}", path.display()))
        .map_err(save_err)?;
    let mut writer = BufWriter::new(file);

    match encode_mat(&mut writer, array) {
        Ok(()) => {}
        Err(TrajError::Save { source, .. }) => return Err(save_err(source)),
        Err(other) => return Err(other),
    }
    writer.flush().map_err(|e| save_err(e.into()))?;
    Ok(())
}

/// Read one sub-element, handling the small (packed 4-byte) format
fn read_subelement<R: Read>(reader: &mut R) -> std::io::Result<(u32, Vec<u8>)> {
    let first = reader.read_u32::<LittleEndian>()?;
    if first >> 16 != 0 {
        let data_type = first & 0xFFFF;
        let size = (first >> 16) as usize;
        let mut data = [0u8; 4];
        reader.read_exact(&mut data)?;
        return Ok((data_type, data[..size.min(4)].to_vec()));
    }
    let size = reader.read_u32::<LittleEndian>()? as usize;
    let mut data = vec![0u8; padded(size)];
    reader.read_exact(&mut data)?;
    data.truncate(size);
    Ok((first, data))
}

/// List the variables of an uncompressed little-endian Level 5 MAT-file
pub fn read_variables(path: impl AsRef<Path>) -> Result<Vec<MatVariable>, TrajError> {
    let path = path.as_ref();
    let load_err = |source: anyhow::Error| TrajError::Load {
        path: path.to_path_buf(),
        source,
    };
    let io_err = |e: std::io::Error| load_err(e.into());

    let file = File::open(path)
        .with_context(|| format!("cannot open {}", path.display()))
        .map_err(load_err)?;
    let mut reader = BufReader::new(file);

    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).map_err(io_err)?;
    if &header[126..128] != ENDIAN_INDICATOR {
        return Err(TrajError::UnsupportedMat(
            "not a little-endian Level 5 MAT-file".to_string(),
        ));
    }

    let mut variables = Vec::new();
    loop {
        let data_type = match reader.read_u32::<LittleEndian>() {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(io_err(e)),
        };
        let nbytes = reader.read_u32::<LittleEndian>().map_err(io_err)?;
        let start = reader.stream_position().map_err(io_err)?;

        match data_type {
            MI_COMPRESSED => {
                return Err(TrajError::UnsupportedMat(
                    "compressed variables are not supported".to_string(),
                ))
            }
            MI_MATRIX => {
                let (_, flags) = read_subelement(&mut reader).map_err(io_err)?;
                let class_code = flags.first().copied().unwrap_or_default();
                let logical = flags
                    .get(1)
                    .is_some_and(|&b| (u32::from(b) << 8) & LOGICAL_FLAG != 0);

                let (_, raw_dims) = read_subelement(&mut reader).map_err(io_err)?;
                let dims = raw_dims
                    .chunks_exact(4)
                    .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]).max(0) as usize)
                    .collect();

                let (_, raw_name) = read_subelement(&mut reader).map_err(io_err)?;
                variables.push(MatVariable {
                    name: String::from_utf8_lossy(&raw_name).into_owned(),
                    class_code,
                    logical,
                    dims,
                });
            }
            _ => {}
        }

        let next = start + padded(nbytes as usize) as u64;
        reader.seek(SeekFrom::Start(next)).map_err(io_err)?;
    }

    Ok(variables)
}
