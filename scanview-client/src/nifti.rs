use std::io::Read;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use flate2::read::GzDecoder;
use tracing::trace;

use scanview_core::{DecodeError, Volume, VolumeCodec};

// NIfTI-1 header field offsets (348-byte header).
const HEADER_LEN: usize = 348;
const DIM_OFFSET: usize = 40;
const DATATYPE_OFFSET: usize = 70;
const PIXDIM_OFFSET: usize = 76;
const VOX_OFFSET_OFFSET: usize = 108;
const SCL_SLOPE_OFFSET: usize = 112;
const SCL_INTER_OFFSET: usize = 116;
const MAGIC_OFFSET: usize = 344;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

// NIfTI-1 datatype codes.
const DT_UINT8: i16 = 2;
const DT_INT16: i16 = 4;
const DT_INT32: i16 = 8;
const DT_FLOAT32: i16 = 16;
const DT_FLOAT64: i16 = 64;
const DT_UINT16: i16 = 512;

/// Decodes NIfTI-1 files (`.nii`, gzipped or not) into [`Volume`]s.
///
/// Handles both byte orders, applies the header's `scl_slope`/`scl_inter`
/// rescale, and takes the first timepoint of 4D files. Voxels come out as
/// `f32` regardless of the on-disk datatype.
#[derive(Debug, Default)]
pub struct NiftiCodec;

impl NiftiCodec {
    pub fn new() -> Self {
        Self
    }
}

impl VolumeCodec for NiftiCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Volume, DecodeError> {
        let bytes = gunzip_if_needed(bytes)?;
        decode_nifti(&bytes)
    }
}

fn gunzip_if_needed(bytes: &[u8]) -> Result<Vec<u8>, DecodeError> {
    if !bytes.starts_with(&GZIP_MAGIC) {
        return Ok(bytes.to_vec());
    }
    let mut decoded = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut decoded)
        .map_err(|err| DecodeError::InvalidHeader {
            reason: format!("gzip stream corrupt: {err}"),
        })?;
    Ok(decoded)
}

fn decode_nifti(bytes: &[u8]) -> Result<Volume, DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::InvalidHeader {
            reason: format!("file shorter than the {HEADER_LEN}-byte header"),
        });
    }
    let magic = &bytes[MAGIC_OFFSET..MAGIC_OFFSET + 4];
    if magic != b"n+1\0" && magic != b"ni1\0" {
        return Err(DecodeError::InvalidHeader {
            reason: "missing NIfTI-1 magic".into(),
        });
    }

    // dim[0] is the dimensionality, always in 1..=7; if it reads outside
    // that window the file uses the other byte order.
    let dim0 = LittleEndian::read_i16(&bytes[DIM_OFFSET..]);
    if (1..=7).contains(&dim0) {
        decode_with_order::<LittleEndian>(bytes)
    } else {
        decode_with_order::<BigEndian>(bytes)
    }
}

fn decode_with_order<E: ByteOrder>(bytes: &[u8]) -> Result<Volume, DecodeError> {
    let ndim = E::read_i16(&bytes[DIM_OFFSET..]);
    if !(1..=7).contains(&ndim) {
        return Err(DecodeError::InvalidHeader {
            reason: format!("implausible dimensionality {ndim}"),
        });
    }
    let mut dims = [1u32; 3];
    for (axis, dim) in dims.iter_mut().enumerate().take(ndim.min(3) as usize) {
        let value = E::read_i16(&bytes[DIM_OFFSET + 2 * (axis + 1)..]);
        if value < 1 {
            return Err(DecodeError::InvalidHeader {
                reason: format!("dim[{}] = {value}", axis + 1),
            });
        }
        *dim = value as u32;
    }

    let mut spacing = [1.0f64; 3];
    for (axis, step) in spacing.iter_mut().enumerate() {
        let value = E::read_f32(&bytes[PIXDIM_OFFSET + 4 * (axis + 1)..]);
        if value.is_finite() && value != 0.0 {
            *step = f64::from(value.abs());
        }
    }

    let datatype = E::read_i16(&bytes[DATATYPE_OFFSET..]);
    let mut slope = E::read_f32(&bytes[SCL_SLOPE_OFFSET..]);
    let mut inter = E::read_f32(&bytes[SCL_INTER_OFFSET..]);
    // A zero slope means "no rescale" by convention.
    if slope == 0.0 || !slope.is_finite() {
        slope = 1.0;
        inter = 0.0;
    }

    let vox_offset = E::read_f32(&bytes[VOX_OFFSET_OFFSET..]);
    let data_start = (vox_offset.max(HEADER_LEN as f32)) as usize;

    let voxels = dims.iter().map(|&d| d as usize).product::<usize>();
    let voxel_size = match datatype {
        DT_UINT8 => 1,
        DT_INT16 | DT_UINT16 => 2,
        DT_INT32 | DT_FLOAT32 => 4,
        DT_FLOAT64 => 8,
        other => return Err(DecodeError::UnsupportedDataType(other)),
    };
    let needed = voxels * voxel_size;
    let available = bytes.len().saturating_sub(data_start);
    // 4D files carry extra timepoints after the first; only the first
    // volume's worth of bytes must be present.
    if available < needed {
        return Err(DecodeError::TruncatedData {
            expected: needed,
            actual: available,
        });
    }
    let raw = &bytes[data_start..data_start + needed];

    let mut data = Vec::with_capacity(voxels);
    match datatype {
        DT_UINT8 => {
            data.extend(raw.iter().map(|&v| f32::from(v) * slope + inter));
        }
        DT_INT16 => {
            for chunk in raw.chunks_exact(2) {
                data.push(f32::from(E::read_i16(chunk)) * slope + inter);
            }
        }
        DT_UINT16 => {
            for chunk in raw.chunks_exact(2) {
                data.push(f32::from(E::read_u16(chunk)) * slope + inter);
            }
        }
        DT_INT32 => {
            for chunk in raw.chunks_exact(4) {
                data.push(E::read_i32(chunk) as f32 * slope + inter);
            }
        }
        DT_FLOAT32 => {
            for chunk in raw.chunks_exact(4) {
                data.push(E::read_f32(chunk) * slope + inter);
            }
        }
        DT_FLOAT64 => {
            for chunk in raw.chunks_exact(8) {
                data.push((E::read_f64(chunk) * f64::from(slope) + f64::from(inter)) as f32);
            }
        }
        _ => unreachable!("datatype validated above"),
    }

    trace!(?dims, datatype, "decoded volume");
    Volume::new(dims, spacing, data).map_err(|err| DecodeError::InvalidHeader {
        reason: err.to_string(),
    })
}
