//! Versioned binary layout for trained parameters
//!
//! Flat little-endian blob: magic, version, dimension header, then every
//! matrix in row-major f32, closed by a CRC32 over all preceding bytes.
//! Round-trips are bit-equal.

use nalgebra::{DMatrix, DVector};

use crate::params::{LevelParams, NetworkParams, ScoringParams};
use crate::{Error, Result};

const MAGIC: &[u8; 6] = b"SHGAT\0";
const VERSION: u16 = 1;

pub fn export_params(params: &NetworkParams) -> Vec<u8> {
    let hidden_dim = params.hidden_dim();
    let mut buf = Vec::with_capacity(params.parameter_count() * 4 + 64);

    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&(params.embedding_dim as u32).to_le_bytes());
    buf.extend_from_slice(&(hidden_dim as u32).to_le_bytes());
    buf.extend_from_slice(&(params.num_heads as u32).to_le_bytes());
    buf.extend_from_slice(&(params.head_dim as u32).to_le_bytes());
    buf.extend_from_slice(&(params.levels.len() as u32).to_le_bytes());

    write_matrix(&mut buf, &params.w_intent);
    for h in 0..params.num_heads {
        write_matrix(&mut buf, &params.scoring.w_query[h]);
        write_matrix(&mut buf, &params.scoring.w_key[h]);
    }
    for level in &params.levels {
        for m in &level.w_child {
            write_matrix(&mut buf, m);
        }
        for m in &level.w_parent {
            write_matrix(&mut buf, m);
        }
        for v in &level.a_upward {
            write_vector(&mut buf, v);
        }
        for v in &level.a_downward {
            write_vector(&mut buf, v);
        }
    }

    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

pub fn import_params(bytes: &[u8]) -> Result<NetworkParams> {
    if bytes.len() < MAGIC.len() + 2 + 5 * 4 + 4 {
        return Err(Error::CorruptBlob("blob too short".to_string()));
    }

    let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let stored_crc = u32::from_le_bytes(crc_bytes.try_into().expect("split produced 4 bytes"));
    if crc32fast::hash(body) != stored_crc {
        return Err(Error::CorruptBlob("checksum mismatch".to_string()));
    }

    let mut reader = Reader::new(body);
    let magic = reader.take(MAGIC.len())?;
    if magic != MAGIC {
        return Err(Error::CorruptBlob("bad magic".to_string()));
    }
    let version = reader.read_u16()?;
    if version != VERSION {
        return Err(Error::VersionMismatch {
            expected: VERSION,
            actual: version,
        });
    }

    let embedding_dim = reader.read_u32()? as usize;
    let hidden_dim = reader.read_u32()? as usize;
    let num_heads = reader.read_u32()? as usize;
    let head_dim = reader.read_u32()? as usize;
    let num_levels = reader.read_u32()? as usize;

    if num_heads == 0 || head_dim == 0 || embedding_dim == 0 {
        return Err(Error::CorruptBlob("zero dimension in header".to_string()));
    }
    if hidden_dim != num_heads * head_dim {
        return Err(Error::CorruptBlob(format!(
            "hidden_dim {} is not num_heads {} * head_dim {}",
            hidden_dim, num_heads, head_dim
        )));
    }

    let w_intent = reader.read_matrix(hidden_dim, embedding_dim)?;
    let mut w_query = Vec::with_capacity(num_heads);
    let mut w_key = Vec::with_capacity(num_heads);
    for _ in 0..num_heads {
        w_query.push(reader.read_matrix(hidden_dim, hidden_dim)?);
        w_key.push(reader.read_matrix(hidden_dim, hidden_dim)?);
    }

    let mut levels = Vec::with_capacity(num_levels);
    for level in 0..num_levels {
        let input_dim = if level == 0 { embedding_dim } else { hidden_dim };
        let mut w_child = Vec::with_capacity(num_heads);
        let mut w_parent = Vec::with_capacity(num_heads);
        let mut a_upward = Vec::with_capacity(num_heads);
        let mut a_downward = Vec::with_capacity(num_heads);
        for _ in 0..num_heads {
            w_child.push(reader.read_matrix(head_dim, input_dim)?);
        }
        for _ in 0..num_heads {
            w_parent.push(reader.read_matrix(head_dim, input_dim)?);
        }
        for _ in 0..num_heads {
            a_upward.push(reader.read_vector(2 * head_dim)?);
        }
        for _ in 0..num_heads {
            a_downward.push(reader.read_vector(2 * head_dim)?);
        }
        levels.push(LevelParams {
            w_child,
            w_parent,
            a_upward,
            a_downward,
        });
    }

    if !reader.is_exhausted() {
        return Err(Error::CorruptBlob("trailing bytes".to_string()));
    }

    Ok(NetworkParams {
        embedding_dim,
        num_heads,
        head_dim,
        w_intent,
        scoring: ScoringParams { w_query, w_key },
        levels,
    })
}

fn write_matrix(buf: &mut Vec<u8>, m: &DMatrix<f32>) {
    for i in 0..m.nrows() {
        for j in 0..m.ncols() {
            buf.extend_from_slice(&m[(i, j)].to_le_bytes());
        }
    }
}

fn write_vector(buf: &mut Vec<u8>, v: &DVector<f32>) {
    for x in v.iter() {
        buf.extend_from_slice(&x.to_le_bytes());
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(Error::CorruptBlob("truncated blob".to_string()));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes(bytes.try_into().expect("2 bytes")))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4 bytes")))
    }

    fn read_f32s(&mut self, count: usize) -> Result<Vec<f32>> {
        let bytes = self.take(count * 4)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().expect("4 bytes")))
            .collect())
    }

    fn read_matrix(&mut self, rows: usize, cols: usize) -> Result<DMatrix<f32>> {
        let values = self.read_f32s(rows * cols)?;
        Ok(DMatrix::from_row_slice(rows, cols, &values))
    }

    fn read_vector(&mut self, len: usize) -> Result<DVector<f32>> {
        let values = self.read_f32s(len)?;
        Ok(DVector::from_vec(values))
    }

    fn is_exhausted(&self) -> bool {
        self.pos == self.bytes.len()
    }
}
