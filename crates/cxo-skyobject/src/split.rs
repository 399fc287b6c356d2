//! Storing byte streams as Refs of fixed-size chunks.

use std::io::{self, Read, Write};

use cxo_types::Hash;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{SkyError, SkyResult};
use crate::pack::Pack;
use crate::refs::Refs;
use crate::registry::Value;

/// Bytes the typed encoding adds around chunk data (a u64 length).
pub const CHUNK_OVERHEAD: usize = 8;

/// A piece of a split stream.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub data: Vec<u8>,
}

impl Value for Chunk {
    const SCHEMA: &'static str = "cxo.Chunk";
}

/// Payload bytes per chunk so that an encoded chunk takes at most
/// `max_object_size` bytes.
pub fn chunk_size(max_object_size: usize) -> SkyResult<usize> {
    max_object_size
        .checked_sub(CHUNK_OVERHEAD)
        .filter(|&n| n > 0)
        .ok_or(SkyError::InvalidChunkSize(max_object_size))
}

/// Replace the content of `out` by the chunks of `reader`.
///
/// On failure `out` is left empty and the chunks stored so far are
/// released.
pub fn split<R: Read>(
    pack: &Pack,
    reader: R,
    max_object_size: usize,
    out: &mut Refs,
) -> SkyResult<()> {
    let size = chunk_size(max_object_size)?;
    out.clear(pack)?;

    let mut added = Vec::new();
    match append_chunks(pack, reader, size, out, &mut added) {
        Ok(total) => {
            debug!(bytes = total, chunk = size, "stream split");
            Ok(())
        }
        Err(e) => {
            for hash in &added {
                if let Err(release) = pack.release(hash) {
                    warn!(hash = %hash, error = %release, "cannot release chunk");
                }
            }
            if let Err(clear) = out.clear(pack) {
                warn!(error = %clear, "cannot clear refs of failed split");
            }
            debug!(chunks = added.len(), error = %e, "split failed");
            Err(e)
        }
    }
}

/// Store chunks of `size` bytes and append them to `out`, recording each
/// stored hash in `added`. Returns the bytes read.
fn append_chunks<R: Read>(
    pack: &Pack,
    mut reader: R,
    size: usize,
    out: &mut Refs,
    added: &mut Vec<Hash>,
) -> SkyResult<usize> {
    let mut buf = vec![0u8; size];
    let mut total = 0usize;
    loop {
        let n = read_full(&mut reader, &mut buf)?;
        if n == 0 {
            break;
        }
        let hash = pack.add_value(&Chunk {
            data: buf[..n].to_vec(),
        })?;
        added.push(hash);
        out.append_hashes(pack, &[hash])?;
        total += n;
        if n < size {
            break;
        }
    }
    Ok(total)
}

/// Write the chunks of `refs` in order. Returns the bytes written.
pub fn concat<W: Write>(pack: &Pack, refs: &mut Refs, mut writer: W) -> SkyResult<u64> {
    let mut written = 0u64;
    refs.ascend(pack, &mut |_, i, hash| {
        if hash.is_zero() {
            return Err(SkyError::RefsElementIsNil(i));
        }
        let chunk: Chunk = pack.get_value(&hash)?;
        writer.write_all(&chunk.data)?;
        written += chunk.data.len() as u64;
        Ok(())
    })?;
    writer.flush()?;
    Ok(written)
}

/// Fill `buf` unless the reader ends first.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
