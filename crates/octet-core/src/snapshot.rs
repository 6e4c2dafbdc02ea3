//! Snapshot codec — length-prefixed binary serialization of the map
//!
//! Layout (all integers 4-byte **little-endian**):
//!
//! ```text
//! u32  count
//! repeat count times:
//!   u32  id_length     id_bytes
//!   u32  value_length  value_bytes
//! ```
//!
//! There is no checksum; corruption is detected only by structural decode
//! failure (truncation, a length exceeding the remaining bytes). A failed
//! decode rejects the whole snapshot and recovery falls back to the journal.

use hashbrown::HashMap;

/// Serialize the map. A snapshot of an empty map is exactly four zero bytes.
pub fn encode_map(map: &HashMap<String, Vec<u8>>) -> Vec<u8> {
    let count = map.len() as u32;

    // Exact final size, so the buffer is allocated once.
    let mut total = std::mem::size_of::<u32>();
    for (id, value) in map {
        total += std::mem::size_of::<u32>() + id.len() + std::mem::size_of::<u32>() + value.len();
    }

    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&count.to_le_bytes());
    for (id, value) in map {
        buf.extend_from_slice(&(id.len() as u32).to_le_bytes());
        buf.extend_from_slice(id.as_bytes());
        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        buf.extend_from_slice(value);
    }
    buf
}

/// Deserialize a snapshot. Returns `None` on any structural failure.
pub fn decode_map(buf: &[u8]) -> Option<HashMap<String, Vec<u8>>> {
    let mut pos = 0usize;

    let count = read_u32(buf, &mut pos)?;
    let mut map = HashMap::with_capacity(count as usize);

    for _ in 0..count {
        let id_len = read_u32(buf, &mut pos)? as usize;
        let id_bytes = read_bytes(buf, &mut pos, id_len)?;
        // Identifiers are textual; a non-UTF-8 id means the file is garbage.
        let id = std::str::from_utf8(id_bytes).ok()?.to_string();

        let value_len = read_u32(buf, &mut pos)? as usize;
        let value = read_bytes(buf, &mut pos, value_len)?.to_vec();

        map.insert(id, value);
    }

    Some(map)
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Option<u32> {
    let bytes = read_bytes(buf, pos, std::mem::size_of::<u32>())?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_bytes<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Option<&'a [u8]> {
    let end = pos.checked_add(len)?;
    if end > buf.len() {
        return None;
    }
    let slice = &buf[*pos..end];
    *pos = end;
    Some(slice)
}
