use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};


//TODO convenience for serializing / deserializing collections

pub fn put_string(buf: &mut BytesMut, s: &str) {
    put_blob(buf, s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let raw = try_get_blob(buf)?;
    let s = String::from_utf8(raw.to_vec())?;
    Ok(s)
}

/// NB: strings and blobs on the wire are limited to u16::MAX bytes. Longer values are truncated
///      on write, which can only happen for locally constructed notices that could never fit into
///      a datagram anyway.
pub fn put_blob(buf: &mut BytesMut, data: &[u8]) {
    let len = data.len().min(u16::MAX as usize);
    buf.put_u16(len as u16);
    buf.put_slice(&data[..len]);
}

pub fn try_get_blob(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = buf.try_get_u16()? as usize;
    take_exact(buf, len)
}

pub fn take_exact(buf: &mut impl Buf, len: usize) -> anyhow::Result<Bytes> {
    if buf.remaining() < len {
        bail!("expected {} bytes, only {} remaining", len, buf.remaining());
    }
    Ok(buf.copy_to_bytes(len))
}

pub fn try_get_flag(buf: &mut impl Buf) -> anyhow::Result<bool> {
    match buf.try_get_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        n => bail!("invalid flag value {}", n),
    }
}
