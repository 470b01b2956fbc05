//! 长度前缀帧
//!
//! 帧格式为 `<长度>:<负载>`，长度是不带前导 0 的十进制数（最小为 1），
//! 冒号之后紧跟恰好 `长度` 个字节的负载，负载之后没有任何分隔符。
//! 负载可以是任意字节（包括 `\0` 和 `:`），因为长度是显式给出的。

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// 每次从 socket 读数据前，读缓冲区至少预留的空间
pub(crate) const READ_CHUNK: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("At least {0} more bytes required")]
    InsufficientBytes(usize),
    #[error("Malformed length prefix")]
    MalformedLength,
    #[error("Missing colon after length prefix")]
    MissingColon,
    #[error("Length prefix overflow")]
    LengthOverflow,
    #[error("Empty message")]
    EmptyMessage,
}

impl Error {
    /// 除了数据不足以外，其它错误都说明字节流已经无法对齐
    pub fn is_violation(&self) -> bool {
        !matches!(self, Error::InsufficientBytes(_))
    }
}

/// 解析帧头，返回 (负载长度, 帧头长度)，帧头长度包含冒号
fn read_length(stream: &[u8]) -> Result<(usize, usize), Error> {
    let first = match stream.first() {
        Some(b) => *b,
        None => return Err(Error::InsufficientBytes(1)),
    };
    // 第一个数字不可以是 0
    if !(b'1'..=b'9').contains(&first) {
        return Err(Error::MalformedLength);
    }

    let mut len = (first - b'0') as usize;
    for (i, b) in stream.iter().copied().enumerate().skip(1) {
        match b {
            b'0'..=b'9' => {
                len = len
                    .checked_mul(10)
                    .and_then(|l| l.checked_add((b - b'0') as usize))
                    .ok_or(Error::LengthOverflow)?;
            }
            b':' => return Ok((len, i + 1)),
            _ => return Err(Error::MissingColon),
        }
    }

    // 长度还没读完
    Err(Error::InsufficientBytes(1))
}

/// 把一条消息编码成帧，追加到 stream 尾部，返回写入的字节数
pub fn write_frame(stream: &mut BytesMut, payload: &[u8]) -> Result<usize, Error> {
    if payload.is_empty() {
        return Err(Error::EmptyMessage);
    }

    let header = payload.len().to_string();
    stream.reserve(header.len() + 1 + payload.len());
    stream.put_slice(header.as_bytes());
    stream.put_u8(b':');
    stream.put_slice(payload);

    Ok(header.len() + 1 + payload.len())
}

/// 入站缓冲区
/// 只在尾部追加从 socket 读到的原始字节，只从头部取出完整的帧
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// 尝试从缓冲区头部取出一个完整的帧
    /// * 缓冲区数据不足时返回 `Error::InsufficientBytes`，已有数据保持不变
    /// * 其它错误都是协议违规，调用方需要关闭连接
    ///
    /// 一次读取可能带来多个帧，调用方需要循环调用直到返回错误
    pub fn try_extract_frame(&mut self) -> Result<Bytes, Error> {
        let (len, header_len) = read_length(&self.buf)?;

        let available = self.buf.len() - header_len;
        if available < len {
            return Err(Error::InsufficientBytes(len - available));
        }

        self.buf.advance(header_len);
        Ok(self.buf.split_to(len).freeze())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear()
    }

    /// 预留至少 READ_CHUNK 的空闲空间，供 socket 直接读入
    /// 按块增长而非按字节，减少重新分配的次数
    pub(crate) fn spare(&mut self) -> &mut BytesMut {
        if self.buf.capacity() - self.buf.len() < READ_CHUNK {
            self.buf.reserve(READ_CHUNK);
        }
        &mut self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(payload: &[u8]) -> BytesMut {
        let mut stream = BytesMut::new();
        write_frame(&mut stream, payload).unwrap();
        stream
    }

    #[test]
    fn write_frame_works() {
        let stream = encode(b"TEST OK");
        assert_eq!(&stream[..], b"7:TEST OK");

        let mut stream = BytesMut::new();
        let payload = vec![b'x'; 1234];
        assert_eq!(write_frame(&mut stream, &payload).unwrap(), 1239);
        assert!(stream.starts_with(b"1234:x"));

        assert!(matches!(
            write_frame(&mut stream, b""),
            Err(Error::EmptyMessage)
        ));
    }

    #[test]
    fn single_frame_works() {
        let mut buf = FrameBuffer::new();
        assert!(matches!(
            buf.try_extract_frame(),
            Err(Error::InsufficientBytes(_))
        ));

        buf.append(b"7:TEST OK");
        assert_eq!(&buf.try_extract_frame().unwrap()[..], b"TEST OK");
        assert!(buf.is_empty());
    }

    #[test]
    fn multiple_frames_in_one_read() {
        let mut buf = FrameBuffer::new();
        let mut stream = encode(b"OK");
        stream.extend_from_slice(&encode(b"DONE 5 all good"));
        stream.extend_from_slice(&encode(&[b'z'; 12]));
        buf.append(&stream);

        assert_eq!(&buf.try_extract_frame().unwrap()[..], b"OK");
        assert_eq!(&buf.try_extract_frame().unwrap()[..], b"DONE 5 all good");
        assert_eq!(&buf.try_extract_frame().unwrap()[..], &[b'z'; 12]);
        assert!(matches!(
            buf.try_extract_frame(),
            Err(Error::InsufficientBytes(_))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let stream = encode(b"FAILED 42 disk full");

        for k in 1..stream.len() {
            let mut buf = FrameBuffer::new();
            buf.append(&stream[..k]);
            match buf.try_extract_frame() {
                Err(Error::InsufficientBytes(n)) => assert!(n >= 1),
                other => panic!("prefix of {} bytes: {:?}", k, other),
            }
            // 数据不足时缓冲区不变
            assert_eq!(buf.len(), k);

            buf.append(&stream[k..]);
            assert_eq!(&buf.try_extract_frame().unwrap()[..], b"FAILED 42 disk full");
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn insufficient_bytes_counts_missing_payload() {
        let mut buf = FrameBuffer::new();
        buf.append(b"10:abc");
        assert!(matches!(
            buf.try_extract_frame(),
            Err(Error::InsufficientBytes(7))
        ));
    }

    #[test]
    fn leading_zero_rejected() {
        for stream in [&b"0:"[..], &b"05:abcde"[..], &b"0123:"[..]] {
            let mut buf = FrameBuffer::new();
            buf.append(stream);
            assert!(matches!(
                buf.try_extract_frame(),
                Err(Error::MalformedLength)
            ));
        }
    }

    #[test]
    fn malformed_prefix_rejected() {
        let mut buf = FrameBuffer::new();
        buf.append(b"OK");
        let err = buf.try_extract_frame().unwrap_err();
        assert!(matches!(err, Error::MalformedLength));
        assert!(err.is_violation());

        let mut buf = FrameBuffer::new();
        buf.append(b"12a:hello");
        assert!(matches!(buf.try_extract_frame(), Err(Error::MissingColon)));

        let mut buf = FrameBuffer::new();
        buf.append(b"99999999999999999999999999:x");
        assert!(matches!(buf.try_extract_frame(), Err(Error::LengthOverflow)));
    }

    #[test]
    fn binary_payload_works() {
        let payload = b"a:b\0c:\0";
        let mut buf = FrameBuffer::new();
        buf.append(&encode(payload));
        assert_eq!(&buf.try_extract_frame().unwrap()[..], payload);
    }

    #[test]
    fn spare_grows_by_chunk() {
        let mut buf = FrameBuffer::new();
        let spare = buf.spare();
        assert!(spare.capacity() - spare.len() >= READ_CHUNK);
        assert!(buf.is_empty());
    }
}
