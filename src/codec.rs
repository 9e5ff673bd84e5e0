//! Frame codec: a bidirectional transformer between a raw byte stream and a
//! sequence of opaque message buffers, framed with an unsigned LEB128
//! length prefix (little-endian group order, MSB as continuation flag).

use tokio::io::{AsyncRead, AsyncReadExt};

/// Encode `payload`'s length as a varint and append it, followed by
/// `payload` itself, onto `buf`.
pub fn encode(payload: &[u8], buf: &mut Vec<u8>) {
    encode_varint(payload.len() as u64, buf);
    buf.extend_from_slice(payload);
}

fn encode_varint(mut value: u64, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated varint length prefix")]
    TruncatedVarint,
    #[error("truncated message payload: expected {expected} bytes, stream ended early")]
    TruncatedPayload { expected: u64 },
    #[error("varint length prefix overflows a 32-bit message length")]
    LengthOverflow,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read a single varint-prefixed frame from `reader`.
///
/// Returns `Ok(None)` on a clean EOF before any bytes of a new frame have
/// been read. Any other truncation (mid-varint, or mid-payload) is a fatal
/// [`DecodeError`].
pub async fn decode_frame<R>(mut reader: R) -> Result<Option<Vec<u8>>, DecodeError>
where
    R: AsyncRead + Unpin,
{
    let mut length: u64 = 0;
    let mut shift: u32 = 0;

    let length = loop {
        let mut byte = [0u8; 1];
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            if shift == 0 {
                return Ok(None); // Clean EOF between frames.
            }
            return Err(DecodeError::TruncatedVarint);
        }

        length |= ((byte[0] & 0x7f) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            break length;
        }
        shift += 7;
        if shift >= 64 {
            return Err(DecodeError::LengthOverflow);
        }
    };

    if length > u32::MAX as u64 {
        return Err(DecodeError::LengthOverflow);
    }

    let mut payload = vec![0u8; length as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::UnexpectedEof => DecodeError::TruncatedPayload { expected: length },
            _ => DecodeError::Io(err),
        })?;

    Ok(Some(payload))
}

/// Maps an [`AsyncRead`] into a stream of decoded frames, preserving input
/// order and never coalescing or splitting payloads.
pub fn frame_stream<R>(reader: R) -> impl futures::Stream<Item = Result<Vec<u8>, DecodeError>>
where
    R: AsyncRead + Unpin,
{
    futures::stream::try_unfold(reader, |mut reader| async move {
        match decode_frame(&mut reader).await? {
            Some(frame) => Ok(Some((frame, reader))),
            None => Ok(None),
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::TryStreamExt;

    #[test]
    fn test_encode_varint_boundaries() {
        let mut buf = Vec::new();
        encode(b"", &mut buf);
        assert_eq!(buf, vec![0]);

        buf.clear();
        encode(&vec![0u8; 127], &mut buf);
        assert_eq!(&buf[..1], &[0x7f]);
        assert_eq!(buf.len(), 1 + 127);

        buf.clear();
        encode(&vec![0u8; 128], &mut buf);
        assert_eq!(&buf[..2], &[0x80, 0x01]);
        assert_eq!(buf.len(), 2 + 128);
    }

    #[tokio::test]
    async fn test_round_trip_single_frame() {
        let mut buf = Vec::new();
        encode(b"hello world", &mut buf);

        let decoded = decode_frame(buf.as_slice()).await.unwrap().unwrap();
        assert_eq!(decoded, b"hello world");
    }

    #[tokio::test]
    async fn test_stream_preserves_order() {
        let mut buf = Vec::new();
        encode(b"first", &mut buf);
        encode(b"second", &mut buf);
        encode(b"", &mut buf);
        encode(b"fourth", &mut buf);

        let frames: Vec<Vec<u8>> = frame_stream(buf.as_slice()).try_collect().await.unwrap();
        assert_eq!(
            frames,
            vec![
                b"first".to_vec(),
                b"second".to_vec(),
                b"".to_vec(),
                b"fourth".to_vec(),
            ]
        );
    }

    #[tokio::test]
    async fn test_truncated_payload_is_fatal() {
        let mut buf = Vec::new();
        encode(b"hello world", &mut buf);
        buf.truncate(buf.len() - 3); // Drop the tail of the payload.

        let err = decode_frame(buf.as_slice()).await.unwrap_err();
        assert!(matches!(err, DecodeError::TruncatedPayload { .. }));
    }

    #[tokio::test]
    async fn test_truncated_varint_is_fatal() {
        // A continuation byte with no following byte.
        let buf = vec![0x80];
        let err = decode_frame(buf.as_slice()).await.unwrap_err();
        assert!(matches!(err, DecodeError::TruncatedVarint));
    }

    #[tokio::test]
    async fn test_clean_eof_between_frames() {
        let buf: Vec<u8> = Vec::new();
        let decoded = decode_frame(buf.as_slice()).await.unwrap();
        assert!(decoded.is_none());
    }

    #[quickcheck_macros::quickcheck]
    fn frame_round_trip(payload: Vec<u8>) -> bool {
        let mut buf = Vec::new();
        encode(&payload, &mut buf);

        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let decoded = rt.block_on(decode_frame(buf.as_slice())).unwrap().unwrap();
        decoded == payload
    }

    #[quickcheck_macros::quickcheck]
    fn framing_is_prefix_free(a: Vec<u8>, b: Vec<u8>) -> bool {
        let mut buf = Vec::new();
        encode(&a, &mut buf);
        encode(&b, &mut buf);

        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let frames: Vec<Vec<u8>> = rt
            .block_on(frame_stream(buf.as_slice()).try_collect())
            .unwrap();
        frames == vec![a, b]
    }
}
