//! Framing: length-prefix (4 bytes LE) + bincode payload, plus reassembly for
//! transports that deliver frames in fragments (BLE characteristic values).

use crate::protocol::Message;

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a message into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a message into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Total length (prefix included) of the frame at the front of `bytes`.
fn frame_len(bytes: &[u8]) -> Result<usize, FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    let total = LEN_SIZE + len as usize;
    if bytes.len() < total {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok(total)
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns error if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let total = frame_len(bytes)?;
    let msg: Message =
        bincode::deserialize(&bytes[LEN_SIZE..total]).map_err(FrameDecodeError::Decode)?;
    Ok((msg, total))
}

/// Error decoding a frame (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

/// Accumulates fragments from one peer and yields complete raw frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and drain every frame it completes.
    /// An oversized length prefix discards the buffered bytes and returns `TooLarge`.
    pub fn push(&mut self, fragment: &[u8]) -> Result<Vec<Vec<u8>>, FrameDecodeError> {
        self.buf.extend_from_slice(fragment);
        let mut frames = Vec::new();
        loop {
            match frame_len(&self.buf) {
                Ok(total) => frames.push(self.buf.drain(..total).collect()),
                Err(FrameDecodeError::NeedMore) => return Ok(frames),
                Err(e) => {
                    self.buf.clear();
                    return Err(e);
                }
            }
        }
    }

    /// Bytes buffered towards an incomplete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Split an encoded frame into transport-sized fragments (`mtu` 0 means no split).
pub fn fragment(frame: &[u8], mtu: usize) -> Vec<Vec<u8>> {
    if mtu == 0 || frame.len() <= mtu {
        return vec![frame.to_vec()];
    }
    frame.chunks(mtu).map(|c| c.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeMap;
    use crate::presence::PresenceStatus;

    fn sample_notify(nonce: u64) -> Message {
        let mut attributes = AttributeMap::new();
        attributes.insert("Temperature".into(), 25.into());
        attributes.insert("unit".into(), "C".into());
        Message::Notify {
            token: 7,
            uri: "/a/thermostat".into(),
            nonce,
            status: PresenceStatus::Ok,
            attributes,
        }
    }

    #[test]
    fn decode_reports_consumed_length() {
        let msg = sample_notify(1);
        let frame = encode_frame(&msg).unwrap();
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_notify(1)).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..super::LEN_SIZE]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn oversized_prefix_rejected() {
        let bytes = (MAX_FRAME_LEN + 1).to_le_bytes();
        assert!(matches!(
            decode_frame(&bytes),
            Err(FrameDecodeError::TooLarge)
        ));
    }

    #[test]
    fn garbage_payload_is_decode_error() {
        let mut bytes = 3u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0xff, 0xff, 0xff]);
        assert!(matches!(
            decode_frame(&bytes),
            Err(FrameDecodeError::Decode(_))
        ));
    }

    #[test]
    fn frame_buffer_reassembles_fragments() {
        let a = encode_frame(&sample_notify(1)).unwrap();
        let b = encode_frame(&sample_notify(2)).unwrap();
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        let mut buffer = FrameBuffer::new();
        let mut frames = Vec::new();
        for piece in fragment(&stream, 20) {
            frames.extend(buffer.push(&piece).unwrap());
        }
        assert_eq!(frames, vec![a, b]);
        assert_eq!(buffer.pending(), 0);
        let (m2, _) = decode_frame(&frames[1]).unwrap();
        assert!(matches!(m2, Message::Notify { nonce: 2, .. }));
    }

    #[test]
    fn frame_buffer_discards_on_oversized_prefix() {
        let mut buffer = FrameBuffer::new();
        assert!(buffer.push(&u32::MAX.to_le_bytes()).is_err());
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn fragment_without_mtu_is_whole() {
        let frame = encode_frame(&sample_notify(1)).unwrap();
        assert_eq!(fragment(&frame, 0), vec![frame.clone()]);
        assert_eq!(fragment(&frame, frame.len()).len(), 1);
    }
}
