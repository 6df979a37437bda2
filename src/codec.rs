use {
  asynchronous_codec::{Bytes, BytesMut, Decoder, Encoder},
  thiserror::Error,
  unsigned_varint::codec,
};

#[derive(Debug, Error)]
pub enum Error {
  #[error("Exceeded maximum transmission size")]
  MaxTransmissionSizeExceeded,

  #[error("Stream closed by remote peer")]
  Eof,

  #[error("IO Error: {0}")]
  Io(#[from] std::io::Error),
}

impl Error {
  /// True when the error was caused by the remote peer sending
  /// bytes that violate the framing rules, as opposed to the
  /// underlying stream failing or closing.
  pub fn is_protocol_violation(&self) -> bool {
    match self {
      Error::MaxTransmissionSizeExceeded => true,
      Error::Io(e) => e.kind() == std::io::ErrorKind::InvalidData,
      Error::Eof => false,
    }
  }
}

/// All frames on notification streams are opaque payloads prefixed
/// with an unsigned LEB128 varint of their length.
///
/// The payload encoding is owned by each registered protocol, the
/// codec only knows about lengths. A zero length is a valid, empty
/// frame.
pub struct Codec {
  /// prefix all network frames with varint of their length.
  length_prefix: codec::UviBytes,
}

impl std::fmt::Debug for Codec {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Codec").finish_non_exhaustive()
  }
}

impl Codec {
  /// Creates a codec that rejects any frame longer than
  /// `max_message_len` bytes on both the encoding and decoding side.
  ///
  /// On the decoding side the length is checked as soon as the varint
  /// prefix is complete, before any payload bytes are buffered.
  pub fn new(max_message_len: usize) -> Self {
    Self {
      length_prefix: {
        let mut length_codec = codec::UviBytes::default();
        length_codec.set_max_len(max_message_len);
        length_codec
      },
    }
  }
}

impl Encoder for Codec {
  type Error = Error;
  type Item = Bytes;

  fn encode(
    &mut self,
    item: Self::Item,
    dst: &mut BytesMut,
  ) -> Result<(), Self::Error> {
    // prepend buffer len varint
    self
      .length_prefix
      .encode(item, dst)
      .map_err(|_| Error::MaxTransmissionSizeExceeded)
  }
}

impl Decoder for Codec {
  type Error = Error;
  type Item = Bytes;

  fn decode(
    &mut self,
    src: &mut BytesMut,
  ) -> Result<Option<Self::Item>, Self::Error> {
    self
      .length_prefix
      .decode(src)
      .map(|frame| frame.map(BytesMut::freeze))
      .map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => {
          Error::MaxTransmissionSizeExceeded
        }
        _ => Error::Io(e),
      })
  }
}

#[cfg(test)]
mod tests {
  use {super::*, proptest::prelude::*};

  const MAX: usize = 64 * 1024;

  proptest! {
    #[test]
    fn framed_payload_survives_roundtrip(
      payload in proptest::collection::vec(any::<u8>(), 0..=MAX)
    ) {
      let mut codec = Codec::new(MAX);
      let mut buffer = BytesMut::new();
      codec.encode(Bytes::from(payload.clone()), &mut buffer).unwrap();
      let decoded = codec.decode(&mut buffer).unwrap().unwrap();
      prop_assert_eq!(&decoded[..], &payload[..]);
      prop_assert!(buffer.is_empty());
    }
  }

  #[test]
  fn empty_frame_is_valid() {
    let mut codec = Codec::new(MAX);
    let mut buffer = BytesMut::new();
    codec.encode(Bytes::new(), &mut buffer).unwrap();
    assert_eq!(&buffer[..], &[0u8]);
    let decoded = codec.decode(&mut buffer).unwrap().unwrap();
    assert!(decoded.is_empty());
  }

  #[test]
  fn payload_at_the_limit_is_accepted() {
    let mut codec = Codec::new(16);
    let mut buffer = BytesMut::new();
    codec.encode(Bytes::from(vec![1u8; 16]), &mut buffer).unwrap();
    assert_eq!(buffer.len(), 17);
    let decoded = codec.decode(&mut buffer).unwrap().unwrap();
    assert_eq!(decoded.len(), 16);
  }

  #[test]
  fn oversize_payload_rejected_before_write() {
    let mut codec = Codec::new(16);
    let mut buffer = BytesMut::new();
    let result = codec.encode(Bytes::from(vec![1u8; 17]), &mut buffer);
    assert!(matches!(result, Err(Error::MaxTransmissionSizeExceeded)));
    assert!(buffer.is_empty());
  }

  #[test]
  fn oversize_prefix_rejected_without_payload() {
    let mut codec = Codec::new(16);
    // varint of 300 with no payload following it
    let mut buffer = BytesMut::from(&[0xac, 0x02][..]);
    let result = codec.decode(&mut buffer);
    assert!(matches!(result, Err(Error::MaxTransmissionSizeExceeded)));
  }

  #[test]
  fn partial_frame_waits_for_more_bytes() {
    let mut codec = Codec::new(MAX);
    let mut buffer = BytesMut::from(&[0x05, 1, 2][..]);
    assert!(codec.decode(&mut buffer).unwrap().is_none());
    buffer.extend_from_slice(&[3, 4, 5]);
    let decoded = codec.decode(&mut buffer).unwrap().unwrap();
    assert_eq!(&decoded[..], &[1, 2, 3, 4, 5]);
  }
}
