//! Framing for asynchronous servers built on [`tokio_util::codec`].
//!
//! [`ServerCodec`] decodes [`Request`]s from and encodes [`Response`]s into a byte stream.
//! It applies the same validation as [`Request::from_reader`]: the announced payload is checked
//! against the maximum before any buffer space is reserved for it.
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    codec::RequestHeader,
    error::ReadError,
    protocol::{HEADER_LEN, MAX_PAYLOAD_SIZE, Request, Response},
};

#[derive(Debug, Clone)]
pub struct ServerCodec {
    max_payload: usize,
    /// Header of the request whose body is still awaited
    header: Option<RequestHeader>,
    /// Header of the most recent frame, kept after decoding failed
    last: Option<RequestHeader>,
}

impl ServerCodec {
    pub fn new(max_payload: usize) -> ServerCodec {
        ServerCodec {
            max_payload,
            header: None,
            last: None,
        }
    }

    /// The header of the last frame seen, if one could be parsed. Lets a server answer a
    /// request it failed to decode with the client's own version and flags.
    pub fn last_header(&self) -> Option<RequestHeader> {
        self.last
    }
}

impl Default for ServerCodec {
    fn default() -> Self {
        ServerCodec::new(MAX_PAYLOAD_SIZE)
    }
}

impl Decoder for ServerCodec {
    type Item = Request;
    type Error = ReadError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Request>, ReadError> {
        let header = match self.header {
            Some(header) => header,
            None => {
                if src.len() < HEADER_LEN {
                    src.reserve(HEADER_LEN - src.len());
                    return Ok(None);
                }
                let mut buf = [0u8; HEADER_LEN];
                buf.copy_from_slice(&src[..HEADER_LEN]);
                let header = RequestHeader::parse(&buf);
                self.last = Some(header);
                // Validate before consuming so an oversized request never reserves memory
                header.body_len(self.max_payload)?;
                src.advance(HEADER_LEN);
                self.header = Some(header);
                header
            }
        };

        let body_len = header.body_len(self.max_payload)?;
        if src.len() < body_len {
            src.reserve(body_len - src.len());
            return Ok(None);
        }
        self.header = None;
        let body = src.split_to(body_len);
        Request::from_parts(header, &body).map(Some)
    }
}

impl Encoder<Response> for ServerCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<(), std::io::Error> {
        let mut out = Vec::with_capacity(HEADER_LEN + item.data.len());
        item.encode_into(&mut out);
        dst.extend_from_slice(&out);
        Ok(())
    }
}
