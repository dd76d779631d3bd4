use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{HeaderMap, HeaderValue};
use tonic::{metadata::MetadataMap, Status};

/// Default ceiling on a single frame's payload.
pub const DEFAULT_MAX_FRAME: usize = 4 * 1024 * 1024;

const HEADER_LEN: usize = 5;
const TRAILER_FLAG: u8 = 0b1000_0000;
const COMPRESSED_FLAG: u8 = 0b0000_0001;

pub mod content_types {
    pub const GRPC: &str = "application/grpc";
    pub const GRPC_WEB: &str = "application/grpc-web";
    pub const GRPC_WEB_TEXT: &str = "application/grpc-web-text";
}

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("frame of {got} bytes exceeds the {limit} byte limit")]
    Oversized { got: usize, limit: usize },
    #[error("stream ended inside a frame")]
    Truncated,
    #[error("unsupported frame flags {0:#04x}")]
    UnsupportedFlags(u8),
    #[error("trailer frame in the request stream")]
    UnexpectedTrailers,
    #[error("invalid base64 body: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl From<FramingError> for Status {
    fn from(err: FramingError) -> Self {
        Status::internal(err.to_string())
    }
}

/// Negotiated inbound encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// `application/grpc-web(+proto)`: binary frames, trailers in the body.
    Web,
    /// `application/grpc-web-text(+proto)`: the same, base64 over the wire.
    WebText,
    /// `application/grpc(+proto)`: native framing, real HTTP trailers.
    Native,
}

impl WireFormat {
    /// Negotiate from the request content type. The gRPC-Web prefixes must
    /// be tried before the bare gRPC one.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        if content_type.starts_with(content_types::GRPC_WEB_TEXT) {
            Some(Self::WebText)
        } else if content_type.starts_with(content_types::GRPC_WEB) {
            Some(Self::Web)
        } else if content_type.starts_with(content_types::GRPC) {
            Some(Self::Native)
        } else {
            None
        }
    }

    pub fn is_text(self) -> bool {
        matches!(self, Self::WebText)
    }
}

/// One decoded unit of the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Data(Bytes),
    Trailers(Bytes),
}

/// Push-based decoder for `flag | u32 length | payload` framing, shared by
/// the gRPC-Web and native wires.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    text: Option<TextDecoder>,
    max_frame: usize,
}

impl FrameDecoder {
    pub fn new(text: bool, max_frame: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            text: text.then(TextDecoder::default),
            max_frame,
        }
    }

    /// Feed raw bytes from the transport. In text mode only whole base64
    /// quanta are consumed; a partial quantum is held until the next chunk.
    pub fn extend(&mut self, chunk: &[u8]) -> Result<(), FramingError> {
        match &mut self.text {
            Some(text) => text.feed(chunk, &mut self.buf),
            None => {
                self.buf.extend_from_slice(chunk);
                Ok(())
            }
        }
    }

    /// Next complete frame, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Result<Option<WireFrame>, FramingError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let flag = self.buf[0];
        let len =
            u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if len > self.max_frame {
            return Err(FramingError::Oversized {
                got: len,
                limit: self.max_frame,
            });
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(len).freeze();
        match flag {
            0 => Ok(Some(WireFrame::Data(payload))),
            TRAILER_FLAG => Ok(Some(WireFrame::Trailers(payload))),
            // compressed frames need a negotiated encoding, which the bridge
            // never advertises
            COMPRESSED_FLAG => Err(FramingError::UnsupportedFlags(flag)),
            other => Err(FramingError::UnsupportedFlags(other)),
        }
    }

    /// The transport is done; anything left over is a cut-off frame.
    pub fn finish(&self) -> Result<(), FramingError> {
        let pending_text = self.text.as_ref().is_some_and(|text| !text.pending.is_empty());
        if pending_text || !self.buf.is_empty() {
            return Err(FramingError::Truncated);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TextDecoder {
    pending: Vec<u8>,
}

impl TextDecoder {
    fn feed(&mut self, chunk: &[u8], out: &mut BytesMut) -> Result<(), FramingError> {
        self.pending.extend_from_slice(chunk);
        let usable = self.pending.len() - self.pending.len() % 4;
        if usable == 0 {
            return Ok(());
        }
        let ready = &self.pending[..usable];
        if ready.contains(&b'=') {
            // concatenated padded blocks: '=' is only valid at the end of a
            // quantum, so decode quantum by quantum
            for quantum in ready.chunks(4) {
                out.extend_from_slice(&BASE64.decode(quantum)?);
            }
        } else {
            out.extend_from_slice(&BASE64.decode(ready)?);
        }
        self.pending.drain(..usable);
        Ok(())
    }
}

/// Frame a message for the wire. The same `flag | length | payload` shape
/// serves both the gRPC-Web and native encodings.
pub fn encode_data(payload: &[u8], max_frame: usize) -> Result<Bytes, FramingError> {
    let limit = max_frame.min(u32::MAX as usize);
    if payload.len() > limit {
        return Err(FramingError::Oversized {
            got: payload.len(),
            limit,
        });
    }
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(0);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Terminal trailer block: the backend's trailer metadata with the status
/// pair replaced by `status` (tonic owns the grpc-message percent-encoding).
pub fn trailer_headers(status: &Status, trailers: Option<MetadataMap>) -> HeaderMap {
    let mut headers = trailers.map(MetadataMap::into_headers).unwrap_or_default();
    headers.remove("grpc-status");
    headers.remove("grpc-message");
    headers.remove("grpc-status-details-bin");
    let mut status_headers = HeaderMap::new();
    match status.add_header(&mut status_headers) {
        Ok(()) => {
            for (name, value) in status_headers.iter() {
                headers.insert(name, value.clone());
            }
        }
        Err(_) => {
            headers.insert("grpc-status", HeaderValue::from_static("13"));
        }
    }
    headers
}

/// Serialize trailers gRPC-Web style: an HTTP/1.1 header block inside one
/// trailer-flagged frame.
pub fn encode_trailers(status: &Status, trailers: Option<MetadataMap>) -> Bytes {
    let headers = trailer_headers(status, trailers);
    let mut block = BytesMut::new();
    for (name, value) in headers.iter() {
        block.put_slice(name.as_str().as_bytes());
        block.put_slice(b": ");
        block.put_slice(value.as_bytes());
        block.put_slice(b"\r\n");
    }
    let mut buf = BytesMut::with_capacity(HEADER_LEN + block.len());
    buf.put_u8(TRAILER_FLAG);
    buf.put_u32(block.len() as u32);
    buf.put_slice(&block);
    buf.freeze()
}

/// Text-mode wrap: one complete padded base64 block per frame keeps every
/// flush aligned to a quantum boundary.
pub fn to_text(frame: &[u8]) -> Bytes {
    Bytes::from(BASE64.encode(frame).into_bytes())
}
