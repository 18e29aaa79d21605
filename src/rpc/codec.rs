//! MessagePack framing for the agent RPC stream.
//!
//! Every message on the wire is a single self-delimiting MessagePack value, so
//! the decoder needs no length prefix: it parses one value from the buffered
//! bytes and leaves the remainder for the next call.

use std::io::{self, Cursor};

use bytes::{Buf, BufMut, BytesMut};
use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::Decoder;

use crate::rpc::client::RpcClientError;
use crate::rpc::proto::{Command, RequestHeader};

/// Decodes one MessagePack value per frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgpackCodec;

impl Decoder for MsgpackCodec {
    type Item = Value;
    type Error = RpcClientError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, RpcClientError> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&src[..]);
        match rmpv::decode::read_value(&mut cursor) {
            Ok(value) => {
                let consumed = cursor.position() as usize;
                src.advance(consumed);
                Ok(Some(value))
            }
            Err(err) if is_incomplete(&err) => Ok(None),
            Err(err) => Err(RpcClientError::Decode(err.to_string())),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Value>, RpcClientError> {
        match self.decode(src)? {
            Some(value) => Ok(Some(value)),
            None if src.is_empty() => Ok(None),
            None => Err(RpcClientError::Decode(format!(
                "stream ended inside a message ({} bytes buffered)",
                src.len()
            ))),
        }
    }
}

fn is_incomplete(err: &rmpv::decode::Error) -> bool {
    match err {
        rmpv::decode::Error::InvalidMarkerRead(source)
        | rmpv::decode::Error::InvalidDataRead(source) => {
            source.kind() == io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

/// An encoded request waiting for its sequence number.
///
/// The body is serialized up front so that an unencodable body fails before a
/// sequence number is allocated.
#[derive(Debug, Clone)]
pub struct RequestFrame {
    command: Command,
    body: Option<Vec<u8>>,
}

impl RequestFrame {
    /// Encodes `body` for `command`. Nothing is sequenced yet.
    pub fn new<B>(command: Command, body: Option<&B>) -> Result<Self, RpcClientError>
    where
        B: Serialize + ?Sized,
    {
        let body = body.map(|body| rmp_serde::to_vec_named(body)).transpose()?;
        Ok(Self { command, body })
    }

    /// Serializes the header for `seq` followed by the body, if any.
    pub fn into_bytes(self, seq: u64) -> Result<BytesMut, RpcClientError> {
        let header = RequestHeader {
            command: self.command.as_str().to_string(),
            seq,
        };
        let header = rmp_serde::to_vec_named(&header)?;
        let body_len = self.body.as_ref().map_or(0, Vec::len);

        let mut buf = BytesMut::with_capacity(header.len() + body_len);
        buf.put_slice(&header);
        if let Some(body) = self.body {
            buf.put_slice(&body);
        }
        Ok(buf)
    }
}

/// Converts a decoded value into a typed message.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, RpcClientError> {
    rmpv::ext::from_value(value).map_err(|err| RpcClientError::Decode(err.to_string()))
}
