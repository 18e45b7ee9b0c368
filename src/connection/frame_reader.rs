use std::io;
use std::io::ErrorKind;
use std::sync::Arc;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, BufReader, ReadHalf};
use crate::config::{ConnectionConfig, MIN_HEADER_LEN};
use crate::connection::connection::{BoxedStream, ConnectionActivity};
use crate::util::buffer_pool::{BufferLease, BufferPool};
use crate::util::safe_converter::SafeCast;
use crate::wire::response::{try_parse_mandatory_fields, MandatoryFields, ResponseFrameHeader};
use crate::wire::WireError;

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// the server closed the stream, possibly in the middle of a frame
    #[error("stream closed by the server")]
    StreamClosed,
    #[error("I/O error: {0}")]
    Io(io::Error),
    #[error("protocol violation: {0}")]
    Protocol(#[from] WireError),
}

/// A complete response frame
#[derive(Debug)]
pub struct ReceivedFrame {
    pub header: ResponseFrameHeader,
    pub mandatory: MandatoryFields,
    pub metadata: BufferLease,
    pub body: Option<Bytes>,
}

/// The receiving side of a connection. Reads go through an internal buffer, so reading the
///  small fixed-size parts of a frame does not cost a syscall each.
pub struct FrameReader {
    reader: BufReader<ReadHalf<BoxedStream>>,
    activity: Arc<ConnectionActivity>,
    buffer_pool: Arc<BufferPool>,
    max_total_len: usize,
    max_body_len: usize,
}

impl FrameReader {
    pub(crate) fn new(read_half: ReadHalf<BoxedStream>, activity: Arc<ConnectionActivity>, buffer_pool: Arc<BufferPool>, config: &ConnectionConfig) -> FrameReader {
        FrameReader {
            reader: BufReader::with_capacity(config.read_buffer_size, read_half),
            activity,
            buffer_pool,
            max_total_len: config.max_response_metadata_len,
            max_body_len: config.max_response_body_len,
        }
    }

    /// Reads and validates the fixed part of a response frame. An invalid length is a protocol
    ///  violation after which the stream can not be resynchronized.
    pub async fn read_header(&mut self) -> Result<ResponseFrameHeader, ReadError> {
        let mut raw = [0u8; MIN_HEADER_LEN];
        self.read_exact(&mut raw).await?;
        self.activity.record_receive();

        let header = ResponseFrameHeader::decode(&raw);
        header.validate(self.max_total_len)?;
        Ok(header)
    }

    pub async fn read_metadata(&mut self, header: &ResponseFrameHeader) -> Result<BufferLease, ReadError> {
        let len = header.metadata_len();
        let mut metadata = self.buffer_pool.lease(len);
        metadata.resize(len, 0);
        self.read_exact(&mut metadata[..]).await?;
        Ok(metadata)
    }

    /// Reads a length prefixed body
    pub async fn read_body(&mut self) -> Result<Bytes, ReadError> {
        let mut len_buf = [0u8; 4];
        self.read_exact(&mut len_buf).await?;
        let len: usize = u32::from_le_bytes(len_buf).safe_cast();
        if len > self.max_body_len {
            return Err(WireError::BodyTooLarge { len, max: self.max_body_len }.into());
        }

        let mut body = BytesMut::zeroed(len);
        self.read_exact(&mut body[..]).await?;
        self.activity.record_receive();
        Ok(body.freeze())
    }

    /// Reads a complete response frame. The mandatory tokens are parsed before anything else,
    ///  since they determine whether a body follows.
    pub async fn read_response(&mut self) -> Result<ReceivedFrame, ReadError> {
        let header = self.read_header().await?;
        let metadata = self.read_metadata(&header).await?;
        let mandatory = try_parse_mandatory_fields(&metadata)?;

        let body = if mandatory.payload_present {
            Some(self.read_body().await?)
        }
        else {
            None
        };

        Ok(ReceivedFrame {
            header,
            mandatory,
            metadata,
            body,
        })
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ReadError> {
        match self.reader.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(ReadError::StreamClosed),
            Err(e) => Err(ReadError::Io(e)),
        }
    }
}
