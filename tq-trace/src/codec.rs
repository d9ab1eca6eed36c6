use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::record::{is_data_row, ParseError, TraceFormat, TraceRecord};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: {source}")]
    Parse { line: usize, source: ParseError },
    #[error("line {0} is not valid UTF-8")]
    Utf8(usize),
}

/// Frames [`TraceRecord`]s as newline terminated rows.
///
/// Decoding detects the format of every row and skips non-data rows. Encoding writes rows in the
/// configured format, [`TraceFormat::Extended`] by default, which is what the kernel ingestion
/// device expects.
#[derive(Debug, Default)]
pub struct TraceCodec {
    format: TraceFormat,
    /// Lines consumed by the decoder so far.
    lines: usize,
}

impl TraceCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_format(format: TraceFormat) -> Self {
        Self { format, lines: 0 }
    }

    pub fn format(&self) -> TraceFormat {
        self.format
    }

    fn decode_line(&mut self, line: &[u8]) -> Result<Option<TraceRecord>, Error> {
        self.lines += 1;

        let line = std::str::from_utf8(line).map_err(|_| Error::Utf8(self.lines))?;
        if !is_data_row(line) {
            return Ok(None);
        }

        TraceRecord::parse_row(line)
            .map(Some)
            .map_err(|source| Error::Parse {
                line: self.lines,
                source,
            })
    }
}

impl Decoder for TraceCodec {
    type Item = TraceRecord;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(end) = src.iter().position(|b| *b == b'\n') {
            let line = src.split_to(end);
            src.advance(1);

            if let Some(record) = self.decode_line(&line)? {
                return Ok(Some(record));
            }
        }

        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(record) = self.decode(src)? {
            return Ok(Some(record));
        }

        // Last row without a terminator.
        if src.is_empty() {
            return Ok(None);
        }
        let line = src.split();
        self.decode_line(&line)
    }
}

impl Encoder<TraceRecord> for TraceCodec {
    type Error = Error;

    fn encode(&mut self, item: TraceRecord, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let row = format!("{}\n", item.display(self.format));
        dst.reserve(row.len());
        dst.put_slice(row.as_bytes());

        Ok(())
    }
}
