use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::header::CONTENT_ENCODING;
use http::{HeaderMap, Method, StatusCode};

use crate::util::lock_unpoisoned;

#[derive(Debug)]
pub(crate) struct DecodeContentEncodingError {
    pub(crate) encoding: String,
    pub(crate) message: String,
}

impl DecodeContentEncodingError {
    fn new(encoding: &str, error: io::Error) -> Self {
        Self {
            encoding: encoding.to_owned(),
            message: error.to_string(),
        }
    }
}

pub(crate) fn should_decode_content_encoded_body(method: &Method, status: StatusCode) -> bool {
    if *method == Method::HEAD {
        return false;
    }
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *lock_unpoisoned(&self.0))
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock_unpoisoned(&self.0).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum StageWriter {
    Gzip(flate2::write::GzDecoder<SharedSink>),
    Deflate(flate2::write::ZlibDecoder<SharedSink>),
    Brotli(Box<brotli::DecompressorWriter<SharedSink>>),
}

struct DecodeStage {
    encoding: String,
    writer: StageWriter,
    output: SharedSink,
}

impl DecodeStage {
    fn for_encoding(encoding: &str) -> Option<Self> {
        let output = SharedSink::default();
        let writer = match encoding {
            "gzip" | "x-gzip" => StageWriter::Gzip(flate2::write::GzDecoder::new(output.clone())),
            "deflate" => StageWriter::Deflate(flate2::write::ZlibDecoder::new(output.clone())),
            "br" => StageWriter::Brotli(Box::new(brotli::DecompressorWriter::new(
                output.clone(),
                4096,
            ))),
            _ => return None,
        };
        Some(Self {
            encoding: encoding.to_owned(),
            writer,
            output,
        })
    }

    fn push(&mut self, input: &[u8]) -> Result<Vec<u8>, DecodeContentEncodingError> {
        if !input.is_empty() {
            let written = match &mut self.writer {
                StageWriter::Gzip(decoder) => decoder.write_all(input),
                StageWriter::Deflate(decoder) => decoder.write_all(input),
                StageWriter::Brotli(decoder) => decoder.write_all(input),
            };
            written.map_err(|error| DecodeContentEncodingError::new(&self.encoding, error))?;
        }
        Ok(self.output.take())
    }

    fn finish(&mut self) -> Result<Vec<u8>, DecodeContentEncodingError> {
        let finished = match &mut self.writer {
            StageWriter::Gzip(decoder) => decoder.try_finish(),
            StageWriter::Deflate(decoder) => decoder.try_finish(),
            StageWriter::Brotli(decoder) => decoder.flush(),
        };
        finished.map_err(|error| DecodeContentEncodingError::new(&self.encoding, error))?;
        Ok(self.output.take())
    }
}

/// Incremental decoder for a `content-encoding` list.
///
/// Encodings are undone in reverse order of application. Unknown tokens and
/// `identity` pass bytes through untouched.
pub(crate) struct ContentDecoder {
    stages: Vec<DecodeStage>,
}

impl ContentDecoder {
    /// Returns `None` when the headers name nothing this decoder understands.
    pub(crate) fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let mut stages = Vec::new();
        for value in headers.get_all(CONTENT_ENCODING) {
            let Ok(value) = value.to_str() else {
                continue;
            };
            for encoding in value.split(',') {
                let encoding = encoding.trim().to_ascii_lowercase();
                if let Some(stage) = DecodeStage::for_encoding(&encoding) {
                    stages.push(stage);
                }
            }
        }
        if stages.is_empty() {
            return None;
        }
        stages.reverse();
        Some(Self { stages })
    }

    pub(crate) fn decode(&mut self, chunk: &[u8]) -> Result<Bytes, DecodeContentEncodingError> {
        let mut data = chunk.to_vec();
        for stage in &mut self.stages {
            data = stage.push(&data)?;
        }
        Ok(Bytes::from(data))
    }

    pub(crate) fn finish(&mut self) -> Result<Bytes, DecodeContentEncodingError> {
        let mut data = Vec::new();
        for stage in &mut self.stages {
            let mut output = stage.push(&data)?;
            output.extend(stage.finish()?);
            data = output;
        }
        Ok(Bytes::from(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).expect("gzip write");
        encoder.finish().expect("gzip finish")
    }

    fn brotli(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut encoder = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
            encoder.write_all(data).expect("brotli write");
        }
        out
    }

    fn headers(encoding: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static(encoding));
        headers
    }

    fn decode_in_chunks(decoder: &mut ContentDecoder, encoded: &[u8], chunk: usize) -> Vec<u8> {
        let mut decoded = Vec::new();
        for piece in encoded.chunks(chunk) {
            decoded.extend_from_slice(&decoder.decode(piece).expect("decode"));
        }
        decoded.extend_from_slice(&decoder.finish().expect("finish"));
        decoded
    }

    #[test]
    fn gzip_decodes_across_small_chunks() {
        let payload = b"hello compressed world ".repeat(200);
        let mut decoder = ContentDecoder::from_headers(&headers("gzip")).expect("decoder");
        assert_eq!(decode_in_chunks(&mut decoder, &gzip(&payload), 7), payload);
    }

    #[test]
    fn deflate_uses_zlib_framing() {
        let payload = b"deflate body".to_vec();
        let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(&payload).expect("zlib write");
        let encoded = encoder.finish().expect("zlib finish");

        let mut decoder = ContentDecoder::from_headers(&headers("deflate")).expect("decoder");
        assert_eq!(decode_in_chunks(&mut decoder, &encoded, 3), payload);
    }

    #[test]
    fn chained_encodings_are_undone_in_reverse() {
        let payload = b"{\"message\":\"layered\"}".to_vec();
        let encoded = brotli(&gzip(&payload));
        let mut decoder = ContentDecoder::from_headers(&headers("gzip, br")).expect("decoder");
        assert_eq!(decode_in_chunks(&mut decoder, &encoded, 16), payload);
    }

    #[test]
    fn unknown_and_identity_encodings_pass_through() {
        assert!(ContentDecoder::from_headers(&headers("identity")).is_none());
        assert!(ContentDecoder::from_headers(&headers("compress-x")).is_none());
        assert!(ContentDecoder::from_headers(&HeaderMap::new()).is_none());
    }

    #[test]
    fn corrupt_gzip_reports_encoding() {
        let mut decoder = ContentDecoder::from_headers(&headers("gzip")).expect("decoder");
        let result = decoder
            .decode(b"definitely not gzip data at all")
            .and_then(|_| decoder.finish());
        let error = result.expect_err("corrupt");
        assert_eq!(error.encoding, "gzip");
    }

    #[test]
    fn skip_rules_follow_method_and_status() {
        assert!(!should_decode_content_encoded_body(&Method::HEAD, StatusCode::OK));
        assert!(!should_decode_content_encoded_body(&Method::GET, StatusCode::NO_CONTENT));
        assert!(!should_decode_content_encoded_body(&Method::GET, StatusCode::NOT_MODIFIED));
        assert!(should_decode_content_encoded_body(&Method::GET, StatusCode::OK));
    }
}
