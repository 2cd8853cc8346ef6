//! Envelope serializers.
//!
//! Chosen once at spool construction. The sender never decodes spooled
//! bytes; it forwards them with the serializer's content-type tag so the
//! control plane knows the encoding.

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;

use super::spool::SpoolError;
use super::Envelope;

/// Encoding used when a data config does not name one.
pub const ENCODING_PLAIN: &str = "";
/// Gzip-compressed JSON encoding.
pub const ENCODING_GZIP: &str = "gzip";

/// Encodes envelopes to their on-disk (and on-wire) bytes.
pub trait Serializer: Send + Sync + 'static {
    /// Tag forwarded alongside the bytes ("json", "json-gzip").
    fn content_type(&self) -> &'static str;

    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, SpoolError>;
}

/// Plain JSON.
#[derive(Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &'static str {
        "json"
    }

    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, SpoolError> {
        Ok(serde_json::to_vec(envelope)?)
    }
}

/// Gzip-compressed JSON.
#[derive(Default)]
pub struct JsonGzipSerializer;

impl Serializer for JsonGzipSerializer {
    fn content_type(&self) -> &'static str {
        "json-gzip"
    }

    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, SpoolError> {
        let json = serde_json::to_vec(envelope)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        Ok(encoder.finish()?)
    }
}

/// Maps a config encoding name to its serializer.
pub fn serializer_for(encoding: &str) -> Option<Box<dyn Serializer>> {
    match encoding {
        ENCODING_PLAIN => Some(Box::new(JsonSerializer)),
        ENCODING_GZIP => Some(Box::new(JsonGzipSerializer)),
        _ => None,
    }
}
