//! Content-encoding codecs
//!
//! Decodes origin bodies (gzip/deflate/brotli) before classification, and re-encodes
//! transformed bodies (gzip only) when the client advertises support.

use std::io::Cursor;

use async_compression::tokio::bufread::{BrotliDecoder, DeflateDecoder, GzipDecoder, GzipEncoder};
use async_compression::Level;
use tokio::io::AsyncReadExt;

/// Decode `body` per `content_encoding` ("gzip", "deflate", "br"); unknown encodings are
/// returned unchanged rather than erroring, since an unrecognized encoding is strictly better
/// passed through than silently corrupted.
pub async fn decode(content_encoding: &str, body: &[u8]) -> Result<Vec<u8>, String> {
    let cursor = Cursor::new(body);
    let mut out = Vec::new();

    match content_encoding {
        "gzip" | "x-gzip" => {
            let mut decoder = GzipDecoder::new(cursor);
            decoder
                .read_to_end(&mut out)
                .await
                .map_err(|e| format!("gzip decode failed: {e}"))?;
        }
        "deflate" => {
            let mut decoder = DeflateDecoder::new(cursor);
            decoder
                .read_to_end(&mut out)
                .await
                .map_err(|e| format!("deflate decode failed: {e}"))?;
        }
        "br" => {
            let mut decoder = BrotliDecoder::new(cursor);
            decoder
                .read_to_end(&mut out)
                .await
                .map_err(|e| format!("brotli decode failed: {e}"))?;
        }
        _ => return Ok(body.to_vec()),
    }

    Ok(out)
}

/// Gzip-encode `body` at `level` (1-9, clamped).
pub async fn gzip_encode(body: &[u8], level: u32) -> Result<Vec<u8>, String> {
    let level = Level::Precise(level.clamp(1, 9) as i32);
    let cursor = Cursor::new(body);
    let mut encoder = GzipEncoder::with_quality(cursor, level);
    let mut out = Vec::new();
    encoder
        .read_to_end(&mut out)
        .await
        .map_err(|e| format!("gzip encode failed: {e}"))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gzip_round_trips() {
        let original = b"the quick brown fox jumps over the lazy dog".repeat(20);
        let encoded = gzip_encode(&original, 6).await.unwrap();
        assert_ne!(encoded, original);
        let decoded = decode("gzip", &encoded).await.unwrap();
        assert_eq!(decoded, original);
    }

    #[tokio::test]
    async fn deflate_round_trips() {
        use async_compression::tokio::bufread::DeflateEncoder;
        let original = b"hello deflate world".repeat(10);
        let cursor = Cursor::new(&original[..]);
        let mut encoder = DeflateEncoder::new(cursor);
        let mut encoded = Vec::new();
        encoder.read_to_end(&mut encoded).await.unwrap();

        let decoded = decode("deflate", &encoded).await.unwrap();
        assert_eq!(decoded, original);
    }

    #[tokio::test]
    async fn brotli_round_trips() {
        use async_compression::tokio::bufread::BrotliEncoder;
        let original = b"hello brotli world".repeat(10);
        let cursor = Cursor::new(&original[..]);
        let mut encoder = BrotliEncoder::new(cursor);
        let mut encoded = Vec::new();
        encoder.read_to_end(&mut encoded).await.unwrap();

        let decoded = decode("br", &encoded).await.unwrap();
        assert_eq!(decoded, original);
    }

    #[tokio::test]
    async fn unknown_encoding_passes_through_unchanged() {
        let body = b"not compressed".to_vec();
        let out = decode("identity", &body).await.unwrap();
        assert_eq!(out, body);
    }
}
