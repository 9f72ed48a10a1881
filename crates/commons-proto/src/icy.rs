//! ICY (Shoutcast/Icecast) in-band metadata extraction.
//!
//! A probe opens its own short-lived connection to the stream, asks for
//! interleaved metadata with `Icy-MetaData: 1`, reads just past the first
//! metadata interval and hangs up.  It never touches the playback
//! connection.

use std::time::Duration;

use reqwest::header::HeaderValue;
use tracing::debug;

use crate::error::ProbeError;
use crate::protocol::NowPlaying;

pub const USER_AGENT: &str = concat!("Commons Radio/", env!("CARGO_PKG_VERSION"));

const STREAM_TITLE: &str = "StreamTitle='";

/// Largest metadata interval accepted from a server.  Real streams use 8 to
/// 64 KiB; anything past this is treated as not advertising metadata.
const MAX_METAINT: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct IcyProbe {
    client: reqwest::Client,
    timeout: Duration,
    read_ahead: usize,
}

impl IcyProbe {
    pub fn new(timeout: Duration, read_ahead: usize) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self {
            client,
            timeout,
            read_ahead,
        })
    }

    /// Infallible form used by the poller and the HTTP endpoint.
    pub async fn probe(&self, url: &str) -> NowPlaying {
        match self.try_probe(url).await {
            Ok(now_playing) => now_playing,
            Err(ProbeError::Unsupported) => NowPlaying::unsupported(),
            Err(e) => {
                debug!("Now-playing probe for {} failed: {}", url, e);
                NowPlaying {
                    title: None,
                    supported: e.metadata_supported(),
                    error: (!e.metadata_supported()).then(|| e.to_string()),
                }
            }
        }
    }

    /// One probe, bounded end to end by the configured timeout.
    pub async fn try_probe(&self, url: &str) -> Result<NowPlaying, ProbeError> {
        tokio::time::timeout(self.timeout, self.fetch(url))
            .await
            .map_err(|_| ProbeError::Timeout)?
    }

    async fn fetch(&self, url: &str) -> Result<NowPlaying, ProbeError> {
        let mut resp = self
            .client
            .get(url)
            .header("Icy-MetaData", HeaderValue::from_static("1"))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ProbeError::Status(resp.status().as_u16()));
        }

        let metaint = resp
            .headers()
            .get("icy-metaint")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<usize>().ok())
            .filter(|&m| m > 0 && m <= MAX_METAINT)
            .ok_or(ProbeError::Unsupported)?;

        let wanted = metaint
            .checked_add(self.read_ahead)
            .ok_or(ProbeError::Unsupported)?;
        let mut buf: Vec<u8> = Vec::with_capacity(wanted.min(256 * 1024));
        while buf.len() < wanted {
            match resp.chunk().await? {
                Some(chunk) => buf.extend_from_slice(&chunk),
                None => break,
            }
        }
        drop(resp);

        parse_metadata_block(&buf, metaint)
    }
}

/// Locate the first metadata block in `buf` (audio bytes, then a length
/// byte at offset `metaint`, then `len * 16` bytes of text) and pull the
/// stream title out of it.
pub fn parse_metadata_block(buf: &[u8], metaint: usize) -> Result<NowPlaying, ProbeError> {
    let Some(&len_byte) = buf.get(metaint) else {
        return Ok(NowPlaying::untitled());
    };
    let meta_len = usize::from(len_byte) * 16;
    if meta_len == 0 {
        return Ok(NowPlaying::untitled());
    }

    let start = metaint + 1;
    let end = start.saturating_add(meta_len).min(buf.len());
    let mut block = &buf[start..end];
    while let [rest @ .., 0] = block {
        block = rest;
    }

    let text = std::str::from_utf8(block).map_err(|e| ProbeError::Malformed(e.to_string()))?;
    Ok(match extract_stream_title(text) {
        Some(title) => NowPlaying::titled(title),
        None => NowPlaying::untitled(),
    })
}

/// The trimmed text between the quotes of the first `StreamTitle='...'`.
pub fn extract_stream_title(text: &str) -> Option<String> {
    let start = text.find(STREAM_TITLE)? + STREAM_TITLE.len();
    let rest = &text[start..];
    let end = rest.find('\'')?;
    let title = rest[..end].trim();
    (!title.is_empty()).then(|| title.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_with_block(metaint: usize, text: &[u8], blocks: u8) -> Vec<u8> {
        let mut buf = vec![0xAA; metaint];
        buf.push(blocks);
        let mut meta = text.to_vec();
        meta.resize(usize::from(blocks) * 16, 0);
        buf.extend_from_slice(&meta);
        buf.extend_from_slice(&[0xAA; 64]);
        buf
    }

    #[test]
    fn title_from_padded_block() {
        let buf = stream_with_block(8192, b"StreamTitle='Test Song';", 5);
        assert_eq!(
            parse_metadata_block(&buf, 8192).unwrap(),
            NowPlaying::titled("Test Song")
        );
    }

    #[test]
    fn zero_length_block_is_untitled() {
        let buf = stream_with_block(16, b"", 0);
        assert_eq!(parse_metadata_block(&buf, 16).unwrap(), NowPlaying::untitled());
    }

    #[test]
    fn short_read_is_untitled() {
        assert_eq!(
            parse_metadata_block(&[0u8; 100], 8192).unwrap(),
            NowPlaying::untitled()
        );
    }

    #[test]
    fn interval_past_buffer_end_is_untitled() {
        assert_eq!(
            parse_metadata_block(&[0u8; 100], usize::MAX).unwrap(),
            NowPlaying::untitled()
        );
    }

    #[test]
    fn truncated_block_uses_available_bytes() {
        let mut buf = stream_with_block(32, b"StreamTitle='Cut';", 4);
        buf.truncate(32 + 1 + 20);
        assert_eq!(
            parse_metadata_block(&buf, 32).unwrap(),
            NowPlaying::titled("Cut")
        );
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        let buf = stream_with_block(8, b"StreamTitle='\xff\xfe';", 2);
        let err = parse_metadata_block(&buf, 8).unwrap_err();
        assert!(matches!(err, ProbeError::Malformed(_)));
        assert!(err.metadata_supported());
    }

    #[test]
    fn title_extraction() {
        assert_eq!(
            extract_stream_title("StreamTitle='  Artist - Track ';StreamUrl='x';").as_deref(),
            Some("Artist - Track")
        );
        assert_eq!(extract_stream_title("StreamTitle='';"), None);
        assert_eq!(extract_stream_title("StreamTitle='   ';"), None);
        assert_eq!(extract_stream_title("StreamUrl='http://x';"), None);
        assert_eq!(extract_stream_title("StreamTitle='unterminated"), None);
        assert_eq!(
            extract_stream_title("StreamUrl='u';StreamTitle='Second';").as_deref(),
            Some("Second")
        );
    }
}
