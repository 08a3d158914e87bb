//! Size-bounded body streaming and charset decoding.

use encoding_rs::{Encoding, UTF_8};
use reqwest::Response;

use super::FetchError;

/// Running byte count for a transfer; trips once the ceiling is passed.
#[derive(Debug)]
pub(super) struct ByteBudget {
    limit: usize,
    received: usize,
}

impl ByteBudget {
    pub(super) fn new(limit: usize) -> Self {
        Self { limit, received: 0 }
    }

    /// Progress callback for each chunk received.
    pub(super) fn progress(&mut self, chunk_len: usize) -> Result<(), FetchError> {
        self.received = self.received.saturating_add(chunk_len);
        if self.received > self.limit {
            return Err(FetchError::TooLarge { limit: self.limit });
        }
        Ok(())
    }
}

/// Stream the body chunk by chunk. Returning early drops the response, which
/// tears down the connection instead of draining the rest of the transfer.
pub(super) async fn read_limited(
    mut response: Response,
    max_bytes: usize,
) -> Result<Vec<u8>, FetchError> {
    if let Some(len) = response.content_length()
        && len > max_bytes as u64
    {
        return Err(FetchError::TooLarge { limit: max_bytes });
    }

    let mut budget = ByteBudget::new(max_bytes);
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        budget.progress(chunk.len())?;
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Decode with the byte-order mark if present, else the `Content-Type`
/// charset, else UTF-8. Malformed sequences become U+FFFD.
pub fn decode_text(body: &[u8], content_type: Option<&str>) -> String {
    let encoding = content_type
        .and_then(charset_label)
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .unwrap_or(UTF_8);
    let (text, _, _) = encoding.decode(body);
    text.into_owned()
}

fn charset_label(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"'))
    })
}
