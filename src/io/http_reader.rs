use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::{Client, StatusCode};

use super::range_reader::check_range;
use super::RangeReader;
use crate::error::IoError;

/// HTTP(S) implementation of RangeReader using `Range` requests.
///
/// The resource size is taken from a HEAD request on creation. Servers that
/// ignore the `Range` header and answer 200 are tolerated by slicing the body.
#[derive(Clone)]
pub struct HttpRangeReader {
    client: Client,
    url: String,
    size: u64,
}

impl HttpRangeReader {
    pub async fn new(client: Client, url: String) -> Result<Self, IoError> {
        let resp = client
            .head(&url)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e, &url))?;

        check_status(resp.status(), &url)?;

        let size = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| IoError::Http {
                status: resp.status().as_u16(),
                message: format!("{}: missing Content-Length", url),
            })?;

        Ok(Self { client, url, size })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RangeReader for HttpRangeReader {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        check_range(offset, len, self.size)?;

        if len == 0 {
            return Ok(Bytes::new());
        }

        let range = format!("bytes={}-{}", offset, offset + len as u64 - 1);
        let resp = self
            .client
            .get(&self.url)
            .header(RANGE, range)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e, &self.url))?;

        let status = resp.status();
        check_status(status, &self.url)?;

        let body = resp
            .bytes()
            .await
            .map_err(|e| classify_reqwest_error(&e, &self.url))?;

        let data = if status == StatusCode::PARTIAL_CONTENT {
            body
        } else {
            let start = offset as usize;
            if body.len() < start + len {
                return Err(IoError::Connection(format!(
                    "{}: full-body response shorter than requested range",
                    self.url
                )));
            }
            body.slice(start..start + len)
        };

        if data.len() != len {
            return Err(IoError::Connection(format!(
                "{}: short body, expected {} bytes, got {}",
                self.url,
                len,
                data.len()
            )));
        }

        Ok(data)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.url
    }
}

fn check_status(status: StatusCode, url: &str) -> Result<(), IoError> {
    if status.is_success() {
        return Ok(());
    }

    let message = format!("{}: {}", url, status);
    Err(match status.as_u16() {
        404 | 410 => IoError::NotFound(url.to_string()),
        408 => IoError::Timeout(message),
        429 | 503 => IoError::Throttled(message),
        500..=599 => IoError::Connection(message),
        code => IoError::Http {
            status: code,
            message,
        },
    })
}

fn classify_reqwest_error(err: &reqwest::Error, url: &str) -> IoError {
    let message = format!("{}: {}", url, err);
    if err.is_timeout() {
        IoError::Timeout(message)
    } else if let Some(status) = err.status() {
        match check_status(status, url) {
            Err(e) => e,
            Ok(()) => IoError::Connection(message),
        }
    } else {
        IoError::Connection(message)
    }
}
