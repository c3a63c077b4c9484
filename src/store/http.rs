use bytes::Bytes;

use crate::error::StoreError;

const MAX_RETRIES: u32 = 3;

/// Body plus the status it came back with. Range requests need the status to
/// tell a real `206` slice apart from an origin that ignored the header and
/// returned the whole object with `200`.
#[derive(Debug, Clone)]
pub struct HttpBody {
    pub status: u16,
    pub bytes: Bytes,
}

async fn fetch_attempt(url: &str, range: Option<(u64, u64)>) -> anyhow::Result<HttpBody> {
    let client = reqwest::Client::builder().build()?;

    let mut req = client.get(url);
    if let Some((start, end)) = range {
        req = req.header("Range", format!("bytes={start}-{end}"));
    }
    let resp = req.send().await?;

    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("HTTP error: {}", status);
    }

    let bytes = resp
        .bytes()
        .await
        .map_err(|e| anyhow::anyhow!("reqwest::Response::bytes failed: {e}"))?;

    Ok(HttpBody {
        status: status.as_u16(),
        bytes,
    })
}

async fn fetch_with_retry(url: &str, range: Option<(u64, u64)>) -> Result<HttpBody, StoreError> {
    let mut last_error = None;

    for attempt in 0..MAX_RETRIES {
        match fetch_attempt(url, range).await {
            Ok(body) => return Ok(body),
            Err(e) => {
                last_error = Some(e);
                if attempt < MAX_RETRIES - 1 {
                    let delay_ms = 1000 * (attempt as u64 + 1);
                    crate::utils::sleep(delay_ms).await;
                }
            }
        }
    }

    Err(StoreError::Fetch {
        url: url.to_owned(),
        attempts: MAX_RETRIES,
        reason: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_owned()),
    })
}

/// GET a full object, retrying with linear backoff.
pub async fn download(url: &str) -> Result<Bytes, StoreError> {
    Ok(fetch_with_retry(url, None).await?.bytes)
}

/// GET `[start, end]` (inclusive) of an object, retrying with linear
/// backoff. Callers must inspect the status: `206` bodies hold exactly the
/// requested window, `200` bodies hold the whole object.
pub async fn download_range(url: &str, start: u64, end: u64) -> Result<HttpBody, StoreError> {
    fetch_with_retry(url, Some((start, end))).await
}

/// Single-attempt GET that reports whatever the origin answered, non-2xx
/// included. Used when proxying unknown paths through to the CDN, where the
/// upstream status is the answer.
pub async fn proxy(url: &str) -> Result<HttpBody, StoreError> {
    let client = reqwest::Client::builder().build().map_err(|e| StoreError::Fetch {
        url: url.to_owned(),
        attempts: 1,
        reason: e.to_string(),
    })?;
    let resp = client.get(url).send().await.map_err(|e| StoreError::Fetch {
        url: url.to_owned(),
        attempts: 1,
        reason: e.to_string(),
    })?;
    let status = resp.status().as_u16();
    let bytes = resp.bytes().await.map_err(|e| StoreError::Fetch {
        url: url.to_owned(),
        attempts: 1,
        reason: e.to_string(),
    })?;
    Ok(HttpBody { status, bytes })
}
