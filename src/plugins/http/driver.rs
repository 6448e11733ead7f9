use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, RANGE, REFERER, USER_AGENT};
use reqwest::{Response, StatusCode};
use std::time::Duration;
use url::Url;

use crate::core::assembler::Assembler;
use crate::core::control::Control;
use crate::core::error::UnitError;
use crate::core::model::ByteRange;
use crate::core::retry::{is_transient_status, IsRetryable};
use crate::plugins::registry::DriverContext;

#[derive(Debug, Clone)]
pub struct ProbeInfo {
    pub url: Url,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Page {
    /// Where the body actually came from, after redirects and fallback.
    pub url: Url,
    pub content_type: Option<String>,
    pub body: String,
}

pub struct HttpDriver {
    client: reqwest::Client,
    ctx: DriverContext,
}

impl HttpDriver {
    pub fn new(ctx: DriverContext) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(Duration::from_secs(ctx.timeout_secs.max(1)))
            .build()?;
        Ok(Self { client, ctx })
    }

    pub fn context(&self) -> &DriverContext {
        &self.ctx
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.ctx.timeout_secs.max(1))
    }

    fn build_headers(&self, referer: Option<&str>) -> Result<HeaderMap, UnitError> {
        let bad = |e: &dyn std::fmt::Display| UnitError::NetworkPermanent(format!("invalid header: {e}"));
        let mut h = HeaderMap::new();
        h.insert(USER_AGENT, HeaderValue::from_str(&self.ctx.user_agent).map_err(|e| bad(&e))?);
        for (k, v) in &self.ctx.headers {
            let name = HeaderName::from_bytes(k.as_bytes()).map_err(|e| bad(&e))?;
            let value = HeaderValue::from_str(v).map_err(|e| bad(&e))?;
            h.insert(name, value);
        }
        if let Some(r) = referer {
            if let Ok(v) = HeaderValue::from_str(r) {
                h.insert(REFERER, v);
            }
        }
        Ok(h)
    }

    pub fn classify(err: reqwest::Error) -> UnitError {
        if err.is_retryable() {
            UnitError::NetworkTransient(err.to_string())
        } else {
            UnitError::NetworkPermanent(err.to_string())
        }
    }

    fn check_status(resp: Response) -> Result<Response, UnitError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let msg = format!("{} returned {}", resp.url(), status);
        if is_transient_status(status) {
            Err(UnitError::NetworkTransient(msg))
        } else {
            Err(UnitError::NetworkPermanent(msg))
        }
    }

    /// Headers only. Servers that refuse HEAD surface as an error; callers
    /// treat that as "unknown" rather than a failure.
    pub async fn probe(&self, url: &Url) -> Result<ProbeInfo, UnitError> {
        let resp = self
            .client
            .head(url.clone())
            .headers(self.build_headers(None)?)
            .timeout(self.timeout())
            .send()
            .await
            .map_err(Self::classify)?;
        let resp = Self::check_status(resp)?;
        Ok(ProbeInfo {
            url: resp.url().clone(),
            content_type: header_string(resp.headers(), CONTENT_TYPE),
            content_length: header_string(resp.headers(), CONTENT_LENGTH).and_then(|s| s.parse().ok()),
        })
    }

    /// Analysis never pulls a body whose type is excluded or that is known
    /// to be larger than the threshold.
    pub fn is_excluded_for_discovery(&self, probe: &ProbeInfo) -> bool {
        let ct = probe.content_type.as_deref().unwrap_or("").to_ascii_lowercase();
        if ct.contains("html") || ct.contains("mpegurl") {
            return false;
        }
        let excluded_type = !ct.is_empty() && self.ctx.discovery_exclusions.iter().any(|p| ct.starts_with(p.as_str()));
        let too_big = probe.content_length.is_some_and(|n| n > self.ctx.probe_size_threshold);
        excluded_type || too_big
    }

    /// GET a page as text. An https URL that cannot be connected to is
    /// tried once more over plain http.
    pub async fn fetch_page(&self, url: &Url) -> Result<Page, UnitError> {
        match self.get_text(url).await {
            Err(UnitError::NetworkTransient(msg)) if url.scheme() == "https" && msg.contains("connect") => {
                let mut plain = url.clone();
                if plain.set_scheme("http").is_err() {
                    return Err(UnitError::NetworkTransient(msg));
                }
                tracing::info!(url = %plain, "https unreachable, falling back to http");
                self.get_text(&plain).await
            }
            other => other,
        }
    }

    async fn get_text(&self, url: &Url) -> Result<Page, UnitError> {
        let resp = self
            .client
            .get(url.clone())
            .headers(self.build_headers(None)?)
            .timeout(self.timeout())
            .send()
            .await
            .map_err(connect_aware)?;
        let resp = Self::check_status(resp)?;
        let final_url = resp.url().clone();
        let content_type = header_string(resp.headers(), CONTENT_TYPE);
        let body = resp.text().await.map_err(Self::classify)?;
        Ok(Page { url: final_url, content_type, body })
    }

    /// Whole body in memory; used for playlists and segments.
    pub async fn fetch_bytes(&self, url: &str, referer: Option<&str>, range: Option<ByteRange>) -> Result<Bytes, UnitError> {
        let mut req = self.client.get(url).headers(self.build_headers(referer)?).timeout(self.timeout());
        if let Some(r) = range {
            let last = r
                .offset
                .checked_add(r.length.saturating_sub(1))
                .ok_or_else(|| UnitError::PlaylistParse(format!("{url}: byte range {}@{} overflows", r.length, r.offset)))?;
            req = req.header(RANGE, format!("bytes={}-{}", r.offset, last));
        }
        let resp = Self::check_status(req.send().await.map_err(Self::classify)?)?;
        let partial = resp.status() == StatusCode::PARTIAL_CONTENT;
        let body = resp.bytes().await.map_err(Self::classify)?;
        match range {
            // Server ignored the range and sent the whole file.
            Some(r) if !partial && body.len() as u64 > r.length => {
                let start = r.offset.min(body.len() as u64) as usize;
                let end = r.offset.saturating_add(r.length).min(body.len() as u64) as usize;
                Ok(body.slice(start..end))
            }
            _ => Ok(body),
        }
    }

    /// Streams a body into `out`. Cancellation is honoured between chunks;
    /// the timeout applies to each read, not the whole transfer.
    pub async fn download_to<F>(
        &self,
        url: &str,
        referer: Option<&str>,
        out: &mut Assembler,
        control: &Control,
        mut on_progress: F,
    ) -> Result<u64, UnitError>
    where
        F: FnMut(u64, Option<u64>),
    {
        out.reset().await?;
        let send = tokio::time::timeout(self.timeout(), self.client.get(url).headers(self.build_headers(referer)?).send());
        let resp = tokio::select! {
            sent = send => sent
                .map_err(|_| UnitError::NetworkTransient(format!("{url}: timed out waiting for response")))?
                .map_err(Self::classify)?,
            _ = control.cancelled() => return Err(UnitError::Cancelled),
        };
        let resp = Self::check_status(resp)?;
        let total = resp.content_length();
        if let Some(t) = total {
            out.ensure_space(t, self.ctx.min_free_space)?;
        }
        let mut stream = resp.bytes_stream();
        let mut downloaded = 0u64;
        on_progress(0, total);

        loop {
            if control.is_cancelled() {
                return Err(UnitError::Cancelled);
            }
            let next = tokio::time::timeout(self.timeout(), stream.next())
                .await
                .map_err(|_| UnitError::NetworkTransient(format!("{url}: read timed out")))?;
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(Self::classify)?;
            out.write(&chunk).await?;
            downloaded += chunk.len() as u64;
            on_progress(downloaded, total);
        }

        if let Some(t) = total {
            if downloaded < t {
                return Err(UnitError::NetworkTransient(format!("{url}: body ended at {downloaded} of {t} bytes")));
            }
        }
        Ok(downloaded)
    }
}

/// Like `classify`, but keeps "connect" in the message so the page fetch
/// can tell a refused connection from other transient failures.
fn connect_aware(err: reqwest::Error) -> UnitError {
    if err.is_connect() {
        UnitError::NetworkTransient(format!("connect: {err}"))
    } else {
        HttpDriver::classify(err)
    }
}

fn header_string(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(|s| s.trim().to_string())
}
