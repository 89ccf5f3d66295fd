//! Input classification and the HTTP side of input acceptance (spec §6):
//! Google Drive/MediaFire/shortlink rewriting, then one GET for the bytes.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use reolink_fw_core::FwError;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

pub fn is_url(s: &str) -> bool {
    s.starts_with("http")
}

pub fn is_local_file(s: &str) -> bool {
    Path::new(s).is_file()
}

fn drive_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^https?://drive\.google\.com/file/d/([^/]+)").unwrap())
}

fn mediafire_href_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"id="downloadButton"[^>]*href="([^"]+)""#).unwrap())
}

fn shortener_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^https?://(bit\.ly|tinyurl\.com|goo\.gl|t\.co|is\.gd)/").unwrap()
    })
}

fn client() -> &'static reqwest::blocking::Client {
    static CLIENT: OnceLock<reqwest::blocking::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("building the HTTP client never fails with this configuration")
    })
}

/// Rewrite a Google Drive "view" link to its direct-download endpoint
/// (spec §6's "Recognised URL shims").
fn rewrite_google_drive(url: &str) -> Option<String> {
    let id = drive_regex().captures(url)?.get(1)?.as_str();
    Some(format!(
        "https://drive.google.com/uc?export=download&id={id}"
    ))
}

/// Scrape a MediaFire landing page for its download-button href.
fn rewrite_mediafire(url: &str) -> Result<String> {
    let html = client()
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .context("fetching MediaFire landing page")?
        .text()
        .context("reading MediaFire landing page body")?;
    mediafire_href_regex()
        .captures(&html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| anyhow!("MediaFire download button not found on landing page"))
}

/// Resolve a shortened URL to its target by one non-following GET.
fn resolve_shortlink(url: &str) -> Result<String> {
    let no_redirect = reqwest::blocking::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(30))
        .build()
        .context("building the no-redirect HTTP client")?;
    let resp = no_redirect.get(url).send().context("resolving shortlink")?;
    if resp.status().is_redirection() {
        let location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| anyhow!("shortlink redirect carried no Location header"))?;
        Ok(location.to_string())
    } else {
        Ok(url.to_string())
    }
}

/// Apply the known URL shims, then issue one GET for the resource bytes.
/// Returns `FwError::HttpError(status)` for any non-200 response so the
/// report's `error` field carries the same detail the original's status
/// code passthrough does.
pub fn download(url: &str) -> Result<Vec<u8>> {
    let mut resolved = url.to_string();
    if let Some(direct) = rewrite_google_drive(&resolved) {
        resolved = direct;
    } else if resolved.contains("mediafire.com") {
        resolved = rewrite_mediafire(&resolved)?;
    } else if shortener_regex().is_match(&resolved) {
        resolved = resolve_shortlink(&resolved)?;
    }

    let resp = client()
        .get(&resolved)
        .send()
        .with_context(|| format!("requesting {resolved}"))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(FwError::HttpError(status.as_u16()).into());
    }
    let bytes = resp.bytes().context("reading response body")?;
    Ok(bytes.to_vec())
}
