//! Google Scholar author-profile lookup.
//!
//! The engine only ever sees the [`AuthorSource`] trait; this module provides
//! the HTTP-backed implementation against the public citations profile page,
//! with anti-detection headers, CAPTCHA detection, and rate-limit
//! classification.

use crate::error::{CitemapError, Result};
use async_trait::async_trait;
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Default Google Scholar URL
pub const DEFAULT_SCHOLAR_URL: &str = "https://scholar.google.com";

/// User agent string for requests
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// A citing author's public profile, as much of it as Scholar exposes.
#[derive(Debug, Clone, Default)]
pub struct AuthorProfile {
    /// Display name
    pub name: String,
    /// Self-reported affiliation line
    pub affiliation: Option<String>,
    /// Verified organization link text, when the profile carries one
    pub organization: Option<String>,
}

/// Source of author profiles.
///
/// The enrichment client is written against this seam so tests can script
/// outcomes without touching the network. `Ok(None)` means the page was
/// fetched and parsed but no profile exists for the id.
#[async_trait]
pub trait AuthorSource: Send + Sync {
    async fn fetch_author(&self, author_id: &str) -> Result<Option<AuthorProfile>>;
}

/// HTTP client for Scholar author profile pages
pub struct ScholarClient {
    client: reqwest::Client,
    base_url: String,
}

impl ScholarClient {
    /// Create a client with optional proxy
    pub fn new(proxy: Option<&str>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .cookie_store(true);

        if let Some(proxy_url) = proxy {
            let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| {
                CitemapError::Config(format!("Invalid proxy URL '{}': {}", proxy_url, e))
            })?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| CitemapError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: DEFAULT_SCHOLAR_URL.to_string(),
        })
    }

    /// Use a mirror site instead of scholar.google.com
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Build the citations profile URL for an author id
    fn profile_url(&self, author_id: &str) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/citations", self.base_url))
            .map_err(|e| CitemapError::Config(format!("Invalid base URL: {}", e)))?;
        {
            let mut params = url.query_pairs_mut();
            params.append_pair("user", author_id);
            params.append_pair("hl", "en"); // Force English locale for consistent parsing
        }
        Ok(url)
    }
}

#[async_trait]
impl AuthorSource for ScholarClient {
    async fn fetch_author(&self, author_id: &str) -> Result<Option<AuthorProfile>> {
        let url = self.profile_url(author_id)?;
        debug!(author = author_id, url = %url, "Fetching author profile");

        let response = self
            .client
            .get(url.as_str())
            .header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8")
            .header("Accept-Language", "en-US,en;q=0.9")
            .header("Cache-Control", "no-cache")
            .header("Pragma", "no-cache")
            .header("Sec-Fetch-Dest", "document")
            .header("Sec-Fetch-Mode", "navigate")
            .header("Sec-Fetch-Site", "none")
            .header("Upgrade-Insecure-Requests", "1")
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(CitemapError::RateLimited(60));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            debug!(author = author_id, "No profile page");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(CitemapError::Api {
                code: status.as_u16() as i32,
                message: format!("HTTP error: {}", status),
            });
        }

        let html = response.text().await?;

        if html.contains("Solving the above CAPTCHA") || html.contains("unusual traffic") {
            warn!(author = author_id, "CAPTCHA detected");
            return Err(CitemapError::Captcha);
        }

        parse_author_profile(&html)
    }
}

/// Parse a Scholar citations profile page.
///
/// Returns `Ok(None)` when the page carries no profile header (deleted or
/// unknown author id).
pub fn parse_author_profile(html: &str) -> Result<Option<AuthorProfile>> {
    let document = Html::parse_document(html);

    let name_selector =
        Selector::parse("#gsc_prf_in").map_err(|e| CitemapError::Parse(e.to_string()))?;
    let affil_selector =
        Selector::parse("div.gsc_prf_il").map_err(|e| CitemapError::Parse(e.to_string()))?;
    let org_selector =
        Selector::parse("a.gsc_prf_ila").map_err(|e| CitemapError::Parse(e.to_string()))?;

    let name = match document.select(&name_selector).next() {
        Some(elem) => elem.text().collect::<String>().trim().to_string(),
        None => return Ok(None),
    };
    if name.is_empty() {
        return Ok(None);
    }

    // First profile line is the self-reported affiliation.
    let affiliation = document
        .select(&affil_selector)
        .next()
        .map(|elem| elem.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty());

    // Verified organizations link back to Scholar's org pages.
    let organization = document
        .select(&org_selector)
        .find(|link| {
            link.value()
                .attr("href")
                .is_some_and(|href| href.contains("org="))
        })
        .map(|link| link.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty());

    Ok(Some(AuthorProfile {
        name,
        affiliation,
        organization,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE_HTML: &str = r#"
        <html><body>
          <div id="gsc_prf_in">Alice Example</div>
          <div class="gsc_prf_il">Professor of Computer Science, MIT</div>
          <div class="gsc_prf_il">
            <a class="gsc_prf_ila" href="/citations?view_op=view_org&org=12345">Massachusetts Institute of Technology</a>
          </div>
        </body></html>
    "#;

    #[test]
    fn test_parse_full_profile() -> Result<()> {
        let profile = parse_author_profile(PROFILE_HTML)?.expect("profile");
        assert_eq!(profile.name, "Alice Example");
        assert_eq!(
            profile.affiliation.as_deref(),
            Some("Professor of Computer Science, MIT")
        );
        assert_eq!(
            profile.organization.as_deref(),
            Some("Massachusetts Institute of Technology")
        );
        Ok(())
    }

    #[test]
    fn test_parse_profile_without_organization() -> Result<()> {
        let html = r#"
            <html><body>
              <div id="gsc_prf_in">Bob Example</div>
              <div class="gsc_prf_il">Independent Researcher</div>
            </body></html>
        "#;
        let profile = parse_author_profile(html)?.expect("profile");
        assert_eq!(profile.name, "Bob Example");
        assert_eq!(profile.affiliation.as_deref(), Some("Independent Researcher"));
        assert!(profile.organization.is_none());
        Ok(())
    }

    #[test]
    fn test_parse_missing_profile() -> Result<()> {
        let profile = parse_author_profile("<html><body></body></html>")?;
        assert!(profile.is_none());
        Ok(())
    }

    #[test]
    fn test_profile_url() -> Result<()> {
        let client = ScholarClient::new(None)?;
        let url = client.profile_url("HNw5OdcAAAAJ")?;
        assert!(url.as_str().contains("user=HNw5OdcAAAAJ"));
        assert!(url.as_str().contains("hl=en"));
        Ok(())
    }
}
