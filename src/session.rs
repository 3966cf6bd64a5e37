//! Authenticated access to the remote admin surface.
//!
//! The pipeline only sees `PageSource`: something that turns a URL into HTML.
//! `HttpSessionProvider` logs in through the `/auth` form with a cookie-holding
//! `reqwest` client; each provider call yields a fresh session owned by one run.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use scraper::Html;
use tracing::{debug, info};

use crate::config::ImperioConfig;
use crate::error::{AppError, Result};
use crate::extract::html::sel;

/// A fetched page: the URL after redirects and its body.
#[derive(Debug, Clone)]
pub struct Page {
    pub url: String,
    pub html: String,
}

#[async_trait]
pub trait PageSource: Send {
    async fn fetch(&mut self, url: &str) -> Result<Page>;
}

#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Open and authenticate a new session.
    async fn open(&self) -> Result<Box<dyn PageSource>>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpSessionProvider {
    cfg: ImperioConfig,
    timeout: Duration,
}

impl HttpSessionProvider {
    pub fn new(cfg: ImperioConfig, timeout: Duration) -> Self {
        Self { cfg, timeout }
    }
}

#[async_trait]
impl SessionProvider for HttpSessionProvider {
    async fn open(&self) -> Result<Box<dyn PageSource>> {
        if self.cfg.username.is_empty() || self.cfg.password.is_empty() {
            return Err(AppError::Auth("credentials are not configured".to_string()));
        }

        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(self.timeout)
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()?;

        let base = self.cfg.base_url.trim_end_matches('/').to_string();
        login(&client, &base, &self.cfg.username, &self.cfg.password).await?;

        Ok(Box::new(HttpSession { client }))
    }
}

struct HttpSession {
    client: reqwest::Client,
}

#[async_trait]
impl PageSource for HttpSession {
    async fn fetch(&mut self, url: &str) -> Result<Page> {
        let resp = self.client.get(url).send().await?.error_for_status()?;
        let final_url = resp.url().to_string();
        if is_login_url(&final_url) && !is_login_url(url) {
            return Err(AppError::Auth(format!("session expired while fetching {url}")));
        }
        let html = resp.text().await?;
        debug!("Fetched {final_url} ({} bytes)", html.len());
        Ok(Page { url: final_url, html })
    }
}

async fn login(client: &reqwest::Client, base: &str, username: &str, password: &str) -> Result<()> {
    let auth_url = format!("{base}/auth");
    let resp = client.get(&auth_url).send().await?.error_for_status()?;
    let page_url = resp.url().clone();
    let html = resp.text().await?;

    let form = parse_login_form(&html, &page_url)?;
    let mut fields = form.hidden;
    fields.push(("username".to_string(), username.to_string()));
    fields.push(("password".to_string(), password.to_string()));

    let resp = client.post(form.action).form(&fields).send().await?;
    let status = resp.status();
    let landed = resp.url().to_string();
    if !status.is_success() {
        return Err(AppError::Auth(format!("login returned HTTP {status}")));
    }
    if !(landed.contains("admin") || landed.contains("dashboard")) {
        return Err(AppError::Auth(format!("credentials rejected (landed on {landed})")));
    }

    info!("Login successful as {username}");
    Ok(())
}

fn is_login_url(url: &str) -> bool {
    Url::parse(url)
        .map(|u| u.path().trim_end_matches('/').ends_with("/auth"))
        .unwrap_or(false)
}

#[derive(Debug)]
pub struct LoginForm {
    pub action: Url,
    /// Hidden inputs (CSRF tokens etc.) forwarded with the credentials.
    pub hidden: Vec<(String, String)>,
}

/// Locate the username/password form on the login page.
pub fn parse_login_form(html: &str, page_url: &Url) -> Result<LoginForm> {
    let doc = Html::parse_document(html);
    let form_sel = sel("form");
    let user_sel = sel("input[name='username']");
    let pass_sel = sel("input[name='password']");
    let hidden_sel = sel("input[type='hidden'][name]");

    if doc.select(&user_sel).next().is_none() || doc.select(&pass_sel).next().is_none() {
        return Err(AppError::Auth("login fields not found".to_string()));
    }

    let form = doc
        .select(&form_sel)
        .find(|f| f.select(&user_sel).next().is_some());

    let action = form
        .and_then(|f| f.value().attr("action"))
        .filter(|a| !a.trim().is_empty())
        .and_then(|a| page_url.join(a.trim()).ok())
        .unwrap_or_else(|| page_url.clone());

    let hidden = form
        .map(|f| {
            f.select(&hidden_sel)
                .filter_map(|i| {
                    let name = i.value().attr("name")?;
                    Some((name.to_string(), i.value().attr("value").unwrap_or("").to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(LoginForm { action, hidden })
}

// ---------------------------------------------------------------------------
// In-memory pages for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub mod fake {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Serves fixed HTML keyed by URL. Unknown URLs fail like a 404 would.
    #[derive(Clone, Default)]
    pub struct StaticPages {
        pages: Arc<HashMap<String, String>>,
        pub fetched: Arc<Mutex<Vec<String>>>,
        pub opened: Arc<AtomicUsize>,
        /// Highest number of fetches seen in flight at once, across clones.
        pub peak_in_flight: Arc<AtomicUsize>,
        in_flight: Arc<AtomicUsize>,
        delay: Duration,
        fail_login: bool,
    }

    impl StaticPages {
        pub fn new<I, U, H>(pages: I) -> Self
        where
            I: IntoIterator<Item = (U, H)>,
            U: Into<String>,
            H: Into<String>,
        {
            Self {
                pages: Arc::new(
                    pages
                        .into_iter()
                        .map(|(u, h)| (u.into(), h.into()))
                        .collect(),
                ),
                ..Default::default()
            }
        }

        pub fn rejecting_login() -> Self {
            Self {
                fail_login: true,
                ..Default::default()
            }
        }

        /// Every fetch sleeps for `delay` before answering.
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn fetched(&self) -> Vec<String> {
            self.fetched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageSource for StaticPages {
        async fn fetch(&mut self, url: &str) -> Result<Page> {
            self.fetched.lock().unwrap().push(url.to_string());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match self.pages.get(url) {
                Some(html) => Ok(Page {
                    url: url.to_string(),
                    html: html.clone(),
                }),
                None => Err(AppError::NotFound(url.to_string())),
            }
        }
    }

    #[async_trait]
    impl SessionProvider for StaticPages {
        async fn open(&self) -> Result<Box<dyn PageSource>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            if self.fail_login {
                return Err(AppError::Auth("credentials rejected".to_string()));
            }
            Ok(Box::new(self.clone()))
        }
    }
}
