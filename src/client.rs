use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono_tz::Tz;
use reqwest::{Method, RequestBuilder, Response};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::classify::ChannelRules;
use crate::clock::{Clock, SystemClock};
use crate::config::IptvConfig;
use crate::error::{IptvError, Result};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Session-scoped client for one middleware deployment.
///
/// `host` starts as the configured server and is replaced by the host the
/// authentication endpoint redirects to; every later call goes there.
pub struct Client {
    http: reqwest::Client,
    pub(crate) config: IptvConfig,
    pub(crate) rules: ChannelRules,
    pub(crate) tz: Tz,
    pub(crate) clock: Arc<dyn Clock>,
    origin_host: String,
    host: String,
    cancel: CancellationToken,
}

impl Client {
    pub fn new(config: IptvConfig, rules: ChannelRules, tz: Tz) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let origin_host = config.server_host.clone();
        Ok(Self {
            http,
            host: origin_host.clone(),
            origin_host,
            config,
            rules,
            tz,
            clock: Arc::new(SystemClock),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn origin_host(&self) -> &str {
        &self.origin_host
    }

    pub(crate) fn set_host(&mut self, host: String) {
        if host != self.host {
            debug!("Middleware host resolved: {} -> {}", self.host, host);
        }
        self.host = host;
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.host, path)
    }

    pub(crate) fn now(&self) -> DateTime<Tz> {
        self.clock.now().with_timezone(&self.tz)
    }

    /// Builds a request with the configured custom headers applied.
    pub(crate) fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let mut req = self.http.request(method, url);
        for (k, v) in &self.config.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        req
    }

    /// Sends a request, aborting as soon as the cancellation token fires.
    pub(crate) async fn send(&self, req: RequestBuilder) -> Result<Response> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(IptvError::Cancelled),
            resp = req.send() => Ok(resp?),
        }
    }

    /// Like [`Client::send`] but any non-success status is an error.
    pub(crate) async fn send_ok(&self, req: RequestBuilder) -> Result<Response> {
        let resp = self.send(req).await?;
        if !resp.status().is_success() {
            return Err(IptvError::Status(resp.status().as_u16()));
        }
        Ok(resp)
    }

    pub(crate) async fn text(&self, resp: Response) -> Result<String> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(IptvError::Cancelled),
            body = resp.text() => Ok(body?),
        }
    }
}

pub(crate) fn session_cookie(session_id: &str) -> String {
    format!("JSESSIONID={session_id}")
}

/// `host[:port]` of a URL, the form used to address the middleware.
pub(crate) fn host_of(url: &url::Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}
