//! REST client for long-poll venues.
//!
//! One shared `reqwest` client with a fixed User-Agent, 5 s connect and
//! total timeouts, at most 5 redirects and an optional proxy. Failures
//! of any kind yield an empty JSON map; callers detect venue errors via
//! absent fields, never via exceptions.

use log::debug;
use reqwest::redirect::Policy;
use serde_json::Value;
use tokio::time::Duration;

use crate::error::Result;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 6.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/57.0.2987.133 Safari/537.36";
const TIMEOUT: Duration = Duration::from_secs(5);

pub struct RestClient {
    client: reqwest::Client,
}

impl RestClient {
    pub fn new(proxy: Option<&str>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(TIMEOUT)
            .timeout(TIMEOUT)
            .redirect(Policy::limited(5));
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }

    /// Fetch `url` and parse the body as JSON; empty map on any failure.
    pub async fn request(&self, url: &str) -> Value {
        match self.try_request(url).await {
            Ok(value) => value,
            Err(err) => {
                debug!("request {url} failed: {err}");
                Value::Object(serde_json::Map::new())
            }
        }
    }

    async fn try_request(&self, url: &str) -> Result<Value> {
        Ok(self.client.get(url).send().await?.json().await?)
    }
}
