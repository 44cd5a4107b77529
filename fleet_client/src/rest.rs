//! REST gateway: group/server/member metadata over HTTP.
//!
//! Modeled on the teacher's `retrieve::ky_http::ApiClient` — a
//! `reqwest_middleware` client wrapped with `reqwest-retry`'s
//! exponential backoff — generalized with bearer-token injection and
//! the platform's pagination-token header convention instead of that
//! client's optional static bearer token.

use std::sync::Arc;
use std::time::Duration;

use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::Error;
use crate::logging::LogSink;
use crate::model::{ConnectionDetails, Group, GroupMembership, Member, ServerInfo};
use crate::token::Session;
use crate::Result;

const PAGE_SIZE: usize = 1000;

/// Thin wrapper over the platform's REST API.
///
/// Holds a `watch::Receiver` onto the current [`Session`] so every
/// request picks up the latest bearer token without the caller having
/// to thread one through — the same "read the shared latest state,
/// don't own it" shape the teacher's `UpstreamManager` uses for its
/// `OperationMode`.
pub(crate) struct RestGateway {
    http: ClientWithMiddleware,
    base_url: String,
    x_api_key: String,
    session_rx: watch::Receiver<Option<Session>>,
    log: LogSink,
}

impl RestGateway {
    pub(crate) fn new(
        base_url: String,
        x_api_key: String,
        user_agent: String,
        request_attempts: u32,
        request_timeout: Duration,
        session_rx: watch::Receiver<Option<Session>>,
        log: LogSink,
    ) -> Self {
        let retry_policy = ExponentialBackoff::builder()
            .build_with_max_retries(request_attempts.saturating_sub(1));
        let inner = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(request_timeout)
            .build()
            .expect("reqwest client builder with static config never fails");
        let http = ClientBuilder::new(inner)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        Self {
            http,
            base_url,
            x_api_key,
            session_rx,
            log,
        }
    }

    fn bearer(&self) -> Result<Arc<str>> {
        self.session_rx
            .borrow()
            .as_ref()
            .map(|s| Arc::clone(&s.access_token))
            .ok_or_else(|| Error::TransientNetwork("no session token available yet".into()))
    }

    /// Issues a GET and returns the parsed body together with the
    /// `paginationToken` response header, if present. The header (not
    /// any body field) is the platform's pagination-continuation
    /// signal, so it must be read before the body is consumed.
    async fn get_page<T: DeserializeOwned>(&self, path: &str) -> Result<(T, Option<String>)> {
        let url = format!("{}{}", self.base_url, path);
        let token = self.bearer()?;
        let resp = self
            .http
            .get(&url)
            .header("x-api-key", &self.x_api_key)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| Error::RetriesExhausted(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            self.log
                .error(&format!("GET {path} -> {status}: {body}"));
            return Err(Error::RetriesExhausted(format!(
                "GET {path} returned {status}"
            )));
        }

        let pagination_token = resp
            .headers()
            .get("paginationToken")
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .map(str::to_owned);

        let parsed = resp
            .json::<T>()
            .await
            .map_err(|e| Error::RetriesExhausted(e.to_string()))?;
        Ok((parsed, pagination_token))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.get_page(path).await.map(|(body, _)| body)
    }

    async fn post_json<T: DeserializeOwned>(&self, path: &str, body: &impl Serialize) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let token = self.bearer()?;
        let resp = self
            .http
            .post(&url)
            .header("x-api-key", &self.x_api_key)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::RetriesExhausted(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            self.log
                .error(&format!("POST {path} -> {status}: {body}"));
            return Err(Error::RetriesExhausted(format!(
                "POST {path} returned {status}"
            )));
        }

        resp.json::<T>()
            .await
            .map_err(|e| Error::RetriesExhausted(e.to_string()))
    }

    /// Fetches every page of a paginated listing endpoint, following
    /// the `paginationToken` response header until the platform stops
    /// returning one.
    async fn get_all_pages<T: DeserializeOwned>(&self, base_path: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let path = match &token {
                Some(t) => format!(
                    "{base_path}?limit={PAGE_SIZE}&paginationToken={}",
                    urlencoding_minimal(t)
                ),
                None => format!("{base_path}?limit={PAGE_SIZE}"),
            };
            let (page, next): (Vec<T>, Option<String>) = self.get_page(&path).await?;
            items.extend(page);
            match next {
                Some(t) if !t.is_empty() => token = Some(t),
                _ => break,
            }
        }
        Ok(items)
    }

    pub(crate) async fn accept_group_invite(&self, group_id: &str) -> Result<()> {
        let path = format!("/groups/{group_id}/invites/accept");
        self.post_json::<serde_json::Value>(&path, &serde_json::json!({})).await?;
        Ok(())
    }

    pub(crate) async fn get_group_info(&self, group_id: &str) -> Result<Group> {
        self.get_json(&format!("/groups/{group_id}")).await
    }

    pub(crate) async fn get_group_member(&self, group_id: &str, member_id: &str) -> Result<Member> {
        self.get_json(&format!("/groups/{group_id}/members/{member_id}"))
            .await
    }

    pub(crate) async fn list_joined_groups(&self) -> Result<Vec<GroupMembership>> {
        self.get_all_pages("/groups/joined").await
    }

    pub(crate) async fn list_pending_group_invites(&self) -> Result<Vec<crate::model::GroupInvite>> {
        self.get_all_pages("/groups/invites/pending").await
    }

    pub(crate) async fn get_server_info(&self, server_id: &str) -> Result<ServerInfo> {
        self.get_json(&format!("/servers/{server_id}")).await
    }

    /// `should_launch`/`ignore_offline` are always sent `false`: this
    /// crate only ever asks for a connection to a server it already
    /// believes is online.
    pub(crate) async fn get_server_connection_details(
        &self,
        server_id: &str,
    ) -> Result<ConnectionDetails> {
        let body = serde_json::json!({ "should_launch": false, "ignore_offline": false });
        self.post_json(&format!("/servers/{server_id}/connection"), &body)
            .await
    }
}

/// Percent-encodes the handful of characters that commonly show up in
/// an opaque pagination token without pulling in a full URL-encoding
/// crate beyond what `url` already provides.
fn urlencoding_minimal(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencoding_minimal_escapes_reserved_characters() {
        assert_eq!(urlencoding_minimal("a b+c"), "a+b%2Bc");
    }
}
