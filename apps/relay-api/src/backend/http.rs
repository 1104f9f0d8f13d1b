//! `reqwest` implementation of [`BackendApi`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, Url};
use serde::de::DeserializeOwned;

use banter_common::model::{FilterRule, ProfileSummary, StoredMessage};

use super::api::{BackendApi, BackendError, BackendResult};

/// HTTP client for the persistence backend. One attempt per call; scope and
/// message ids are pushed as path segments so DM composites (`dm:a|b`)
/// survive URL encoding.
pub struct HttpBackend {
    client: reqwest::Client,
    base: Url,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl HttpBackend {
    /// Panics on an unparseable base URL; that is a startup configuration
    /// error, not a runtime condition.
    pub fn new(base_url: &str, read_timeout: Duration, write_timeout: Duration) -> Self {
        let base = Url::parse(base_url).expect("BACKEND_URL must be a valid URL");
        Self {
            client: reqwest::Client::new(),
            base,
            read_timeout,
            write_timeout,
        }
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .expect("BACKEND_URL must be a base URL")
            .pop_if_empty()
            .extend(segments);
        url
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, String)],
    ) -> BackendResult<T> {
        let resp = self
            .client
            .get(url)
            .query(query)
            .timeout(self.read_timeout)
            .send()
            .await
            .map_err(map_reqwest)?;
        decode_json(resp).await
    }
}

fn map_reqwest(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Network(err.to_string())
    }
}

async fn decode_json<T: DeserializeOwned>(resp: Response) -> BackendResult<T> {
    let status = resp.status();
    if !status.is_success() {
        return Err(BackendError::Status(status.as_u16()));
    }
    resp.json::<T>()
        .await
        .map_err(|err| BackendError::Decode(err.to_string()))
}

fn expect_ok(resp: Response) -> BackendResult<()> {
    let status = resp.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(BackendError::Status(status.as_u16()))
    }
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn latest_messages(
        &self,
        scope_id: &str,
        count: usize,
    ) -> BackendResult<Vec<StoredMessage>> {
        self.get_json(
            self.url(&["messages", scope_id, "latest"]),
            &[("count", count.to_string())],
        )
        .await
    }

    async fn message_page(
        &self,
        scope_id: &str,
        before_ms: i64,
        limit: usize,
    ) -> BackendResult<Vec<StoredMessage>> {
        self.get_json(
            self.url(&["messages", scope_id, "page"]),
            &[
                ("before", before_ms.to_string()),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }

    async fn post_message(
        &self,
        scope_id: &str,
        message: &StoredMessage,
    ) -> BackendResult<StoredMessage> {
        let resp = self
            .client
            .post(self.url(&["messages", scope_id]))
            .json(message)
            .timeout(self.write_timeout)
            .send()
            .await
            .map_err(map_reqwest)?;
        decode_json(resp).await
    }

    async fn put_message(
        &self,
        scope_id: &str,
        message_id: &str,
        text: &str,
    ) -> BackendResult<StoredMessage> {
        let resp = self
            .client
            .put(self.url(&["messages", scope_id, message_id]))
            .json(&serde_json::json!({ "text": text }))
            .timeout(self.write_timeout)
            .send()
            .await
            .map_err(map_reqwest)?;
        decode_json(resp).await
    }

    async fn delete_message(&self, scope_id: &str, message_id: &str) -> BackendResult<()> {
        let resp = self
            .client
            .delete(self.url(&["messages", scope_id, message_id]))
            .timeout(self.write_timeout)
            .send()
            .await
            .map_err(map_reqwest)?;
        expect_ok(resp)
    }

    async fn post_reaction(
        &self,
        scope_id: &str,
        message_id: &str,
        username: &str,
        emoji: Option<&str>,
    ) -> BackendResult<()> {
        let resp = self
            .client
            .post(self.url(&["messages", scope_id, message_id, "reactions"]))
            .json(&serde_json::json!({ "username": username, "emoji": emoji }))
            .timeout(self.write_timeout)
            .send()
            .await
            .map_err(map_reqwest)?;
        expect_ok(resp)
    }

    async fn message_filters(&self, user_id: &str) -> BackendResult<Vec<FilterRule>> {
        self.get_json(self.url(&["users", user_id, "message-filters"]), &[])
            .await
    }

    async fn add_message_filter(&self, user_id: &str, rule: &FilterRule) -> BackendResult<()> {
        let resp = self
            .client
            .post(self.url(&["users", user_id, "message-filters"]))
            .json(rule)
            .timeout(self.write_timeout)
            .send()
            .await
            .map_err(map_reqwest)?;
        expect_ok(resp)
    }

    async fn remove_message_filter(
        &self,
        user_id: &str,
        scope_id: &str,
        muted_username: &str,
    ) -> BackendResult<()> {
        let resp = self
            .client
            .delete(self.url(&["users", user_id, "message-filters"]))
            .query(&[("scope", scope_id), ("username", muted_username)])
            .timeout(self.write_timeout)
            .send()
            .await
            .map_err(map_reqwest)?;
        expect_ok(resp)
    }

    async fn add_group_member(&self, group_id: &str, username: &str) -> BackendResult<()> {
        let resp = self
            .client
            .post(self.url(&["groups", group_id, "members"]))
            .json(&serde_json::json!({ "username": username }))
            .timeout(self.write_timeout)
            .send()
            .await
            .map_err(map_reqwest)?;
        expect_ok(resp)
    }

    async fn remove_group_member(&self, group_id: &str, username: &str) -> BackendResult<()> {
        let resp = self
            .client
            .delete(self.url(&["groups", group_id, "members", username]))
            .timeout(self.write_timeout)
            .send()
            .await
            .map_err(map_reqwest)?;
        expect_ok(resp)
    }

    async fn profiles(&self, usernames: &[String]) -> BackendResult<Vec<ProfileSummary>> {
        self.get_json(
            self.url(&["profiles", "batch"]),
            &[("users", usernames.join(","))],
        )
        .await
    }

    async fn post_like(&self, from: &str, to: &str) -> BackendResult<()> {
        let resp = self
            .client
            .post(self.url(&["likes"]))
            .json(&serde_json::json!({ "from": from, "to": to }))
            .timeout(self.write_timeout)
            .send()
            .await
            .map_err(map_reqwest)?;
        expect_ok(resp)
    }

    async fn delete_like(&self, from: &str, to: &str) -> BackendResult<()> {
        let resp = self
            .client
            .delete(self.url(&["likes"]))
            .query(&[("from", from), ("to", to)])
            .timeout(self.write_timeout)
            .send()
            .await
            .map_err(map_reqwest)?;
        expect_ok(resp)
    }

    async fn dm_threads(&self, username: &str) -> BackendResult<Vec<String>> {
        self.get_json(
            self.url(&["dm", "threads"]),
            &[("user", username.to_string())],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_keeps_dm_scope_in_one_segment() {
        let backend = HttpBackend::new(
            "http://localhost:4000",
            Duration::from_secs(6),
            Duration::from_secs(12),
        );
        let url = backend.url(&["messages", "dm:alice|bob", "latest"]);
        let segments: Vec<&str> = url.path_segments().unwrap().collect();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0], "messages");
        assert_eq!(segments[2], "latest");
    }

    #[test]
    fn url_joins_under_base_path() {
        let backend = HttpBackend::new(
            "http://localhost:4000/api/v2/",
            Duration::from_secs(6),
            Duration::from_secs(12),
        );
        let url = backend.url(&["likes"]);
        assert_eq!(url.as_str(), "http://localhost:4000/api/v2/likes");
    }
}
