//! Scripted in-process upstream for orchestrator tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use vreg_server::upstream::{
    ChecksumHeaders, UpstreamBody, UpstreamClient, UpstreamError, UpstreamRequest,
    UpstreamResponse,
};

/// One canned upstream answer.
#[allow(dead_code)]
#[derive(Clone, Debug)]
pub enum Reply {
    Body {
        data: Bytes,
        etag: Option<String>,
        checksums: ChecksumHeaders,
    },
    NotModified,
    NotFound,
    Status(u16),
}

#[allow(dead_code)]
impl Reply {
    pub fn body(data: impl Into<Bytes>) -> Self {
        Self::Body {
            data: data.into(),
            etag: None,
            checksums: ChecksumHeaders::default(),
        }
    }

    pub fn body_with_etag(data: impl Into<Bytes>, etag: &str) -> Self {
        Self::Body {
            data: data.into(),
            etag: Some(etag.to_string()),
            checksums: ChecksumHeaders::default(),
        }
    }

    pub fn body_with_sha1(data: impl Into<Bytes>, sha1: &str) -> Self {
        Self::Body {
            data: data.into(),
            etag: None,
            checksums: ChecksumHeaders {
                sha1: Some(sha1.to_string()),
                ..ChecksumHeaders::default()
            },
        }
    }
}

/// Answers by URL; the last reply for a URL repeats. Unknown URLs get 404.
#[allow(dead_code)]
#[derive(Default)]
pub struct ScriptedUpstream {
    replies: Mutex<HashMap<String, Vec<Reply>>>,
    calls: Mutex<HashMap<String, usize>>,
    conditional_calls: AtomicUsize,
    delay: Option<Duration>,
}

#[allow(dead_code)]
impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every response for `delay` so concurrent callers overlap.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Queue replies for `url`, replacing any left over.
    pub fn script(&self, url: &str, replies: Vec<Reply>) {
        self.replies
            .lock()
            .unwrap()
            .insert(url.to_string(), replies);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    /// Requests that carried `If-None-Match`.
    pub fn conditional_calls(&self) -> usize {
        self.conditional_calls.load(Ordering::SeqCst)
    }

    fn next_reply(&self, url: &str) -> Option<Reply> {
        let mut replies = self.replies.lock().unwrap();
        let queue = replies.get_mut(url)?;
        if queue.len() > 1 {
            Some(queue.remove(0))
        } else {
            queue.first().cloned()
        }
    }
}

#[async_trait]
impl UpstreamClient for ScriptedUpstream {
    async fn get(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(request.url.clone())
            .or_default() += 1;
        if request.if_none_match.is_some() {
            self.conditional_calls.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.next_reply(&request.url) {
            None | Some(Reply::NotFound) => Ok(UpstreamResponse::NotFound { status: 404 }),
            Some(Reply::NotModified) => Ok(UpstreamResponse::NotModified { etag: None }),
            Some(Reply::Status(status)) => Err(UpstreamError::Status(status)),
            Some(Reply::Body {
                data,
                etag,
                checksums,
            }) => {
                let length = data.len() as u64;
                Ok(UpstreamResponse::Ok(UpstreamBody {
                    content_type: None,
                    etag,
                    content_length: Some(length),
                    checksums,
                    body: Box::pin(futures::stream::once(async move { Ok(data) })),
                }))
            }
        }
    }
}
