//! Shared fakes for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use sides_sync::cache::{CacheMode, FetchError, Fetcher, Request, Response};
use sides_sync::upload::{UploadError, Uploader};

/// Records every successful upload; can be switched to fail or to stall.
#[derive(Default)]
pub struct RecordingUploader {
    fail: AtomicBool,
    delay_ms: AtomicUsize,
    attempts: AtomicUsize,
    uploaded: Mutex<Vec<Value>>,
}

impl RecordingUploader {
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn uploaded(&self) -> Vec<Value> {
        self.uploaded.lock().unwrap().clone()
    }
}

#[async_trait]
impl Uploader for RecordingUploader {
    async fn upload(&self, payload: &Value) -> Result<(), UploadError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(UploadError::Network("remote unreachable".into()));
        }
        self.uploaded.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

/// Serves canned responses by URL. Unknown URLs and offline mode fail.
#[derive(Default)]
pub struct ScriptedFetcher {
    responses: Mutex<HashMap<String, Response>>,
    offline: AtomicBool,
    requests: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn serve(&self, url: &str, response: Response) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), response);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &Request, _mode: CacheMode) -> Result<Response, FetchError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchError::Network("offline".into()));
        }
        self.responses
            .lock()
            .unwrap()
            .get(&request.url)
            .cloned()
            .ok_or_else(|| FetchError::Network(format!("no route to {}", request.url)))
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
