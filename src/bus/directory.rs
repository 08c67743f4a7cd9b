// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Client for the distributed busid -> host directory, kept in an external
// flat string/string KV store. Port of bus/consul.h + src/core/consul_client
// /rest_client — a libcurl+libuv async client there; a small synchronous
// `ureq`-based client here, matching the router's one-iteration, one-
// bounded-unit-of-work main loop (see router.rs).

use std::collections::HashMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::warn;
use serde::Deserialize;

use crate::error::{BusError, BusResult};

const KV_PREFIX: &str = "v1/kv";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One flat-namespace KV store reachable over HTTP.
pub trait Directory {
    fn set(&self, key: &str, value: &str) -> BusResult<()>;
    fn del(&self, key: &str, recursive: bool) -> BusResult<()>;
    /// All `key => value` pairs whose key starts with `prefix`.
    fn get_all(&self, prefix: &str) -> BusResult<HashMap<String, String>>;
}

#[derive(Deserialize)]
struct KvEntry {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
}

/// Round-robins across `addrs` so a single down node doesn't wedge the
/// directory; each call picks the next address and tries it once.
pub struct HttpDirectory {
    addrs: Vec<String>,
    next: std::sync::atomic::AtomicUsize,
    agent: ureq::Agent,
}

impl HttpDirectory {
    pub fn new(addrs: Vec<String>) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(DEFAULT_TIMEOUT).build();
        HttpDirectory { addrs, next: std::sync::atomic::AtomicUsize::new(0), agent }
    }

    fn pick_addr(&self) -> BusResult<&str> {
        if self.addrs.is_empty() {
            return Err(BusError::FatalInit("no KV server addresses configured".into()));
        }
        let i = self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % self.addrs.len();
        Ok(&self.addrs[i])
    }

    fn base_url(&self) -> BusResult<String> {
        Ok(format!("http://{}/{}", self.pick_addr()?, KV_PREFIX))
    }
}

impl Directory for HttpDirectory {
    fn set(&self, key: &str, value: &str) -> BusResult<()> {
        let url = format!("{}/{}", self.base_url()?, key);
        self.agent
            .put(&url)
            .send_string(value)
            .map(|_| ())
            .map_err(|e| BusError::TransientIo(format!("KV set {key}: {e}")))
    }

    fn del(&self, key: &str, recursive: bool) -> BusResult<()> {
        let url = format!("{}/{}", self.base_url()?, key);
        let mut req = self.agent.delete(&url);
        if recursive {
            req = req.query("recurse", "true");
        }
        req.call().map(|_| ()).map_err(|e| BusError::TransientIo(format!("KV del {key}: {e}")))
    }

    fn get_all(&self, prefix: &str) -> BusResult<HashMap<String, String>> {
        let url = format!("{}/{}", self.base_url()?, prefix);
        let resp = self.agent.get(&url).query("recurse", "true").call();
        let resp = match resp {
            Ok(r) => r,
            // A 404 from an empty prefix is not an error: no entries yet.
            Err(ureq::Error::Status(404, _)) => return Ok(HashMap::new()),
            Err(e) => return Err(BusError::TransientIo(format!("KV get_all {prefix}: {e}"))),
        };
        let entries: Vec<KvEntry> = resp
            .into_json()
            .map_err(|e| BusError::TransientIo(format!("KV get_all {prefix} decode: {e}")))?;

        let mut map = HashMap::with_capacity(entries.len());
        for entry in entries {
            let Some(encoded) = entry.value else { continue };
            match BASE64.decode(encoded.as_bytes()) {
                Ok(raw) => match String::from_utf8(raw) {
                    Ok(value) => {
                        map.insert(entry.key, value);
                    }
                    Err(_) => warn!("KV entry {} is not valid UTF-8, skipping", entry.key),
                },
                Err(_) => warn!("KV entry {} has malformed base64 value, skipping", entry.key),
            }
        }
        Ok(map)
    }
}

/// Key used for a given busid in the `bus/` namespace.
pub fn bus_key(busid: i32) -> String {
    format!("bus/{busid:x}")
}
