//! The in-process installation: a process-global request function.
//!
//! [`install`] swaps a resolver into the global slot; [`fetch`] is the
//! request function embedders call in place of their HTTP client. Paths
//! matching a registered source are answered by the resolver, everything
//! else forwards to the original transport. `install`/`remove` are paired
//! and idempotent; this is process-wide state, so library callers running
//! in shared processes should prefer the direct resolve API.

use std::sync::{Arc, OnceLock, RwLock};

use url::Url;

use crate::resolver::{Payload, Resolver};

static HOOK: OnceLock<RwLock<Option<Arc<Resolver>>>> = OnceLock::new();

fn slot() -> &'static RwLock<Option<Arc<Resolver>>> {
    HOOK.get_or_init(|| RwLock::new(None))
}

/// Install a resolver as the process-global request interceptor.
/// Re-installing the same resolver is a no-op; installing another replaces
/// it.
pub fn install(resolver: Arc<Resolver>) {
    let mut slot = slot().write().unwrap();
    if let Some(existing) = slot.as_ref() {
        if Arc::ptr_eq(existing, &resolver) {
            return;
        }
    }
    *slot = Some(resolver);
}

/// Restore the original (un-intercepted) transport.
pub fn remove() {
    *slot().write().unwrap() = None;
}

pub fn installed() -> Option<Arc<Resolver>> {
    slot().read().unwrap().clone()
}

fn request_path(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => parsed.path().to_owned(),
        // Relative form: treat the input as a path already.
        Err(_) => url.split(['?', '#']).next().unwrap_or(url).to_owned(),
    }
}

/// The hooked request function.
///
/// Unlike the browser installation this raises typed errors on transport
/// failure; in-process callers are expected to handle them.
pub async fn fetch(url: &str, range: Option<&str>) -> anyhow::Result<Payload> {
    let path = request_path(url);
    if let Some(resolver) = installed() {
        if let Some(payload) = resolver.handle(&path, range).await {
            return Ok(payload);
        }
    }

    // Not under any registered prefix: forward to the original transport.
    let client = reqwest::Client::builder().build()?;
    let mut req = client.get(url);
    if let Some(range) = range {
        req = req.header("Range", range);
    }
    let resp = req.send().await?;
    let status = resp.status().as_u16();
    let bytes = resp.bytes().await?;
    Ok(Payload::proxied(status, bytes))
}
