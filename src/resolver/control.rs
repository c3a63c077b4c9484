//! The message protocol between an embedding application and the resolver.
//!
//! Both installations speak the same JSON shapes: the service worker over
//! `postMessage`, the in-process hook over plain function calls.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{progress::ProgressEvent, resolver::Resolver, source::Source};

/// Wire form of a source registration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    pub path_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdn_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<String>,
    #[serde(default)]
    pub progress: bool,
}

impl SourceSpec {
    /// Exactly one of `cdn_base`/`local_base` must be set.
    pub fn into_source(self) -> Result<Source, String> {
        let source = match (self.cdn_base, self.local_base) {
            (Some(cdn), None) => {
                let url = Url::parse(&cdn).map_err(|e| format!("bad cdnBase {cdn}: {e}"))?;
                Source::remote(&self.path_prefix, url)
            }
            (None, Some(local)) => Source::local(&self.path_prefix, local),
            (Some(_), Some(_)) => {
                return Err(format!(
                    "{}: both cdnBase and localBase set",
                    self.path_prefix
                ));
            }
            (None, None) => {
                return Err(format!(
                    "{}: neither cdnBase nor localBase set",
                    self.path_prefix
                ));
            }
        };
        Ok(source
            .with_manifest(self.manifest)
            .with_progress(self.progress))
    }
}

/// Messages from the application to the resolver.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlRequest {
    /// Replace all registered sources, reset progress, begin filemap loads.
    Init { sources: Vec<SourceSpec> },
    /// Force-finalize progress for one source.
    Complete { prefix: String },
    ClearCache,
    Status,
}

/// Messages from the resolver to the application.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlResponse {
    Progress(ProgressEvent),
    CacheCleared,
    Status {
        sources: Vec<String>,
        filemaps_loaded: Vec<String>,
    },
}

/// Apply a control message. `Complete` and a successful `Init` have no
/// reply; `ClearCache` and `Status` answer.
pub async fn handle_control(resolver: &Resolver, request: ControlRequest) -> Option<ControlResponse> {
    match request {
        ControlRequest::Init { sources } => {
            let mut registered = Vec::new();
            for spec in sources {
                match spec.into_source() {
                    Ok(source) => registered.push(source),
                    Err(e) => crate::warn!("ignoring source registration: {e}"),
                }
            }
            resolver.init(registered).await;
            None
        }
        ControlRequest::Complete { prefix } => {
            resolver.complete(&prefix).await;
            None
        }
        ControlRequest::ClearCache => {
            resolver.clear_cache().await;
            Some(ControlResponse::CacheCleared)
        }
        ControlRequest::Status => {
            let (sources, filemaps_loaded) = resolver.status().await;
            Some(ControlResponse::Status {
                sources,
                filemaps_loaded,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_wire_shapes() {
        let init: ControlRequest = serde_json::from_value(json!({
            "type": "init",
            "sources": [
                { "pathPrefix": "/models/", "cdnBase": "https://cdn.example.com/pkg", "progress": true },
                { "pathPrefix": "/local/", "localBase": "/srv/pkg", "manifest": "q4" }
            ]
        }))
        .unwrap();
        let ControlRequest::Init { sources } = init else {
            panic!("expected init");
        };
        assert_eq!(sources.len(), 2);
        let first = sources[0].clone().into_source().unwrap();
        assert_eq!(first.path_prefix(), "/models/");
        assert!(first.progress);
        let second = sources[1].clone().into_source().unwrap();
        assert_eq!(second.manifest.as_deref(), Some("q4"));

        let clear: ControlRequest = serde_json::from_value(json!({ "type": "clear-cache" })).unwrap();
        assert!(matches!(clear, ControlRequest::ClearCache));
    }

    #[test]
    fn spec_requires_exactly_one_base() {
        let both = SourceSpec {
            path_prefix: "/m/".into(),
            cdn_base: Some("https://cdn.example.com/".into()),
            local_base: Some("/srv/pkg".into()),
            manifest: None,
            progress: false,
        };
        assert!(both.into_source().is_err());

        let neither = SourceSpec {
            path_prefix: "/m/".into(),
            cdn_base: None,
            local_base: None,
            manifest: None,
            progress: false,
        };
        assert!(neither.into_source().is_err());
    }

    #[test]
    fn cache_cleared_tag() {
        let ack = serde_json::to_value(ControlResponse::CacheCleared).unwrap();
        assert_eq!(ack, json!({ "type": "cache-cleared" }));
    }
}
