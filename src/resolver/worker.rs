//! The in-browser installation: a service worker.
//!
//! The worker registers itself on the global scope, offers every fetch to
//! the shared matcher and answers matched requests with a response whose
//! body is wholly owned by the worker. Rebuilding the response (instead of
//! passing any upstream `Response` through) keeps the embedding document
//! cross-origin isolated. Control messages arrive over `postMessage`;
//! progress events and replies are posted to every window client.

use std::{cell::RefCell, rc::Rc};

use bytes::Bytes;
use futures::StreamExt as _;
use js_sys::{Object, Promise, Reflect, Uint8Array};
use wasm_bindgen::{JsCast as _, prelude::*};
use wasm_bindgen_futures::{JsFuture, future_to_promise, spawn_local};
use web_sys::{
    FetchEvent, Headers, MessageEvent, ReadableStream, ReadableStreamDefaultController, Response,
    ResponseInit, ServiceWorkerGlobalScope,
};

use crate::{
    error::StoreError,
    resolver::{Body, ControlRequest, ControlResponse, Payload, Resolver, handle_control},
    utils::BoxStream,
};

#[wasm_bindgen]
pub struct ResolverWorker {
    resolver: Resolver,
}

impl Default for ResolverWorker {
    fn default() -> Self {
        Self::new()
    }
}

#[wasm_bindgen]
impl ResolverWorker {
    #[wasm_bindgen(constructor)]
    pub fn new() -> ResolverWorker {
        ResolverWorker {
            resolver: Resolver::new(),
        }
    }

    /// Attach `fetch` and `message` listeners to the service worker global
    /// scope and start the progress pump. Call once from the worker script.
    pub fn register(&self) -> Result<(), JsValue> {
        let scope: ServiceWorkerGlobalScope = js_sys::global().dyn_into()?;

        self.register_fetch(&scope)?;
        self.register_message(&scope)?;
        self.pump_progress(&scope);
        Ok(())
    }

    fn register_fetch(&self, scope: &ServiceWorkerGlobalScope) -> Result<(), JsValue> {
        let resolver = self.resolver.clone();
        let scope_for_fetch = scope.clone();
        let on_fetch = Closure::<dyn FnMut(FetchEvent)>::new(move |event: FetchEvent| {
            let request = event.request();
            let url = request.url();
            let range = request.headers().get("Range").ok().flatten();
            let resolver = resolver.clone();
            let scope = scope_for_fetch.clone();
            let promise = future_to_promise(async move {
                let path = path_of(&url);
                match resolver.handle(&path, range.as_deref()).await {
                    Some(payload) => payload_into_response(payload),
                    // Not ours: go to the network untouched.
                    None => JsFuture::from(scope.fetch_with_request(&request)).await,
                }
            });
            if let Err(e) = event.respond_with(&promise) {
                crate::warn!("respond_with failed: {e:?}");
            }
        });
        scope.add_event_listener_with_callback("fetch", on_fetch.as_ref().unchecked_ref())?;
        on_fetch.forget();
        Ok(())
    }

    fn register_message(&self, scope: &ServiceWorkerGlobalScope) -> Result<(), JsValue> {
        let resolver = self.resolver.clone();
        let scope_for_message = scope.clone();
        let on_message = Closure::<dyn FnMut(MessageEvent)>::new(move |event: MessageEvent| {
            let Some(text) = event.data().as_string() else {
                return;
            };
            let request = match serde_json::from_str::<ControlRequest>(&text) {
                Ok(request) => request,
                Err(e) => {
                    crate::warn!("unrecognized control message: {e}");
                    return;
                }
            };
            let resolver = resolver.clone();
            let scope = scope_for_message.clone();
            spawn_local(async move {
                if let Some(response) = handle_control(&resolver, request).await {
                    post_to_clients(&scope, &response).await;
                }
            });
        });
        scope.add_event_listener_with_callback("message", on_message.as_ref().unchecked_ref())?;
        on_message.forget();
        Ok(())
    }

    fn pump_progress(&self, scope: &ServiceWorkerGlobalScope) {
        let mut rx = self.resolver.progress().subscribe();
        let scope = scope.clone();
        spawn_local(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        post_to_clients(&scope, &ControlResponse::Progress(event)).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

fn path_of(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => parsed.path().to_owned(),
        Err(_) => url.split(['?', '#']).next().unwrap_or(url).to_owned(),
    }
}

async fn post_to_clients(scope: &ServiceWorkerGlobalScope, message: &ControlResponse) {
    let Ok(text) = serde_json::to_string(message) else {
        return;
    };
    let Ok(list) = JsFuture::from(scope.clients().match_all()).await else {
        return;
    };
    let array: js_sys::Array = list.unchecked_into();
    for client in array.iter() {
        let client: web_sys::Client = client.unchecked_into();
        if let Err(e) = client.post_message(&JsValue::from_str(&text)) {
            crate::warn!("postMessage failed: {e:?}");
        }
    }
}

/// Convert a payload into a fresh, same-origin `Response` whose body the
/// worker owns.
fn payload_into_response(payload: Payload) -> Result<JsValue, JsValue> {
    let headers = Headers::new()?;
    for (name, value) in &payload.headers {
        headers.append(name, value)?;
    }
    let init = ResponseInit::new();
    init.set_status(payload.status);
    init.set_headers(headers.as_ref());

    let response = match payload.body {
        Body::Empty => Response::new_with_opt_str_and_init(None, &init)?,
        Body::Full(bytes) => {
            let mut body = bytes.to_vec();
            Response::new_with_opt_u8_array_and_init(Some(&mut body[..]), &init)?
        }
        Body::Stream(stream) => {
            let readable = readable_stream_from(stream)?;
            Response::new_with_opt_readable_stream_and_init(Some(&readable), &init)?
        }
    };
    Ok(response.into())
}

/// Bridge a Rust byte stream into a browser `ReadableStream`. The streams
/// spec serializes `pull` calls, so the inner stream is polled one chunk at
/// a time.
fn readable_stream_from(
    stream: BoxStream<'static, Result<Bytes, StoreError>>,
) -> Result<ReadableStream, JsValue> {
    let stream = Rc::new(RefCell::new(stream));
    let pull = Closure::<dyn FnMut(ReadableStreamDefaultController) -> Promise>::new(
        move |controller: ReadableStreamDefaultController| {
            let stream = stream.clone();
            future_to_promise(async move {
                let next = stream.borrow_mut().next().await;
                match next {
                    Some(Ok(bytes)) => {
                        let chunk = Uint8Array::from(bytes.as_ref());
                        controller.enqueue_with_chunk(&chunk.into())?;
                    }
                    Some(Err(e)) => {
                        controller.error_with_e(&JsValue::from_str(&e.to_string()));
                    }
                    None => {
                        controller.close()?;
                    }
                }
                Ok(JsValue::UNDEFINED)
            })
        },
    );

    let source = Object::new();
    Reflect::set(&source, &JsValue::from_str("pull"), pull.as_ref())?;
    pull.forget();
    ReadableStream::new_with_underlying_source(&source)
}
