//! Browser implementations of the host-environment ports (wasm32 only).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use gloo_timers::callback::{Interval, Timeout};
use serde::Serialize;
use serde_json::Value;
use url::Url;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{Document, Element, HtmlIFrameElement, MessageEvent, Window};

use securepay_shared::{FieldConfig, FieldType, MemberId};

use crate::client::Client;
use crate::error::TransportError;
use crate::ports::{
    AttachError, BrowsingContext, FieldHost, ScreenGeometry, Scheduler, TimerId, WindowHost,
};

fn js_error(value: JsValue) -> String {
    value
        .as_string()
        .unwrap_or_else(|| format!("{value:?}"))
}

fn document() -> Option<Document> {
    web_sys::window().and_then(|w| w.document())
}

// =============================================================================
// Browsing contexts
// =============================================================================

enum Target {
    Frame(HtmlIFrameElement),
    Popup(Window),
}

/// A field iframe or popup window reachable with `postMessage`.
pub struct WasmContext {
    id: MemberId,
    target: Target,
}

impl WasmContext {
    fn window(&self) -> Option<Window> {
        match &self.target {
            Target::Frame(frame) => frame.content_window(),
            Target::Popup(window) => Some(window.clone()),
        }
    }
}

impl BrowsingContext for WasmContext {
    fn id(&self) -> MemberId {
        self.id.clone()
    }

    fn post_message(&self, frame: &Value, target_origin: &str) -> Result<(), TransportError> {
        let window = self.window().ok_or(TransportError::Closed)?;
        let data = frame
            .serialize(&serde_wasm_bindgen::Serializer::json_compatible())
            .map_err(|e| TransportError::Post(e.to_string()))?;
        window
            .post_message(&data, target_origin)
            .map_err(|e| TransportError::Post(js_error(e)))
    }

    fn is_closed(&self) -> bool {
        match &self.target {
            Target::Frame(frame) => !frame.is_connected(),
            Target::Popup(window) => window.closed().unwrap_or(true),
        }
    }

    fn close(&self) {
        match &self.target {
            Target::Frame(frame) => frame.remove(),
            Target::Popup(window) => {
                if let Err(e) = window.close() {
                    tracing::debug!(error = %js_error(e), "Popup close failed");
                }
            }
        }
    }
}

// =============================================================================
// Field host
// =============================================================================

/// Mounts secure field iframes served from the API.
pub struct WasmFieldHost {
    api: Url,
}

impl WasmFieldHost {
    pub fn new(api: Url) -> Self {
        Self { api }
    }

    fn field_url(&self, field: FieldType) -> Result<Url, AttachError> {
        let base = self.api.as_str().trim_end_matches('/');
        let mut url = Url::parse(&format!("{base}/hosted-field"))
            .map_err(|e| AttachError::Mount(e.to_string()))?;
        url.query_pairs_mut().append_pair("type", field.as_str());
        Ok(url)
    }
}

impl FieldHost for WasmFieldHost {
    fn attach(
        &self,
        field: FieldType,
        config: &FieldConfig,
    ) -> Result<Rc<dyn BrowsingContext>, AttachError> {
        let document = document().ok_or_else(|| AttachError::Mount("no document".into()))?;
        let container = document
            .query_selector(&config.selector)
            .map_err(|e| AttachError::Mount(js_error(e)))?
            .ok_or_else(|| AttachError::MissingTarget(config.selector.clone()))?;

        let frame: HtmlIFrameElement = document
            .create_element("iframe")
            .map_err(|e| AttachError::Mount(js_error(e)))?
            .dyn_into()
            .map_err(|_| AttachError::Mount("not an iframe".into()))?;
        let name = format!("securepay-{field}");
        frame.set_name(&name);
        frame.set_src(self.field_url(field)?.as_str());
        frame
            .set_attribute("style", "border:none;width:100%;height:100%")
            .map_err(|e| AttachError::Mount(js_error(e)))?;
        container
            .append_child(&frame)
            .map_err(|e| AttachError::Mount(js_error(e)))?;

        Ok(Rc::new(WasmContext {
            id: MemberId::new(name),
            target: Target::Frame(frame),
        }))
    }

    fn contains(&self, selector: &str) -> bool {
        document()
            .and_then(|d| d.query_selector(selector).ok().flatten())
            .is_some()
    }
}

// =============================================================================
// Window host
// =============================================================================

/// Popups and relay documents in the current window.
#[derive(Default)]
pub struct WasmWindowHost;

impl WasmWindowHost {
    fn relay_element(document: &Document, name: &str) -> Option<Element> {
        document
            .query_selector(&format!("iframe[name=\"{name}\"]"))
            .ok()
            .flatten()
    }
}

impl WindowHost for WasmWindowHost {
    fn screen(&self) -> ScreenGeometry {
        let screen = web_sys::window().and_then(|w| w.screen().ok());
        let dimension = |v: Result<i32, JsValue>| v.ok().and_then(|v| u32::try_from(v).ok());
        ScreenGeometry {
            width: screen
                .as_ref()
                .and_then(|s| dimension(s.width()))
                .unwrap_or(1024),
            height: screen
                .as_ref()
                .and_then(|s| dimension(s.height()))
                .unwrap_or(768),
        }
    }

    fn supports_cross_window_messaging(&self) -> bool {
        // Legacy Trident engines cannot post between top-level windows.
        let agent = web_sys::window()
            .and_then(|w| w.navigator().user_agent().ok())
            .unwrap_or_default();
        !(agent.contains("Trident") || agent.contains("MSIE"))
    }

    fn open_popup(
        &self,
        url: &Url,
        name: &str,
        features: &str,
    ) -> Result<Rc<dyn BrowsingContext>, TransportError> {
        let window = web_sys::window().ok_or(TransportError::Closed)?;
        let popup = window
            .open_with_url_and_target_and_features(url.as_str(), name, features)
            .map_err(|e| TransportError::Post(js_error(e)))?
            .ok_or(TransportError::Blocked)?;
        Ok(Rc::new(WasmContext {
            id: MemberId::new(name),
            target: Target::Popup(popup),
        }))
    }

    fn insert_relay(&self, name: &str, url: &Url) -> Result<(), TransportError> {
        let document = document().ok_or(TransportError::Closed)?;
        let body = document.body().ok_or(TransportError::Closed)?;
        let frame: HtmlIFrameElement = document
            .create_element("iframe")
            .map_err(|e| TransportError::Post(js_error(e)))?
            .dyn_into()
            .map_err(|_| TransportError::Post("not an iframe".into()))?;
        frame.set_name(name);
        frame.set_src(url.as_str());
        frame
            .set_attribute("style", "display:none")
            .map_err(|e| TransportError::Post(js_error(e)))?;
        body.append_child(&frame)
            .map_err(|e| TransportError::Post(js_error(e)))?;
        Ok(())
    }

    fn remove_relay(&self, name: &str) {
        if let Some(relay) = document().and_then(|d| Self::relay_element(&d, name)) {
            relay.remove();
        }
    }
}

// =============================================================================
// Scheduler
// =============================================================================

enum Timer {
    Interval(Interval),
    Timeout(Timeout),
}

/// `setInterval` / `setTimeout` through gloo-timers.
#[derive(Default)]
pub struct WasmScheduler {
    next_id: Cell<u64>,
    timers: RefCell<HashMap<u64, Timer>>,
}

impl WasmScheduler {
    fn next(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }
}

impl Scheduler for WasmScheduler {
    fn set_interval(&self, period_ms: u32, mut tick: Box<dyn FnMut()>) -> TimerId {
        let id = self.next();
        let interval = Interval::new(period_ms, move || tick());
        self.timers
            .borrow_mut()
            .insert(id, Timer::Interval(interval));
        TimerId(id)
    }

    fn set_timeout(&self, delay_ms: u32, fire: Box<dyn FnOnce()>) -> TimerId {
        let id = self.next();
        // Fired timeouts stay registered until cleared; dropping one from its
        // own callback would free the running closure.
        let timeout = Timeout::new(delay_ms, fire);
        self.timers
            .borrow_mut()
            .insert(id, Timer::Timeout(timeout));
        TimerId(id)
    }

    fn clear(&self, timer: TimerId) {
        let removed = self.timers.borrow_mut().remove(&timer.0);
        // Intervals are usually cleared from their own tick, so the closure
        // is leaked and only the browser handle is released.
        let (handle, interval) = match removed {
            Some(Timer::Interval(interval)) => (interval.forget(), true),
            Some(Timer::Timeout(timeout)) => (timeout.forget(), false),
            None => return,
        };
        let (Some(window), Some(handle)) = (web_sys::window(), handle.as_f64()) else {
            return;
        };
        if interval {
            window.clear_interval_with_handle(handle as i32);
        } else {
            window.clear_timeout_with_handle(handle as i32);
        }
    }
}

// =============================================================================
// Inbound messages
// =============================================================================

/// Forwards `message` events on the current window into a client. Removing
/// the listener happens on drop.
pub struct MessageListener {
    window: Window,
    closure: Closure<dyn FnMut(MessageEvent)>,
}

/// Route every `postMessage` delivered to this window into `client`.
pub fn listen(client: Rc<Client>) -> Result<MessageListener, TransportError> {
    let window = web_sys::window().ok_or(TransportError::Closed)?;
    let closure = Closure::<dyn FnMut(_)>::new(move |event: MessageEvent| {
        let data = match serde_wasm_bindgen::from_value::<Value>(event.data()) {
            Ok(data) => data,
            Err(e) => {
                tracing::debug!(error = %e, "Unreadable message event ignored");
                return;
            }
        };
        if let Err(e) = client.receive(&event.origin(), &data) {
            tracing::debug!(error = %e, "Message event rejected");
        }
    });
    window
        .add_event_listener_with_callback("message", closure.as_ref().unchecked_ref())
        .map_err(|e| TransportError::Post(js_error(e)))?;
    Ok(MessageListener { window, closure })
}

impl Drop for MessageListener {
    fn drop(&mut self) {
        let _ = self
            .window
            .remove_event_listener_with_callback("message", self.closure.as_ref().unchecked_ref());
    }
}
