//! Popup request/response transactions.
//!
//! A `FrameTransaction` opens one popup window against the API, waits for the
//! popup to report back through a completion event named for this
//! transaction, and cleans up afterwards. Browsers that cannot post between
//! windows get an invisible same-origin relay document first; the popup is
//! only opened once the relay announces itself.
//!
//! The owner hears exactly one of `Done`, `Error` or `Close`.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use serde_json::{Map, Value};
use url::Url;

use securepay_shared::{ErrorPayload, EventKind, FrameEventName, FrameId, MemberId, Message};

use crate::bus::{BusHandle, Member};
use crate::config::{ClientConfig, CLIENT_VERSION};
use crate::error::FrameError;
use crate::ports::{BrowsingContext, Scheduler, TimerId, WindowHost};

pub const DEFAULT_WIDTH: u32 = 450;
pub const DEFAULT_HEIGHT: u32 = 535;

/// Closed-window poll period when the host cannot notify.
pub const CLOSE_POLL_MS: u32 = 1000;

/// Terminal outcome reported to the owner.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    Done(Value),
    Error(FrameError),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Preparing,
    /// Waiting for the relay document before opening the popup.
    AwaitingRelay,
    Open,
    Completed,
    Closed,
    Destroyed,
}

/// What to open and how large.
#[derive(Debug, Clone)]
pub struct FrameOptions {
    pub path: String,
    pub payload: Map<String, Value>,
    pub width: u32,
    pub height: u32,
}

impl FrameOptions {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            payload: Map::new(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        }
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }
}

/// Collaborators a transaction needs.
#[derive(Clone)]
pub struct FrameDeps {
    pub bus: BusHandle,
    pub window_host: Rc<dyn WindowHost>,
    pub scheduler: Rc<dyn Scheduler>,
}

type Listener = Box<dyn FnOnce(FrameEvent)>;

struct FrameState {
    status: FrameStatus,
    window: Option<Rc<dyn BrowsingContext>>,
    relay_inserted: bool,
    poll: Option<TimerId>,
    listener: Option<Listener>,
}

struct Shared {
    id: FrameId,
    member_id: MemberId,
    completion: FrameEventName,
    deps: FrameDeps,
    url: Url,
    relay: Option<(String, Url)>,
    popup_name: String,
    features: String,
    state: RefCell<FrameState>,
}

/// One popup round trip.
pub struct FrameTransaction {
    shared: Rc<Shared>,
}

impl FrameTransaction {
    /// Compute the popup URL and start listening for the completion event.
    pub fn prepare(
        deps: FrameDeps,
        owner: &MemberId,
        config: &ClientConfig,
        options: FrameOptions,
        listener: impl FnOnce(FrameEvent) + 'static,
    ) -> Result<Self, FrameError> {
        let id = FrameId::new();
        let completion = FrameEventName::new(owner, &id);

        let mut url = config
            .api_url(&options.path)
            .map_err(|e| FrameError::new("invalid_url", e.to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("version", CLIENT_VERSION)
                .append_pair("event", completion.as_str())
                .append_pair("key", &config.public_key);
            let mut pairs = Vec::new();
            flatten_query(&mut pairs, "", &Value::Object(options.payload.clone()));
            for (key, value) in &pairs {
                query.append_pair(key, value);
            }
        }

        let relay = if deps.window_host.supports_cross_window_messaging() {
            None
        } else {
            let mut relay_url = config
                .api_url("relay")
                .map_err(|e| FrameError::new("invalid_url", e.to_string()))?;
            relay_url
                .query_pairs_mut()
                .append_pair("event", &EventKind::RelayLoaded(id).to_string());
            Some((format!("securepay-relay-{owner}-{id}"), relay_url))
        };

        let features = window_features(&*deps.window_host, options.width, options.height);
        let shared = Rc::new(Shared {
            id,
            member_id: MemberId::new(format!("securepay-frame-{id}")),
            completion,
            url,
            relay,
            popup_name: format!("securepay-popup-{id}"),
            features,
            deps,
            state: RefCell::new(FrameState {
                status: FrameStatus::Preparing,
                window: None,
                relay_inserted: false,
                poll: None,
                listener: Some(Box::new(listener)),
            }),
        });

        shared.deps.bus.add(member(&shared));
        tracing::debug!(frame = %id, url = %shared.url, "Frame transaction prepared");
        Ok(Self { shared })
    }

    pub fn id(&self) -> FrameId {
        self.shared.id
    }

    pub fn member_id(&self) -> &MemberId {
        &self.shared.member_id
    }

    /// Event name the popup must emit to complete this transaction.
    pub fn completion_event(&self) -> &FrameEventName {
        &self.shared.completion
    }

    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    pub fn features(&self) -> &str {
        &self.shared.features
    }

    pub fn status(&self) -> FrameStatus {
        self.shared.state.borrow().status
    }

    pub fn has_window(&self) -> bool {
        self.shared.state.borrow().window.is_some()
    }

    /// Open the popup, going through the relay document when needed.
    pub fn open(&self) {
        let shared = &self.shared;
        if shared.state.borrow().status != FrameStatus::Preparing {
            return;
        }
        match &shared.relay {
            None => shared.open_popup(),
            Some((name, url)) => {
                shared.state.borrow_mut().status = FrameStatus::AwaitingRelay;
                match shared.deps.window_host.insert_relay(name, url) {
                    Ok(()) => {
                        shared.state.borrow_mut().relay_inserted = true;
                        tracing::debug!(frame = %shared.id, relay = %name, "Waiting for relay document");
                    }
                    Err(e) => shared.fail(FrameError::new("relay_failed", e.to_string())),
                }
            }
        }
    }

    /// Stop listening, close the popup and remove the relay. Idempotent.
    pub fn destroy(&self) {
        self.shared.destroy();
    }
}

fn route(shared: &Rc<Shared>, handler: fn(&Rc<Shared>, &Message)) -> impl Fn(&Message) + 'static {
    let weak: Weak<Shared> = Rc::downgrade(shared);
    move |message| {
        if let Some(shared) = weak.upgrade() {
            handler(&shared, message);
        }
    }
}

fn member(shared: &Rc<Shared>) -> Member {
    Member::new(shared.member_id.clone())
        .on(
            EventKind::FrameDone(shared.completion.clone()),
            route(shared, |s, m| s.complete(m)),
        )
        .on(
            EventKind::RelayLoaded(shared.id),
            route(shared, |s, _| s.relay_loaded()),
        )
        .on(EventKind::Destroy, route(shared, |s, _| s.destroy()))
}

impl Shared {
    fn relay_loaded(self: &Rc<Self>) {
        if self.state.borrow().status != FrameStatus::AwaitingRelay {
            return;
        }
        tracing::debug!(frame = %self.id, "Relay document loaded");
        self.open_popup();
    }

    fn open_popup(self: &Rc<Self>) {
        let opened = self
            .deps
            .window_host
            .open_popup(&self.url, &self.popup_name, &self.features);
        let window = match opened {
            Ok(window) => window,
            Err(e) => {
                tracing::warn!(frame = %self.id, error = %e, "Popup could not be opened");
                self.fail(FrameError::new("popup_blocked", e.to_string()));
                return;
            }
        };

        {
            let mut state = self.state.borrow_mut();
            state.status = FrameStatus::Open;
            state.window = Some(Rc::clone(&window));
        }
        self.deps.bus.add_remote(Rc::clone(&window));
        tracing::info!(frame = %self.id, "Popup opened");
        self.watch_close(&window);
    }

    fn watch_close(self: &Rc<Self>, window: &Rc<dyn BrowsingContext>) {
        let weak = Rc::downgrade(self);
        let notified = window.on_close(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.closed();
            }
        }));
        if notified {
            return;
        }

        let weak = Rc::downgrade(self);
        let timer = self.deps.scheduler.set_interval(
            CLOSE_POLL_MS,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.poll_closed();
                }
            }),
        );
        self.state.borrow_mut().poll = Some(timer);
    }

    fn poll_closed(&self) {
        let closed = self
            .state
            .borrow()
            .window
            .as_ref()
            .is_some_and(|w| w.is_closed());
        if closed {
            self.closed();
        }
    }

    fn closed(&self) {
        {
            let mut state = self.state.borrow_mut();
            if state.status != FrameStatus::Open {
                return;
            }
            state.status = FrameStatus::Closed;
        }
        tracing::info!(frame = %self.id, "Popup closed before completing");
        self.emit(FrameEvent::Close);
        self.destroy();
    }

    fn complete(&self, message: &Message) {
        {
            let mut state = self.state.borrow_mut();
            if state.status != FrameStatus::Open {
                tracing::debug!(frame = %self.id, status = ?state.status, "Late frame completion dropped");
                return;
            }
            state.status = FrameStatus::Completed;
        }

        let error = message
            .body
            .get("error")
            .or_else(|| message.body.get("err"))
            .filter(|e| !e.is_null())
            .cloned();
        let event = match error {
            Some(error) => {
                let payload = serde_json::from_value::<ErrorPayload>(error.clone())
                    .unwrap_or_else(|_| ErrorPayload::new("frame_error", error.to_string()));
                FrameEvent::Error(payload.into())
            }
            None => FrameEvent::Done(message.body.clone()),
        };
        tracing::info!(frame = %self.id, ok = matches!(event, FrameEvent::Done(_)), "Frame transaction completed");
        self.emit(event);
        self.destroy();
    }

    fn fail(&self, error: FrameError) {
        self.emit(FrameEvent::Error(error));
        self.destroy();
    }

    fn emit(&self, event: FrameEvent) {
        let listener = self.state.borrow_mut().listener.take();
        if let Some(listener) = listener {
            listener(event);
        }
    }

    fn destroy(&self) {
        let (window, poll, relay_inserted) = {
            let mut state = self.state.borrow_mut();
            if state.status == FrameStatus::Destroyed {
                return;
            }
            state.status = FrameStatus::Destroyed;
            state.listener = None;
            let relay_inserted = std::mem::take(&mut state.relay_inserted);
            (state.window.take(), state.poll.take(), relay_inserted)
        };

        if let Some(timer) = poll {
            self.deps.scheduler.clear(timer);
        }
        self.deps.bus.remove(&self.member_id);
        if let Some(window) = window {
            self.deps.bus.remove(&window.id());
            if !window.is_closed() {
                window.close();
            }
        }
        if relay_inserted {
            if let Some((name, _)) = &self.relay {
                self.deps.window_host.remove_relay(name);
            }
        }
        tracing::debug!(frame = %self.id, "Frame transaction destroyed");
    }
}

/// Popup features string, centred on the opener's screen.
fn window_features(host: &dyn WindowHost, width: u32, height: u32) -> String {
    let screen = host.screen();
    let top = screen.height.saturating_sub(height) / 2;
    let left = screen.width.saturating_sub(width) / 2;
    format!("resizable,scrollbars,width={width},height={height},top={top},left={left}")
}

/// Flatten a JSON value into query pairs using bracket notation.
fn flatten_query(pairs: &mut Vec<(String, String)>, prefix: &str, value: &Value) {
    match value {
        Value::Object(map) => {
            for (key, value) in map {
                let key = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}[{key}]")
                };
                flatten_query(pairs, &key, value);
            }
        }
        Value::Array(items) => {
            let key = format!("{prefix}[]");
            for item in items {
                flatten_query(pairs, &key, item);
            }
        }
        Value::String(s) => pairs.push((prefix.to_string(), s.clone())),
        Value::Null => pairs.push((prefix.to_string(), String::new())),
        other => pairs.push((prefix.to_string(), other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::config::Origin;
    use crate::testing::{FakeWindowHost, ManualScheduler};
    use serde_json::json;

    const ORIGIN: &str = "https://api.securepay.dev";

    struct Harness {
        bus: Bus,
        windows: Rc<FakeWindowHost>,
        scheduler: Rc<ManualScheduler>,
        events: Rc<RefCell<Vec<FrameEvent>>>,
    }

    impl Harness {
        fn new(windows: Rc<FakeWindowHost>) -> Self {
            Self {
                bus: Bus::new(Origin::from_api(ORIGIN).unwrap()),
                windows,
                scheduler: ManualScheduler::new(),
                events: Rc::new(RefCell::new(Vec::new())),
            }
        }

        fn prepare(&self, options: FrameOptions) -> FrameTransaction {
            let deps = FrameDeps {
                bus: self.bus.handle(),
                window_host: self.windows.clone(),
                scheduler: self.scheduler.clone(),
            };
            let sink = Rc::clone(&self.events);
            FrameTransaction::prepare(
                deps,
                &MemberId::new("client"),
                &ClientConfig::new("pk_test").with_api("https://api.securepay.dev/js/v1"),
                options,
                move |event| sink.borrow_mut().push(event),
            )
            .unwrap()
        }

        fn reply(&self, event: &str, body: Value) {
            self.bus
                .handle()
                .receive(ORIGIN, &json!({ "event": event, "body": body }))
                .unwrap();
        }

        fn events(&self) -> Vec<FrameEvent> {
            self.events.borrow().clone()
        }
    }

    fn query(url: &Url) -> Vec<(String, String)> {
        url.query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[test]
    fn url_carries_version_event_key_and_flattened_payload() {
        let h = Harness::new(FakeWindowHost::direct());
        let payload = json!({ "amount": 1000, "order": { "id": "o_1" }, "items": ["a", "b"] });
        let frame = h.prepare(
            FrameOptions::new("wallet/start").with_payload(payload.as_object().unwrap().clone()),
        );

        assert_eq!(frame.url().path(), "/js/v1/wallet/start");
        let pairs = query(frame.url());
        assert_eq!(pairs[0], ("version".into(), CLIENT_VERSION.into()));
        assert_eq!(
            pairs[1],
            ("event".into(), frame.completion_event().to_string())
        );
        assert_eq!(pairs[2], ("key".into(), "pk_test".into()));
        assert!(pairs.contains(&("amount".into(), "1000".into())));
        assert!(pairs.contains(&("order[id]".into(), "o_1".into())));
        assert!(pairs.contains(&("items[]".into(), "a".into())));
        assert!(pairs.contains(&("items[]".into(), "b".into())));
        assert!(frame
            .completion_event()
            .as_str()
            .starts_with("securepay-frame-client-"));
    }

    #[test]
    fn popup_is_centred_on_the_screen() {
        let h = Harness::new(FakeWindowHost::direct());
        let frame = h.prepare(FrameOptions::new("wallet"));
        assert_eq!(
            frame.features(),
            "resizable,scrollbars,width=450,height=535,top=250,left=500"
        );

        let big = h.prepare(FrameOptions::new("wallet").with_size(2000, 2000));
        assert!(big.features().ends_with("top=0,left=0"));
    }

    #[test]
    fn completion_delivers_done_once_and_cleans_up() {
        let h = Harness::new(FakeWindowHost::direct());
        let frame = h.prepare(FrameOptions::new("wallet"));
        frame.open();
        assert_eq!(frame.status(), FrameStatus::Open);
        let popup = h.windows.popup(0).unwrap();
        assert!(h.bus.handle().contains(&popup.id()));

        let name = frame.completion_event().to_string();
        h.reply(&name, json!({ "result": { "approved": true } }));
        h.reply(&name, json!({ "result": { "approved": false } }));

        assert_eq!(
            h.events(),
            vec![FrameEvent::Done(json!({ "result": { "approved": true } }))]
        );
        assert_eq!(frame.status(), FrameStatus::Destroyed);
        assert!(!frame.has_window());
        assert_eq!(popup.close_calls(), 1);
        assert!(!h.bus.handle().contains(frame.member_id()));
        assert_eq!(h.scheduler.pending(), 0);
    }

    #[test]
    fn error_payload_becomes_error_event() {
        let h = Harness::new(FakeWindowHost::direct());
        let frame = h.prepare(FrameOptions::new("wallet"));
        frame.open();

        h.reply(
            frame.completion_event().as_str(),
            json!({ "error": { "code": "declined", "message": "card declined" } }),
        );

        assert_eq!(
            h.events(),
            vec![FrameEvent::Error(FrameError::new("declined", "card declined"))]
        );
    }

    #[test]
    fn other_transactions_completion_is_not_ours() {
        let h = Harness::new(FakeWindowHost::direct());
        let first = h.prepare(FrameOptions::new("wallet"));
        let second = h.prepare(FrameOptions::new("wallet"));
        first.open();
        second.open();

        h.reply(second.completion_event().as_str(), json!({}));

        assert_eq!(first.status(), FrameStatus::Open);
        assert_eq!(second.status(), FrameStatus::Destroyed);
        assert_eq!(h.events().len(), 1);
    }

    #[test]
    fn manual_close_is_detected_by_polling_once() {
        let h = Harness::new(FakeWindowHost::direct());
        let frame = h.prepare(FrameOptions::new("wallet"));
        frame.open();
        let popup = h.windows.popup(0).unwrap();

        h.scheduler.advance(u64::from(CLOSE_POLL_MS) * 3);
        assert!(h.events().is_empty());

        popup.user_close();
        h.scheduler.advance(u64::from(CLOSE_POLL_MS));
        h.scheduler.advance(u64::from(CLOSE_POLL_MS) * 5);

        assert_eq!(h.events(), vec![FrameEvent::Close]);
        assert_eq!(frame.status(), FrameStatus::Destroyed);
        assert!(!frame.has_window());
        assert_eq!(h.scheduler.pending(), 0);
        assert_eq!(popup.close_calls(), 0);
    }

    #[test]
    fn close_notification_replaces_polling() {
        let h = Harness::new(FakeWindowHost::with_close_notification());
        let frame = h.prepare(FrameOptions::new("wallet"));
        frame.open();
        assert_eq!(h.scheduler.pending(), 0);

        h.windows.popup(0).unwrap().user_close();

        assert_eq!(h.events(), vec![FrameEvent::Close]);
        assert_eq!(frame.status(), FrameStatus::Destroyed);
    }

    #[test]
    fn legacy_browsers_open_after_the_relay_loads() {
        let h = Harness::new(FakeWindowHost::legacy());
        let frame = h.prepare(FrameOptions::new("wallet"));
        frame.open();

        assert_eq!(frame.status(), FrameStatus::AwaitingRelay);
        assert_eq!(h.windows.opened_count(), 0);
        let relays = h.windows.relays();
        assert_eq!(relays.len(), 1);
        assert_eq!(relays[0].0, format!("securepay-relay-client-{}", frame.id()));
        assert_eq!(relays[0].1.path(), "/js/v1/relay");
        assert_eq!(
            query(&relays[0].1),
            vec![("event".to_string(), format!("relay:{}", frame.id()))]
        );

        h.reply(&format!("relay:{}", frame.id()), json!({}));
        assert_eq!(frame.status(), FrameStatus::Open);
        assert_eq!(h.windows.opened_count(), 1);

        h.reply(frame.completion_event().as_str(), json!({ "ok": 1 }));
        assert!(h.windows.relays().is_empty());
    }

    #[test]
    fn blocked_popup_reports_error_and_destroys() {
        let h = Harness::new(FakeWindowHost::direct());
        h.windows.block_popups();
        let frame = h.prepare(FrameOptions::new("wallet"));
        frame.open();

        match h.events().as_slice() {
            [FrameEvent::Error(e)] => assert_eq!(e.code, "popup_blocked"),
            other => panic!("unexpected events: {other:?}"),
        }
        assert_eq!(frame.status(), FrameStatus::Destroyed);
    }

    #[test]
    fn destroy_is_silent_and_idempotent() {
        let h = Harness::new(FakeWindowHost::legacy());
        let frame = h.prepare(FrameOptions::new("wallet"));
        frame.open();
        h.reply(&format!("relay:{}", frame.id()), json!({}));
        let popup = h.windows.popup(0).unwrap();

        frame.destroy();
        frame.destroy();

        assert!(h.events().is_empty());
        assert_eq!(popup.close_calls(), 1);
        assert!(h.windows.relays().is_empty());
        assert_eq!(h.scheduler.pending(), 0);

        h.reply(frame.completion_event().as_str(), json!({}));
        assert!(h.events().is_empty());
    }

    #[test]
    fn bus_destroy_destroys_the_transaction() {
        let h = Harness::new(FakeWindowHost::direct());
        let frame = h.prepare(FrameOptions::new("wallet"));
        frame.open();

        h.bus.destroy();

        assert_eq!(frame.status(), FrameStatus::Destroyed);
        assert!(h.windows.popup(0).unwrap().is_closed());
    }
}
