//! In-memory doubles for the host-environment ports.
//!
//! Available under `cfg(test)` and the `testing` feature. The demo binary
//! uses them to simulate field frames and popups in one process.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;

use serde_json::{Map, Value};
use url::Url;

use securepay_shared::{FieldConfig, FieldType, MemberId};

use crate::error::TransportError;
use crate::ports::{
    AttachError, BrowsingContext, FieldHost, FormSource, ScreenGeometry, Scheduler, TimerId,
    TokenOutput, WindowHost,
};

// =============================================================================
// Browsing contexts
// =============================================================================

/// A remote context that records what was posted to it.
pub struct FakeContext {
    id: MemberId,
    posted: RefCell<Vec<(Value, String)>>,
    closed: Cell<bool>,
    close_calls: Cell<u32>,
    notifies_close: bool,
    on_close: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl FakeContext {
    pub fn new(id: &str) -> Rc<Self> {
        Self::build(id, false)
    }

    /// A context whose host can report closure without polling.
    pub fn with_close_notification(id: &str) -> Rc<Self> {
        Self::build(id, true)
    }

    fn build(id: &str, notifies_close: bool) -> Rc<Self> {
        Rc::new(Self {
            id: MemberId::new(id),
            posted: RefCell::new(Vec::new()),
            closed: Cell::new(false),
            close_calls: Cell::new(0),
            notifies_close,
            on_close: RefCell::new(None),
        })
    }

    /// Frames posted so far with their target origin.
    pub fn posted(&self) -> Vec<(Value, String)> {
        self.posted.borrow().clone()
    }

    /// Event names posted so far.
    pub fn posted_events(&self) -> Vec<String> {
        self.posted
            .borrow()
            .iter()
            .filter_map(|(frame, _)| frame["event"].as_str().map(String::from))
            .collect()
    }

    /// Number of times the owner asked this context to close.
    pub fn close_calls(&self) -> u32 {
        self.close_calls.get()
    }

    /// The user closes the window; no owner involvement.
    pub fn user_close(&self) {
        self.closed.set(true);
        let notify = self.on_close.borrow_mut().take();
        if let Some(notify) = notify {
            notify();
        }
    }
}

impl BrowsingContext for FakeContext {
    fn id(&self) -> MemberId {
        self.id.clone()
    }

    fn post_message(&self, frame: &Value, target_origin: &str) -> Result<(), TransportError> {
        if self.closed.get() {
            return Err(TransportError::Closed);
        }
        self.posted
            .borrow_mut()
            .push((frame.clone(), target_origin.to_string()));
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.get()
    }

    fn close(&self) {
        self.close_calls.set(self.close_calls.get() + 1);
        self.closed.set(true);
        self.on_close.borrow_mut().take();
    }

    fn on_close(&self, notify: Box<dyn FnOnce()>) -> bool {
        if !self.notifies_close {
            return false;
        }
        *self.on_close.borrow_mut() = Some(notify);
        true
    }
}

// =============================================================================
// Scheduler
// =============================================================================

enum TimerAction {
    Interval(u32, Box<dyn FnMut()>),
    Once(Box<dyn FnOnce()>),
}

struct Timer {
    due: u64,
    action: TimerAction,
}

/// Virtual clock; timers fire only when the test advances time.
#[derive(Default)]
pub struct ManualScheduler {
    now: Cell<u64>,
    next_id: Cell<u64>,
    timers: RefCell<BTreeMap<u64, Timer>>,
    /// Interval whose tick is currently running, and whether it cleared itself.
    running: Cell<Option<(u64, bool)>>,
    clears: Cell<usize>,
}

impl ManualScheduler {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn now(&self) -> u64 {
        self.now.get()
    }

    pub fn pending(&self) -> usize {
        self.timers.borrow().len()
    }

    /// Number of `clear` calls so far.
    pub fn clears(&self) -> usize {
        self.clears.get()
    }

    /// Advance the clock, firing every timer that comes due in order.
    pub fn advance(&self, ms: u64) {
        let target = self.now.get() + ms;
        loop {
            let next = {
                let timers = self.timers.borrow();
                timers
                    .iter()
                    .filter(|(_, timer)| timer.due <= target)
                    .min_by_key(|(id, timer)| (timer.due, **id))
                    .map(|(id, _)| *id)
            };
            let Some(id) = next else {
                break;
            };
            let Some(timer) = self.timers.borrow_mut().remove(&id) else {
                break;
            };
            self.now.set(timer.due);
            match timer.action {
                TimerAction::Once(fire) => fire(),
                TimerAction::Interval(period, mut tick) => {
                    self.running.set(Some((id, false)));
                    tick();
                    let cleared = self.running.take().is_some_and(|(_, cleared)| cleared);
                    if !cleared {
                        self.timers.borrow_mut().insert(
                            id,
                            Timer {
                                due: timer.due + u64::from(period.max(1)),
                                action: TimerAction::Interval(period, tick),
                            },
                        );
                    }
                }
            }
        }
        self.now.set(target);
    }

    fn schedule(&self, delay_ms: u32, action: TimerAction) -> TimerId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.timers.borrow_mut().insert(
            id,
            Timer {
                due: self.now.get() + u64::from(delay_ms),
                action,
            },
        );
        TimerId(id)
    }
}

impl Scheduler for ManualScheduler {
    fn set_interval(&self, period_ms: u32, tick: Box<dyn FnMut()>) -> TimerId {
        self.schedule(period_ms, TimerAction::Interval(period_ms, tick))
    }

    fn set_timeout(&self, delay_ms: u32, fire: Box<dyn FnOnce()>) -> TimerId {
        self.schedule(delay_ms, TimerAction::Once(fire))
    }

    fn clear(&self, timer: TimerId) {
        self.clears.set(self.clears.get() + 1);
        // A running interval is not in the map; remember to drop it.
        if self.timers.borrow_mut().remove(&timer.0).is_none()
            && self.running.get().is_some_and(|(id, _)| id == timer.0)
        {
            self.running.set(Some((timer.0, true)));
        }
    }
}

// =============================================================================
// Field host
// =============================================================================

/// A host document whose matching elements are a set of selectors.
#[derive(Default)]
pub struct FakeFieldHost {
    present: RefCell<HashSet<String>>,
    attached: RefCell<Vec<(FieldType, Rc<FakeContext>)>>,
}

impl FakeFieldHost {
    pub fn with_selectors(selectors: &[&str]) -> Rc<Self> {
        let host = Self::default();
        host.present
            .borrow_mut()
            .extend(selectors.iter().map(|s| s.to_string()));
        Rc::new(host)
    }

    pub fn insert_selector(&self, selector: &str) {
        self.present.borrow_mut().insert(selector.to_string());
    }

    /// The page re-rendered and dropped an element.
    pub fn remove_selector(&self, selector: &str) {
        self.present.borrow_mut().remove(selector);
    }

    /// Most recent context mounted for a field.
    pub fn context(&self, field: FieldType) -> Option<Rc<FakeContext>> {
        self.attached
            .borrow()
            .iter()
            .rev()
            .find(|(f, _)| *f == field)
            .map(|(_, ctx)| Rc::clone(ctx))
    }

    pub fn attach_count(&self) -> usize {
        self.attached.borrow().len()
    }
}

impl FieldHost for FakeFieldHost {
    fn attach(
        &self,
        field: FieldType,
        config: &FieldConfig,
    ) -> Result<Rc<dyn BrowsingContext>, AttachError> {
        if !self.present.borrow().contains(&config.selector) {
            return Err(AttachError::MissingTarget(config.selector.clone()));
        }
        let generation = self.attached.borrow().len();
        let context = FakeContext::new(&format!("securepay-{field}-{generation}"));
        self.attached
            .borrow_mut()
            .push((field, Rc::clone(&context)));
        Ok(context)
    }

    fn contains(&self, selector: &str) -> bool {
        self.present.borrow().contains(selector)
    }
}

// =============================================================================
// Window host
// =============================================================================

/// A popup opened through [`FakeWindowHost`].
pub struct OpenedPopup {
    pub url: Url,
    pub name: String,
    pub features: String,
    pub window: Rc<FakeContext>,
}

pub struct FakeWindowHost {
    direct_messaging: bool,
    notifies_close: bool,
    blocked: Cell<bool>,
    screen: ScreenGeometry,
    opened: RefCell<Vec<OpenedPopup>>,
    relays: RefCell<Vec<(String, Url)>>,
}

impl FakeWindowHost {
    /// A modern browser: popups post directly to their opener.
    pub fn direct() -> Rc<Self> {
        Rc::new(Self::build(true, false))
    }

    /// A legacy browser that needs the relay document.
    pub fn legacy() -> Rc<Self> {
        Rc::new(Self::build(false, false))
    }

    /// A host whose popups report their own closure.
    pub fn with_close_notification() -> Rc<Self> {
        Rc::new(Self::build(true, true))
    }

    fn build(direct_messaging: bool, notifies_close: bool) -> Self {
        Self {
            direct_messaging,
            notifies_close,
            blocked: Cell::new(false),
            screen: ScreenGeometry {
                width: 1450,
                height: 1035,
            },
            opened: RefCell::new(Vec::new()),
            relays: RefCell::new(Vec::new()),
        }
    }

    pub fn block_popups(&self) {
        self.blocked.set(true);
    }

    pub fn opened_count(&self) -> usize {
        self.opened.borrow().len()
    }

    pub fn with_popup<R>(&self, index: usize, f: impl FnOnce(&OpenedPopup) -> R) -> Option<R> {
        self.opened.borrow().get(index).map(f)
    }

    pub fn popup(&self, index: usize) -> Option<Rc<FakeContext>> {
        self.with_popup(index, |p| Rc::clone(&p.window))
    }

    /// Relay documents currently in the page.
    pub fn relays(&self) -> Vec<(String, Url)> {
        self.relays.borrow().clone()
    }
}

impl WindowHost for FakeWindowHost {
    fn screen(&self) -> ScreenGeometry {
        self.screen
    }

    fn supports_cross_window_messaging(&self) -> bool {
        self.direct_messaging
    }

    fn open_popup(
        &self,
        url: &Url,
        name: &str,
        features: &str,
    ) -> Result<Rc<dyn BrowsingContext>, TransportError> {
        if self.blocked.get() {
            return Err(TransportError::Blocked);
        }
        let window = if self.notifies_close {
            FakeContext::with_close_notification(name)
        } else {
            FakeContext::new(name)
        };
        self.opened.borrow_mut().push(OpenedPopup {
            url: url.clone(),
            name: name.to_string(),
            features: features.to_string(),
            window: Rc::clone(&window),
        });
        Ok(window)
    }

    fn insert_relay(&self, name: &str, url: &Url) -> Result<(), TransportError> {
        self.relays
            .borrow_mut()
            .push((name.to_string(), url.clone()));
        Ok(())
    }

    fn remove_relay(&self, name: &str) {
        self.relays.borrow_mut().retain(|(n, _)| n != name);
    }
}

// =============================================================================
// Forms
// =============================================================================

/// Hidden token input that remembers what was written.
#[derive(Default)]
pub struct RecordingTokenOutput {
    value: RefCell<Option<String>>,
}

impl RecordingTokenOutput {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn value(&self) -> Option<String> {
        self.value.borrow().clone()
    }
}

impl TokenOutput for RecordingTokenOutput {
    fn write(&self, token_id: &str) {
        *self.value.borrow_mut() = Some(token_id.to_string());
    }
}

/// A form with fixed values and an optional bound token output.
pub struct StaticForm {
    pub values: Map<String, Value>,
    pub output: Option<Rc<RecordingTokenOutput>>,
}

impl FormSource for StaticForm {
    fn values(&self) -> Map<String, Value> {
        self.values.clone()
    }

    fn token_output(&self) -> Option<Rc<dyn TokenOutput>> {
        self.output
            .as_ref()
            .map(|output| Rc::clone(output) as Rc<dyn TokenOutput>)
    }
}
