//! Role-addressed message bus spanning browsing contexts.
//!
//! The Bus delivers messages to:
//! - **Local members**: objects in this context, each exposing an
//!   event-to-handler routing table and an optional fallback receiver.
//! - **Remote contexts**: field frames and popups, reached by posting a
//!   structured frame restricted to the configured API origin.
//!
//! Frames arriving from other contexts enter through [`BusHandle::receive`],
//! are checked against the same origin, and are dispatched to local members
//! only. Lifecycle events owned by this context (`destroy`, the aggregate
//! field signals) are refused there.
//!
//! Dispatch is run-to-completion: a message sent while a handler is running is
//! queued and delivered after the current message has reached every target.
//!
//! # Ownership
//!
//! [`Bus`] is the owning half and the only one that can `destroy`. Members
//! receive a [`BusHandle`], which holds a weak reference and becomes a no-op
//! once the Bus is destroyed or dropped.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use serde::Serialize;
use serde_json::Value;

use securepay_shared::{decode_frame, encode_structured, EventKind, MemberId, Message};

use crate::config::Origin;
use crate::ports::BrowsingContext;

/// Handler invoked with each delivered message.
pub type Handler = Rc<dyn Fn(&Message)>;

/// A local bus member: identity plus routing table.
pub struct Member {
    id: MemberId,
    routes: HashMap<EventKind, Handler>,
    fallback: Option<Handler>,
}

impl Member {
    pub fn new(id: MemberId) -> Self {
        Self {
            id,
            routes: HashMap::new(),
            fallback: None,
        }
    }

    /// Route one exact event name to a handler.
    pub fn on(mut self, kind: EventKind, handler: impl Fn(&Message) + 'static) -> Self {
        self.routes.insert(kind, Rc::new(handler));
        self
    }

    /// Receive every message not matched by a route.
    pub fn fallback(mut self, handler: impl Fn(&Message) + 'static) -> Self {
        self.fallback = Some(Rc::new(handler));
        self
    }

    pub fn id(&self) -> &MemberId {
        &self.id
    }

    fn handler_for(&self, kind: &EventKind) -> Option<Handler> {
        self.routes
            .get(kind)
            .or(self.fallback.as_ref())
            .map(Rc::clone)
    }
}

enum Recipient {
    Local(Member),
    Remote(Rc<dyn BrowsingContext>),
}

struct Registration {
    id: MemberId,
    generation: u64,
    recipient: Recipient,
}

#[derive(Clone)]
enum Target {
    Local(Handler),
    Remote(Rc<dyn BrowsingContext>),
}

enum Audience {
    /// Every matching local member and every remote context.
    All { exclude: Vec<MemberId> },
    /// Local members only (frames received from another context).
    Local,
    /// One member only.
    Only(MemberId),
}

struct Envelope {
    message: Message,
    audience: Audience,
}

struct BusInner {
    origin: Origin,
    registrations: Vec<Registration>,
    queue: VecDeque<Envelope>,
    next_generation: u64,
    dispatching: bool,
    destroyed: bool,
}

impl BusInner {
    fn is_current(&self, id: &MemberId, generation: u64) -> bool {
        self.registrations
            .iter()
            .any(|r| &r.id == id && r.generation == generation)
    }

    fn targets(&self, envelope: &Envelope) -> Vec<(MemberId, u64, Target)> {
        let kind = &envelope.message.event;
        self.registrations
            .iter()
            .filter(|r| match &envelope.audience {
                Audience::All { exclude } => !exclude.contains(&r.id),
                Audience::Local => matches!(r.recipient, Recipient::Local(_)),
                Audience::Only(id) => &r.id == id,
            })
            .filter_map(|r| {
                let target = match &r.recipient {
                    Recipient::Local(member) => Target::Local(member.handler_for(kind)?),
                    Recipient::Remote(context) => Target::Remote(Rc::clone(context)),
                };
                Some((r.id.clone(), r.generation, target))
            })
            .collect()
    }

    fn register(&mut self, id: MemberId, recipient: Recipient) {
        let generation = self.next_generation;
        self.next_generation += 1;
        let registration = Registration {
            id,
            generation,
            recipient,
        };
        match self.registrations.iter_mut().find(|r| r.id == registration.id) {
            Some(existing) => *existing = registration,
            None => self.registrations.push(registration),
        }
    }
}

/// Why an inbound frame was not dispatched.
#[derive(Debug, thiserror::Error)]
pub enum InboundRejection {
    #[error("origin '{0}' does not match the bus origin")]
    ForeignOrigin(String),

    #[error(transparent)]
    Malformed(#[from] securepay_shared::MessageDecodeError),

    #[error("event '{0}' cannot arrive from another context")]
    LocalOnly(String),

    #[error("bus is destroyed")]
    Destroyed,

    #[error("no bus is configured")]
    Unconfigured,
}

/// The owning half of the bus.
pub struct Bus {
    inner: Rc<RefCell<BusInner>>,
}

impl Bus {
    /// Create a bus scoped to the API origin.
    pub fn new(origin: Origin) -> Self {
        tracing::debug!(origin = %origin, "Bus created");
        Self {
            inner: Rc::new(RefCell::new(BusInner {
                origin,
                registrations: Vec::new(),
                queue: VecDeque::new(),
                next_generation: 0,
                dispatching: false,
                destroyed: false,
            })),
        }
    }

    /// A shareable, non-owning handle for members.
    pub fn handle(&self) -> BusHandle {
        BusHandle {
            inner: Rc::downgrade(&self.inner),
            source: None,
        }
    }

    pub fn origin(&self) -> Origin {
        self.inner.borrow().origin.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.borrow().destroyed
    }

    /// Broadcast `destroy`, then release every registration.
    ///
    /// Idempotent. After the first call every send is a no-op.
    pub fn destroy(&self) {
        let (targets, origin, message) = {
            let mut inner = self.inner.borrow_mut();
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;

            let envelope = Envelope {
                message: Message::signal(EventKind::Destroy),
                audience: Audience::All {
                    exclude: Vec::new(),
                },
            };
            // Remotes first: local teardown may close them.
            let (mut targets, locals): (Vec<_>, Vec<_>) = inner
                .targets(&envelope)
                .into_iter()
                .partition(|(_, _, target)| matches!(target, Target::Remote(_)));
            targets.extend(locals);
            inner.registrations.clear();
            let dropped = inner.queue.len();
            inner.queue.clear();
            if dropped > 0 {
                tracing::debug!(dropped, "Discarded queued messages on destroy");
            }
            (targets, inner.origin.clone(), envelope.message)
        };

        for (_, _, target) in targets {
            deliver(&target, &message, &origin);
        }
        tracing::debug!("Bus destroyed");
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Non-owning handle through which members publish and subscribe.
#[derive(Clone)]
pub struct BusHandle {
    inner: Weak<RefCell<BusInner>>,
    source: Option<MemberId>,
}

impl BusHandle {
    /// A handle that stamps outgoing messages with `source`.
    pub fn as_member(&self, source: MemberId) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
            source: Some(source),
        }
    }

    pub fn is_live(&self) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| !inner.borrow().destroyed)
    }

    /// Register a local member. Re-adding an identity replaces the previous
    /// registration. The member alone is notified with `bus:added`.
    pub fn add(&self, member: Member) {
        let Some(inner) = self.live() else {
            return;
        };
        let id = member.id.clone();
        {
            let mut bus = inner.borrow_mut();
            bus.register(id.clone(), Recipient::Local(member));
            bus.queue.push_back(Envelope {
                message: Message::signal(EventKind::BusAdded),
                audience: Audience::Only(id.clone()),
            });
        }
        tracing::debug!(member = %id, "Member added to bus");
        drain(&inner);
    }

    /// Register a remote browsing context as a recipient.
    pub fn add_remote(&self, context: Rc<dyn BrowsingContext>) {
        let Some(inner) = self.live() else {
            return;
        };
        let id = context.id();
        tracing::debug!(member = %id, "Remote context added to bus");
        inner.borrow_mut().register(id, Recipient::Remote(context));
    }

    /// Unregister a member or remote context. Queued messages are not
    /// delivered to it.
    pub fn remove(&self, id: &MemberId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.borrow_mut().registrations.retain(|r| &r.id != id);
        }
    }

    pub fn contains(&self, id: &MemberId) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.borrow().registrations.iter().any(|r| &r.id == id))
    }

    /// Deliver an event to every matching member, local and remote.
    pub fn send(&self, event: EventKind, body: impl Serialize) {
        self.send_excluding(event, body, &[]);
    }

    /// Deliver an event to every matching member except `exclude`.
    pub fn send_excluding(&self, event: EventKind, body: impl Serialize, exclude: &[MemberId]) {
        let Some(inner) = self.live() else {
            tracing::debug!(event = %event, "Send on destroyed bus dropped");
            return;
        };
        let Some(message) = self.envelope_message(event, body) else {
            return;
        };
        inner.borrow_mut().queue.push_back(Envelope {
            message,
            audience: Audience::All {
                exclude: exclude.to_vec(),
            },
        });
        drain(&inner);
    }

    /// Deliver an event to local members only; remote contexts never see it.
    pub fn send_local(&self, event: EventKind, body: impl Serialize) {
        let Some(inner) = self.live() else {
            tracing::debug!(event = %event, "Send on destroyed bus dropped");
            return;
        };
        let Some(message) = self.envelope_message(event, body) else {
            return;
        };
        inner.borrow_mut().queue.push_back(Envelope {
            message,
            audience: Audience::Local,
        });
        drain(&inner);
    }

    /// Entry point for frames posted from another browsing context.
    pub fn receive(&self, origin: &str, data: &Value) -> Result<(), InboundRejection> {
        let Some(inner) = self.live() else {
            return Err(InboundRejection::Destroyed);
        };
        if !inner.borrow().origin.matches(origin) {
            tracing::debug!(origin = %origin, "Dropped message from foreign origin");
            return Err(InboundRejection::ForeignOrigin(origin.to_string()));
        }
        let message = decode_frame(data).map_err(|e| {
            tracing::debug!(error = %e, "Dropped malformed cross-context message");
            e
        })?;
        if message.event.is_local_only() {
            tracing::debug!(event = %message.event, "Dropped local-only event from another context");
            return Err(InboundRejection::LocalOnly(message.event.to_string()));
        }
        inner.borrow_mut().queue.push_back(Envelope {
            message,
            audience: Audience::Local,
        });
        drain(&inner);
        Ok(())
    }

    fn envelope_message(&self, event: EventKind, body: impl Serialize) -> Option<Message> {
        let body = match serde_json::to_value(body) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(event = %event, error = %e, "Message body failed to serialize");
                return None;
            }
        };
        let message = Message::new(event, body);
        Some(match &self.source {
            Some(source) => message.with_source(source.clone()),
            None => message,
        })
    }

    fn live(&self) -> Option<Rc<RefCell<BusInner>>> {
        let inner = self.inner.upgrade()?;
        if inner.borrow().destroyed {
            return None;
        }
        Some(inner)
    }
}

fn drain(inner: &Rc<RefCell<BusInner>>) {
    {
        let mut bus = inner.borrow_mut();
        if bus.dispatching {
            return;
        }
        bus.dispatching = true;
    }

    loop {
        let (envelope, targets, origin) = {
            let mut bus = inner.borrow_mut();
            let Some(envelope) = bus.queue.pop_front() else {
                bus.dispatching = false;
                return;
            };
            let targets = bus.targets(&envelope);
            (envelope, targets, bus.origin.clone())
        };

        if targets.is_empty() {
            tracing::trace!(event = %envelope.message.event, "No recipient for message");
        }

        for (id, generation, target) in targets {
            // Skip members removed or replaced by an earlier handler.
            if !inner.borrow().is_current(&id, generation) {
                continue;
            }
            deliver(&target, &envelope.message, &origin);
        }
    }
}

fn deliver(target: &Target, message: &Message, origin: &Origin) {
    match target {
        Target::Local(handler) => handler(message),
        Target::Remote(context) => {
            if context.is_closed() {
                tracing::debug!(member = %context.id(), event = %message.event, "Skipped closed context");
                return;
            }
            if let Err(e) = context.post_message(&encode_structured(message), origin.as_str()) {
                tracing::debug!(member = %context.id(), error = %e, "Post to context failed");
            }
        }
    }
}
