//! The public client.
//!
//! `Client` owns the configuration and the bus, creates the secure field set
//! when acting as a parent context, and exposes the lifecycle the integrating
//! page uses: `configure`, `ready`, `tokenize`, `open_frame`, `destroy`.
//!
//! Field signals reach the client as a bus member and are republished to
//! `on_event` subscribers as [`ClientEvent`]s.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use serde_json::{Map, Value};

use securepay_shared::{
    ErrorPayload, EventKind, FieldStateSnapshot, FieldType, MemberId, Message, Token,
};

use crate::bus::{Bus, BusHandle, InboundRejection, Member};
use crate::config::ClientConfig;
use crate::error::{ClientError, TokenError};
use crate::frame::{FrameDeps, FrameEvent, FrameOptions, FrameStatus, FrameTransaction};
use crate::hosted_fields::{HostedFields, ReadyState, MEMBER_ID as FIELDS_MEMBER_ID};
use crate::ports::{
    FieldHost, FormSource, RequiredFields, Scheduler, TokenApi, Validator, WindowHost,
};
use crate::token::{
    completion_channel, DispatchMode, TokenDeps, TokenDispatcher, TokenReceiver, TokenRequest,
};

/// Public events published to `on_event` subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Ready,
    Change(FieldStateSnapshot),
    Focus(FieldType),
    Blur(FieldType),
    Submit,
    Error(ErrorPayload),
}

/// What to tokenize.
pub enum TokenInputs {
    /// Plain named values.
    Values(Map<String, Value>),
    /// A host form; its bound token output receives the token id.
    Form(Rc<dyn FormSource>),
}

impl From<Map<String, Value>> for TokenInputs {
    fn from(values: Map<String, Value>) -> Self {
        TokenInputs::Values(values)
    }
}

/// Host environment the client runs against.
#[derive(Clone)]
pub struct ClientServices {
    pub field_host: Rc<dyn FieldHost>,
    pub window_host: Rc<dyn WindowHost>,
    pub scheduler: Rc<dyn Scheduler>,
    pub token_api: Rc<dyn TokenApi>,
    pub validator: Rc<dyn Validator>,
}

impl ClientServices {
    pub fn new(
        field_host: Rc<dyn FieldHost>,
        window_host: Rc<dyn WindowHost>,
        scheduler: Rc<dyn Scheduler>,
        token_api: Rc<dyn TokenApi>,
    ) -> Self {
        Self {
            field_host,
            window_host,
            scheduler,
            token_api,
            validator: Rc::new(RequiredFields),
        }
    }

    pub fn with_validator(mut self, validator: Rc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }
}

type Listener = Rc<dyn Fn(&ClientEvent)>;

#[derive(Default)]
struct ClientState {
    config: Option<ClientConfig>,
    bus: Option<Bus>,
    fields: Option<Rc<HostedFields>>,
    dispatcher: Option<Rc<TokenDispatcher>>,
    frames: Vec<Rc<FrameTransaction>>,
    ready_callbacks: Vec<Box<dyn FnOnce()>>,
    listeners: Vec<Listener>,
    destroyed: bool,
}

impl ClientState {
    fn handle(&self) -> Option<BusHandle> {
        self.bus.as_ref().map(Bus::handle)
    }

    fn ready_state(&self) -> ReadyState {
        match (&self.config, &self.fields) {
            (None, _) => ReadyState::Unconfigured,
            (Some(config), _) if !config.parent => ReadyState::ReadyWithoutFields,
            (Some(_), Some(fields)) => fields.ready_state(),
            (Some(_), None) => ReadyState::Unconfigured,
        }
    }
}

struct Shared {
    id: MemberId,
    services: ClientServices,
    state: RefCell<ClientState>,
}

/// Entry point for an integrating page.
pub struct Client {
    shared: Rc<Shared>,
}

impl Client {
    pub fn new(services: ClientServices) -> Self {
        Self {
            shared: Rc::new(Shared {
                id: MemberId::generate(),
                services,
                state: RefCell::new(ClientState::default()),
            }),
        }
    }

    pub fn id(&self) -> &MemberId {
        &self.shared.id
    }

    pub fn config(&self) -> Option<ClientConfig> {
        self.shared.state.borrow().config.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.state.borrow().destroyed
    }

    pub fn ready_state(&self) -> ReadyState {
        self.shared.state.borrow().ready_state()
    }

    /// Last reported state of every secure field.
    pub fn field_state(&self) -> FieldStateSnapshot {
        let fields = self.shared.state.borrow().fields.clone();
        fields.map(|f| f.snapshot()).unwrap_or_default()
    }

    /// Apply a configuration.
    ///
    /// The first call creates the bus. In parent mode later calls run the field
    /// integrity check and reset the field set when it no longer matches.
    pub fn configure(&self, config: ClientConfig) -> Result<(), ClientError> {
        let shared = &self.shared;
        let origin = config.validate()?;

        let (handle, created, previous) = {
            let mut state = shared.state.borrow_mut();
            if state.destroyed {
                return Err(ClientError::Destroyed);
            }
            let created = state.bus.is_none();
            if created {
                state.bus = Some(Bus::new(origin.clone()));
            }
            let Some(handle) = state.handle() else {
                return Err(ClientError::NotConfigured);
            };
            (handle, created, state.config.replace(config.clone()))
        };

        if created {
            handle.add(member(shared));
            tracing::info!(client = %shared.id, origin = %origin, parent = config.parent, "Client configured");
        } else {
            let bus_origin = shared
                .state
                .borrow()
                .bus
                .as_ref()
                .map(|bus| bus.origin());
            if bus_origin.as_ref() != Some(&origin) {
                tracing::warn!(origin = %origin, "API origin changed after the bus was created; keeping the original");
            }
            tracing::debug!(client = %shared.id, "Client reconfigured");
        }

        shared.refresh_dispatcher(&handle, previous.as_ref(), &config);

        if config.parent {
            shared.configure_fields(&handle, &config);
        } else {
            let fields = shared.state.borrow_mut().fields.take();
            if let Some(fields) = fields {
                fields.destroy();
            }
            let became_ready = previous.map_or(true, |p| p.parent);
            if became_ready {
                shared.become_ready();
            }
        }
        Ok(())
    }

    /// Run `callback` once the client is ready, immediately if it already is.
    pub fn ready(&self, callback: impl FnOnce() + 'static) {
        {
            let mut state = self.shared.state.borrow_mut();
            if state.destroyed {
                return;
            }
            if !state.ready_state().is_ready() {
                state.ready_callbacks.push(Box::new(callback));
                return;
            }
        }
        callback();
    }

    /// Subscribe to public events.
    pub fn on_event(&self, listener: impl Fn(&ClientEvent) + 'static) {
        let mut state = self.shared.state.borrow_mut();
        if !state.destroyed {
            state.listeners.push(Rc::new(listener));
        }
    }

    /// Start a tokenization; `done` receives the outcome exactly once.
    ///
    /// Misuse (unconfigured or destroyed client) is returned synchronously and
    /// `done` is not called.
    pub fn tokenize(
        &self,
        inputs: impl Into<TokenInputs>,
        done: impl FnOnce(Result<Token, TokenError>) + 'static,
    ) -> Result<(), ClientError> {
        self.start_tokenize(inputs.into(), None, done)
    }

    /// Like [`Client::tokenize`] with an explicit timeout.
    pub fn tokenize_with_timeout(
        &self,
        inputs: impl Into<TokenInputs>,
        timeout_ms: u32,
        done: impl FnOnce(Result<Token, TokenError>) + 'static,
    ) -> Result<(), ClientError> {
        self.start_tokenize(inputs.into(), Some(timeout_ms), done)
    }

    /// Future-returning form of [`Client::tokenize`].
    pub fn tokenize_async(
        &self,
        inputs: impl Into<TokenInputs>,
    ) -> Result<TokenReceiver, ClientError> {
        let (done, receiver) = completion_channel();
        self.tokenize(inputs, done)?;
        Ok(receiver)
    }

    fn start_tokenize(
        &self,
        inputs: TokenInputs,
        timeout_ms: Option<u32>,
        done: impl FnOnce(Result<Token, TokenError>) + 'static,
    ) -> Result<(), ClientError> {
        let (dispatcher, fields, config) = {
            let state = self.shared.state.borrow();
            if state.destroyed {
                return Err(ClientError::Destroyed);
            }
            let (Some(config), Some(dispatcher)) = (&state.config, &state.dispatcher) else {
                return Err(ClientError::NotConfigured);
            };
            (Rc::clone(dispatcher), state.fields.clone(), config.clone())
        };

        let (values, output) = match inputs {
            TokenInputs::Values(values) => (values, None),
            TokenInputs::Form(form) => (form.values(), form.token_output()),
        };
        let mut request = TokenRequest::new(values).with_output(output);

        if config.parent {
            let gate = fields.map_or(Err(TokenError::NotReady), |f| {
                f.can_tokenize()
                    .map(|()| f.ready_state() == ReadyState::ReadyWithoutFields)
            });
            match gate {
                Err(e) => {
                    tracing::debug!(error = %e, "Tokenization refused");
                    done(Err(e));
                    return Ok(());
                }
                // No secure field context can answer; go straight to the API.
                Ok(true) => request = request.with_mode(DispatchMode::Direct),
                Ok(false) => {}
            }
        }

        let timeout_ms = timeout_ms.or_else(|| {
            (config.timeout_ms > 0).then(|| u32::try_from(config.timeout_ms).unwrap_or(u32::MAX))
        });
        if let Some(timeout_ms) = timeout_ms {
            request = request.with_timeout(timeout_ms);
        }

        dispatcher.dispatch(request, done);
        Ok(())
    }

    /// Start a popup transaction joined to the bus.
    pub fn open_frame(
        &self,
        options: FrameOptions,
        listener: impl FnOnce(FrameEvent) + 'static,
    ) -> Result<Rc<FrameTransaction>, ClientError> {
        let (handle, config) = {
            let mut state = self.shared.state.borrow_mut();
            if state.destroyed {
                return Err(ClientError::Destroyed);
            }
            state
                .frames
                .retain(|f| f.status() != FrameStatus::Destroyed);
            let (Some(handle), Some(config)) = (state.handle(), state.config.clone()) else {
                return Err(ClientError::NotConfigured);
            };
            (handle, config)
        };

        let services = &self.shared.services;
        let frame = Rc::new(FrameTransaction::prepare(
            FrameDeps {
                bus: handle,
                window_host: Rc::clone(&services.window_host),
                scheduler: Rc::clone(&services.scheduler),
            },
            &self.shared.id,
            &config,
            options,
            listener,
        )?);
        self.shared
            .state
            .borrow_mut()
            .frames
            .push(Rc::clone(&frame));
        frame.open();
        Ok(frame)
    }

    /// Entry point for frames posted to this context by field frames, popups
    /// and relays.
    pub fn receive(&self, origin: &str, data: &Value) -> Result<(), InboundRejection> {
        let handle = {
            let state = self.shared.state.borrow();
            if state.destroyed {
                return Err(InboundRejection::Destroyed);
            }
            state.handle().ok_or(InboundRejection::Unconfigured)?
        };
        handle.receive(origin, data)
    }

    /// Tear everything down. Idempotent.
    pub fn destroy(&self) {
        let (bus, fields, dispatcher, frames) = {
            let mut state = self.shared.state.borrow_mut();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.ready_callbacks.clear();
            state.listeners.clear();
            (
                state.bus.take(),
                state.fields.take(),
                state.dispatcher.take(),
                std::mem::take(&mut state.frames),
            )
        };

        // The destroy broadcast reaches every member and remote first.
        if let Some(bus) = bus {
            bus.destroy();
        }
        for frame in frames {
            frame.destroy();
        }
        if let Some(dispatcher) = dispatcher {
            dispatcher.destroy();
        }
        if let Some(fields) = fields {
            fields.destroy();
        }
        tracing::info!(client = %self.shared.id, "Client destroyed");
    }
}

fn route(shared: &Rc<Shared>, handler: fn(&Shared, &Message)) -> impl Fn(&Message) + 'static {
    let weak: Weak<Shared> = Rc::downgrade(shared);
    move |message| {
        if let Some(shared) = weak.upgrade() {
            handler(&shared, message);
        }
    }
}

fn member(shared: &Rc<Shared>) -> Member {
    Member::new(shared.id.clone())
        .on(
            EventKind::HostedFieldsReady,
            route(shared, |s, m| {
                if m.source_id.as_ref().is_some_and(|id| id.as_str() == FIELDS_MEMBER_ID) {
                    s.become_ready();
                }
            }),
        )
        .on(
            EventKind::HostedFieldsStateChange,
            route(shared, |s, m| match m.decode::<FieldStateSnapshot>() {
                Ok(snapshot) => s.emit(ClientEvent::Change(snapshot)),
                Err(e) => tracing::debug!(error = %e, "Malformed field snapshot dropped"),
            }),
        )
        .on(
            EventKind::HostedFieldFocus,
            route(shared, |s, m| s.forward_field(m, ClientEvent::Focus)),
        )
        .on(
            EventKind::HostedFieldBlur,
            route(shared, |s, m| s.forward_field(m, ClientEvent::Blur)),
        )
        .on(
            EventKind::HostedFieldSubmit,
            route(shared, |s, _| {
                if s.fields_ready() {
                    s.emit(ClientEvent::Submit);
                }
            }),
        )
        .on(
            EventKind::HostedFieldError,
            route(shared, |s, m| match m.decode::<ErrorPayload>() {
                Ok(error) => s.emit(ClientEvent::Error(error)),
                Err(e) => tracing::debug!(error = %e, "Malformed field error dropped"),
            }),
        )
}

impl Shared {
    fn refresh_dispatcher(
        &self,
        handle: &BusHandle,
        previous: Option<&ClientConfig>,
        config: &ClientConfig,
    ) {
        let unchanged = previous.is_some_and(|p| {
            p.parent == config.parent && p.required == config.required && p.fraud == config.fraud
        });
        let old = {
            let state = self.state.borrow();
            if unchanged && state.dispatcher.is_some() {
                return;
            }
            state.dispatcher.clone()
        };
        if let Some(old) = old {
            old.destroy();
        }

        let mode = if config.parent {
            DispatchMode::Parent
        } else {
            DispatchMode::Direct
        };
        let dispatcher = TokenDispatcher::new(
            TokenDeps {
                bus: handle.clone(),
                scheduler: Rc::clone(&self.services.scheduler),
                token_api: Rc::clone(&self.services.token_api),
                validator: Rc::clone(&self.services.validator),
            },
            mode,
            config.required.clone(),
            config.fraud.clone(),
        );
        self.state.borrow_mut().dispatcher = Some(Rc::new(dispatcher));
    }

    fn configure_fields(&self, handle: &BusHandle, config: &ClientConfig) {
        let existing = self.state.borrow().fields.clone();
        match existing {
            None => {
                let fields = Rc::new(HostedFields::new(
                    handle,
                    Rc::clone(&self.services.field_host),
                    config.public_key.clone(),
                ));
                self.state.borrow_mut().fields = Some(Rc::clone(&fields));
                fields.initialize(config.fields.clone());
            }
            Some(fields) => match fields.check_integrity(&config.fields) {
                Ok(()) => tracing::debug!("Field integrity check passed"),
                Err(mismatch) => {
                    tracing::warn!(reason = %mismatch, "Field integrity check failed");
                    fields.reset(config.fields.clone());
                }
            },
        }
    }

    fn fields_ready(&self) -> bool {
        let fields = self.state.borrow().fields.clone();
        fields.is_some_and(|f| f.ready_state() == ReadyState::FieldsReady)
    }

    fn forward_field(&self, message: &Message, event: fn(FieldType) -> ClientEvent) {
        if !self.fields_ready() {
            return;
        }
        let field = message
            .body
            .get("type")
            .cloned()
            .and_then(|t| serde_json::from_value::<FieldType>(t).ok());
        match field {
            Some(field) => self.emit(event(field)),
            None => tracing::debug!(event = %message.event, "Field signal without a field type"),
        }
    }

    fn become_ready(&self) {
        let callbacks = {
            let mut state = self.state.borrow_mut();
            if state.destroyed || !state.ready_state().is_ready() {
                return;
            }
            std::mem::take(&mut state.ready_callbacks)
        };
        tracing::info!(client = %self.id, queued = callbacks.len(), "Client ready");
        for callback in callbacks {
            callback();
        }
        self.emit(ClientEvent::Ready);
    }

    fn emit(&self, event: ClientEvent) {
        let listeners = self.state.borrow().listeners.clone();
        for listener in listeners {
            listener(&event);
        }
    }
}
