//! Tokenization dispatch.
//!
//! Two execution modes:
//! - **Parent**: the request goes over the bus as `token:init` carrying a fresh
//!   [`CorrelationId`]; the secure field context answers on
//!   `token:done:<id>`.
//! - **Direct**: inputs are validated locally and handed to the HTTP
//!   collaborator.
//!
//! Every request is tracked in [`PendingTokens`] until it settles. The entry is
//! removed before its completion runs, so a duplicate or late reply finds
//! nothing and is dropped.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use futures_channel::oneshot;
use serde_json::{Map, Value};

use securepay_shared::{
    CorrelationId, ErrorPayload, EventKind, MemberId, Message, Token, TokenDone, TokenInit,
};

use crate::bus::{BusHandle, Member};
use crate::error::TokenError;
use crate::ports::{Scheduler, TimerId, TokenApi, TokenOutput, Validator};

/// Bus identity of the dispatcher member.
pub const DISPATCHER_ID: &str = "securepay-token-dispatch";

/// Completion of one tokenization request. Invoked exactly once.
pub type TokenCallback = Box<dyn FnOnce(Result<Token, TokenError>)>;

// =============================================================================
// Pending requests
// =============================================================================

struct PendingEntry {
    done: TokenCallback,
    output: Option<Rc<dyn TokenOutput>>,
    timer: Option<TimerId>,
}

/// Correlation id to single-use continuation.
#[derive(Default)]
pub struct PendingTokens {
    entries: HashMap<CorrelationId, PendingEntry>,
}

impl PendingTokens {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, id: CorrelationId, done: TokenCallback, output: Option<Rc<dyn TokenOutput>>) {
        self.entries.insert(
            id,
            PendingEntry {
                done,
                output,
                timer: None,
            },
        );
    }

    fn set_timer(&mut self, id: &CorrelationId, timer: TimerId) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.timer = Some(timer);
                true
            }
            None => false,
        }
    }

    /// Remove an entry so it can be completed.
    fn take(&mut self, id: &CorrelationId) -> Option<PendingEntry> {
        self.entries.remove(id)
    }

    fn drain(&mut self) -> Vec<(CorrelationId, PendingEntry)> {
        self.entries.drain().collect()
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Where tokenization is performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Through the secure field context over the bus.
    Parent,
    /// Straight to the HTTP collaborator.
    Direct,
}

/// Collaborators the dispatcher needs.
#[derive(Clone)]
pub struct TokenDeps {
    pub bus: BusHandle,
    pub scheduler: Rc<dyn Scheduler>,
    pub token_api: Rc<dyn TokenApi>,
    pub validator: Rc<dyn Validator>,
}

/// One tokenization request.
pub struct TokenRequest {
    pub inputs: Map<String, Value>,
    /// Receives the token id on success.
    pub output: Option<Rc<dyn TokenOutput>>,
    pub timeout_ms: Option<u32>,
    /// Overrides the dispatcher's mode for this request.
    pub mode: Option<DispatchMode>,
}

impl TokenRequest {
    pub fn new(inputs: Map<String, Value>) -> Self {
        Self {
            inputs,
            output: None,
            timeout_ms: None,
            mode: None,
        }
    }

    pub fn with_output(mut self, output: Option<Rc<dyn TokenOutput>>) -> Self {
        self.output = output;
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = Some(mode);
        self
    }
}

struct Shared {
    id: MemberId,
    deps: TokenDeps,
    mode: DispatchMode,
    required: Vec<String>,
    fraud: Map<String, Value>,
    pending: RefCell<PendingTokens>,
    destroyed: Cell<bool>,
}

/// Correlates tokenization requests with their replies.
pub struct TokenDispatcher {
    shared: Rc<Shared>,
}

impl TokenDispatcher {
    /// Create the dispatcher and join the bus.
    pub fn new(
        deps: TokenDeps,
        mode: DispatchMode,
        required: Vec<String>,
        fraud: Map<String, Value>,
    ) -> Self {
        let id = MemberId::new(DISPATCHER_ID);
        let shared = Rc::new(Shared {
            deps: TokenDeps {
                bus: deps.bus.as_member(id.clone()),
                ..deps
            },
            id,
            mode,
            required,
            fraud,
            pending: RefCell::new(PendingTokens::new()),
            destroyed: Cell::new(false),
        });

        let weak = Rc::downgrade(&shared);
        let on_destroy = Weak::clone(&weak);
        shared.deps.bus.add(
            Member::new(shared.id.clone())
                .on(EventKind::Destroy, move |_| {
                    if let Some(shared) = on_destroy.upgrade() {
                        shared.cancel_all();
                    }
                })
                .fallback(move |message| {
                    if let (Some(shared), EventKind::TokenDone(id)) =
                        (weak.upgrade(), &message.event)
                    {
                        shared.reply(*id, message);
                    }
                }),
        );
        Self { shared }
    }

    pub fn mode(&self) -> DispatchMode {
        self.shared.mode
    }

    /// Requests still waiting for a reply.
    pub fn pending(&self) -> usize {
        self.shared.pending.borrow().len()
    }

    pub fn is_pending(&self, id: &CorrelationId) -> bool {
        self.shared.pending.borrow().contains(id)
    }

    /// Start a tokenization. `done` runs exactly once.
    ///
    /// Returns the correlation id tracking the request, or `None` when it
    /// completed synchronously (validation failure, destroyed dispatcher).
    pub fn dispatch(
        &self,
        request: TokenRequest,
        done: impl FnOnce(Result<Token, TokenError>) + 'static,
    ) -> Option<CorrelationId> {
        let shared = &self.shared;
        if shared.destroyed.get() {
            done(Err(TokenError::Cancelled));
            return None;
        }
        match request.mode.unwrap_or(shared.mode) {
            DispatchMode::Parent => Some(shared.dispatch_parent(request, Box::new(done))),
            DispatchMode::Direct => shared.dispatch_direct(request, Box::new(done)),
        }
    }

    /// Complete every pending request with `Cancelled`. Idempotent.
    pub fn destroy(&self) {
        self.shared.cancel_all();
        self.shared.deps.bus.remove(&self.shared.id);
    }
}

impl Shared {
    fn dispatch_parent(self: &Rc<Self>, request: TokenRequest, done: TokenCallback) -> CorrelationId {
        let id = CorrelationId::new();
        let mut inputs = request.inputs;
        if !self.fraud.is_empty() {
            inputs.insert("fraud".to_string(), Value::Object(self.fraud.clone()));
        }

        self.track(id, done, request.output, request.timeout_ms);
        tracing::debug!(correlation_id = %id.short(), "Dispatching tokenization to secure fields");
        self.deps
            .bus
            .send(EventKind::TokenInit, TokenInit { id, inputs });
        id
    }

    fn dispatch_direct(
        self: &Rc<Self>,
        request: TokenRequest,
        done: TokenCallback,
    ) -> Option<CorrelationId> {
        let failures = self.deps.validator.validate(&request.inputs, &self.required);
        if !failures.is_empty() {
            tracing::debug!(fields = failures.len(), "Tokenization inputs failed validation");
            done(Err(TokenError::Validation(failures)));
            return None;
        }

        let id = CorrelationId::new();
        self.track(id, done, request.output, request.timeout_ms);
        tracing::debug!(correlation_id = %id.short(), "Dispatching tokenization to API");

        let weak = Rc::downgrade(self);
        self.deps.token_api.create_token(
            &request.inputs,
            Box::new(move |result| match weak.upgrade() {
                Some(shared) => shared.settle(id, result.map_err(TokenError::from)),
                None => tracing::debug!(correlation_id = %id.short(), "API reply after dispatcher dropped"),
            }),
        );
        Some(id)
    }

    fn track(
        self: &Rc<Self>,
        id: CorrelationId,
        done: TokenCallback,
        output: Option<Rc<dyn TokenOutput>>,
        timeout_ms: Option<u32>,
    ) {
        self.pending.borrow_mut().insert(id, done, output);

        if let Some(timeout_ms) = timeout_ms {
            let weak = Rc::downgrade(self);
            let timer = self.deps.scheduler.set_timeout(
                timeout_ms,
                Box::new(move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.expire(id);
                    }
                }),
            );
            self.pending.borrow_mut().set_timer(&id, timer);
        }
    }

    fn reply(&self, id: CorrelationId, message: &Message) {
        let result = match message.decode::<TokenDone>() {
            Ok(TokenDone {
                error: Some(error), ..
            }) => Err(TokenError::Remote(error)),
            Ok(TokenDone {
                token: Some(token),
                error: None,
            }) => Ok(token),
            Ok(TokenDone { .. }) => Err(TokenError::Remote(ErrorPayload::new(
                "empty_reply",
                "reply carried neither a token nor an error",
            ))),
            Err(e) => Err(TokenError::Remote(ErrorPayload::new(
                "malformed_reply",
                e.to_string(),
            ))),
        };
        self.settle(id, result);
    }

    fn settle(&self, id: CorrelationId, result: Result<Token, TokenError>) {
        let Some(entry) = self.pending.borrow_mut().take(&id) else {
            tracing::debug!(correlation_id = %id.short(), "Reply for settled or unknown request dropped");
            return;
        };
        if let Some(timer) = entry.timer {
            self.deps.scheduler.clear(timer);
        }
        tracing::debug!(correlation_id = %id.short(), ok = result.is_ok(), "Tokenization settled");
        complete(entry, result);
    }

    fn expire(&self, id: CorrelationId) {
        let Some(entry) = self.pending.borrow_mut().take(&id) else {
            return;
        };
        if let Some(timer) = entry.timer {
            self.deps.scheduler.clear(timer);
        }
        tracing::warn!(correlation_id = %id.short(), "Tokenization timed out");
        complete(entry, Err(TokenError::Timeout));
    }

    fn cancel_all(&self) {
        if self.destroyed.replace(true) {
            return;
        }
        let drained = self.pending.borrow_mut().drain();
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "Cancelling pending tokenizations");
        }
        for (_, entry) in drained {
            if let Some(timer) = entry.timer {
                self.deps.scheduler.clear(timer);
            }
            complete(entry, Err(TokenError::Cancelled));
        }
    }
}

fn complete(entry: PendingEntry, result: Result<Token, TokenError>) {
    if let (Ok(token), Some(output)) = (&result, &entry.output) {
        output.write(&token.id);
    }
    (entry.done)(result);
}

// =============================================================================
// Async adapter
// =============================================================================

/// Future resolving with the outcome of a tokenization.
pub struct TokenReceiver(oneshot::Receiver<Result<Token, TokenError>>);

impl Future for TokenReceiver {
    type Output = Result<Token, TokenError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the completion was discarded unrun.
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(TokenError::Cancelled)))
    }
}

/// A completion callback paired with the future it resolves.
pub fn completion_channel() -> (
    impl FnOnce(Result<Token, TokenError>) + 'static,
    TokenReceiver,
) {
    let (tx, rx) = oneshot::channel();
    let done = move |result: Result<Token, TokenError>| {
        if tx.send(result).is_err() {
            tracing::debug!("Tokenization receiver dropped before completion");
        }
    };
    (done, TokenReceiver(rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::config::Origin;
    use crate::error::{ApiError, ValidationFailure};
    use crate::ports::{MockTokenApi, MockValidator, RequiredFields, TokenApiCallback};
    use crate::testing::{FakeContext, ManualScheduler, RecordingTokenOutput};
    use futures_util::FutureExt;
    use serde_json::json;

    const ORIGIN: &str = "https://api.securepay.dev";

    type Outcomes = Rc<RefCell<Vec<Result<Token, TokenError>>>>;

    fn recorder() -> (Outcomes, impl Fn() -> TokenCallback) {
        let outcomes: Outcomes = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&outcomes);
        let make = move || {
            let sink = Rc::clone(&sink);
            Box::new(move |r| sink.borrow_mut().push(r)) as TokenCallback
        };
        (outcomes, make)
    }

    struct Harness {
        bus: Bus,
        scheduler: Rc<ManualScheduler>,
        fields: Rc<FakeContext>,
    }

    impl Harness {
        fn new() -> Self {
            let bus = Bus::new(Origin::from_api(ORIGIN).unwrap());
            let fields = FakeContext::new("number-frame");
            bus.handle().add_remote(fields.clone());
            Self {
                bus,
                scheduler: ManualScheduler::new(),
                fields,
            }
        }

        fn dispatcher(&self, mode: DispatchMode, api: impl TokenApi + 'static) -> TokenDispatcher {
            self.dispatcher_with(mode, api, Map::new())
        }

        fn dispatcher_with(
            &self,
            mode: DispatchMode,
            api: impl TokenApi + 'static,
            fraud: Map<String, Value>,
        ) -> TokenDispatcher {
            TokenDispatcher::new(
                TokenDeps {
                    bus: self.bus.handle(),
                    scheduler: self.scheduler.clone(),
                    token_api: Rc::new(api),
                    validator: Rc::new(RequiredFields),
                },
                mode,
                vec!["number".into(), "month".into(), "year".into()],
                fraud,
            )
        }

        fn token_inits(&self) -> Vec<Value> {
            self.fields
                .posted()
                .into_iter()
                .map(|(frame, _)| frame)
                .filter(|f| f["event"] == "token:init")
                .collect()
        }

        fn reply(&self, id: &CorrelationId, body: Value) {
            self.bus
                .handle()
                .receive(ORIGIN, &json!({ "event": format!("token:done:{id}"), "body": body }))
                .unwrap();
        }
    }

    fn no_api() -> MockTokenApi {
        let mut api = MockTokenApi::new();
        api.expect_create_token().times(0);
        api
    }

    fn inputs(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn parent_mode_sends_token_init_and_resolves_once() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(DispatchMode::Parent, no_api());
        let (outcomes, make) = recorder();

        let id = dispatcher
            .dispatch(TokenRequest::new(inputs(json!({ "name": "A" }))), make())
            .unwrap();

        let inits = h.token_inits();
        assert_eq!(inits.len(), 1);
        assert_eq!(inits[0]["body"]["id"], id.to_string());
        assert_eq!(inits[0]["body"]["inputs"]["name"], "A");
        assert!(dispatcher.is_pending(&id));

        h.reply(&id, json!({ "token": { "id": "tok_1" } }));
        h.reply(&id, json!({ "token": { "id": "tok_2" } }));

        assert_eq!(*outcomes.borrow(), vec![Ok(Token::new("tok_1"))]);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn concurrent_requests_never_cross_deliver() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(DispatchMode::Parent, no_api());
        let results: Vec<Rc<RefCell<Option<Result<Token, TokenError>>>>> =
            (0..5).map(|_| Rc::new(RefCell::new(None))).collect();

        let ids: Vec<CorrelationId> = results
            .iter()
            .map(|slot| {
                let slot = Rc::clone(slot);
                dispatcher
                    .dispatch(TokenRequest::new(Map::new()), move |r| {
                        *slot.borrow_mut() = Some(r)
                    })
                    .unwrap()
            })
            .collect();

        for (i, id) in ids.iter().enumerate().rev() {
            h.reply(id, json!({ "token": { "id": format!("tok_{i}") } }));
        }

        for (i, slot) in results.iter().enumerate() {
            assert_eq!(*slot.borrow(), Some(Ok(Token::new(format!("tok_{i}")))));
        }
    }

    #[test]
    fn remote_error_reply_is_delivered_as_remote() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(DispatchMode::Parent, no_api());
        let (outcomes, make) = recorder();
        let id = dispatcher
            .dispatch(TokenRequest::new(Map::new()), make())
            .unwrap();

        h.reply(&id, json!({ "err": { "code": "invalid_card", "message": "bad number" } }));

        assert_eq!(
            *outcomes.borrow(),
            vec![Err(TokenError::Remote(ErrorPayload::new(
                "invalid_card",
                "bad number"
            )))]
        );
    }

    #[test]
    fn fraud_parameters_ride_along_in_parent_mode() {
        let h = Harness::new();
        let dispatcher = h.dispatcher_with(
            DispatchMode::Parent,
            no_api(),
            inputs(json!({ "collector": "kount", "session": "s1" })),
        );

        dispatcher.dispatch(TokenRequest::new(Map::new()), |_| {});

        assert_eq!(
            h.token_inits()[0]["body"]["inputs"]["fraud"],
            json!({ "collector": "kount", "session": "s1" })
        );
    }

    #[test]
    fn token_is_written_to_bound_output() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(DispatchMode::Parent, no_api());
        let output = RecordingTokenOutput::new();
        let request = TokenRequest::new(Map::new())
            .with_output(Some(output.clone() as Rc<dyn TokenOutput>));

        let id = dispatcher.dispatch(request, |_| {}).unwrap();
        h.reply(&id, json!({ "token": { "id": "tok_out" } }));

        assert_eq!(output.value().as_deref(), Some("tok_out"));
    }

    #[test]
    fn direct_mode_rejects_missing_fields_without_calling_api() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(DispatchMode::Direct, no_api());
        let (outcomes, make) = recorder();

        let id = dispatcher.dispatch(
            TokenRequest::new(inputs(json!({ "number": "4111111111111111" }))),
            make(),
        );

        assert!(id.is_none());
        let outcomes = outcomes.borrow();
        assert_eq!(outcomes.len(), 1);
        match &outcomes[0] {
            Err(err @ TokenError::Validation(_)) => {
                assert_eq!(err.field_names(), vec!["month", "year"])
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(h.token_inits().is_empty());
    }

    #[test]
    fn direct_mode_uses_the_api_collaborator() {
        let h = Harness::new();
        let mut api = MockTokenApi::new();
        api.expect_create_token()
            .withf(|inputs, _| inputs.get("number") == Some(&json!("4111")))
            .times(1)
            .returning(|_, done| done(Ok(Token::new("tok_direct"))));
        let dispatcher = h.dispatcher(DispatchMode::Direct, api);
        let (outcomes, make) = recorder();

        dispatcher.dispatch(
            TokenRequest::new(inputs(json!({ "number": "4111", "month": "12", "year": "2030" }))),
            make(),
        );

        assert_eq!(*outcomes.borrow(), vec![Ok(Token::new("tok_direct"))]);
        assert!(h.token_inits().is_empty());
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn direct_mode_surfaces_api_failures() {
        let h = Harness::new();
        let mut api = MockTokenApi::new();
        api.expect_create_token()
            .returning(|_, done| done(Err(ApiError::Connection("offline".into()))));
        let dispatcher = h.dispatcher(DispatchMode::Direct, api);
        let (outcomes, make) = recorder();

        dispatcher.dispatch(
            TokenRequest::new(inputs(json!({ "number": "1", "month": "1", "year": "1" }))),
            make(),
        );

        assert_eq!(
            *outcomes.borrow(),
            vec![Err(TokenError::ConnectionOrServer(ApiError::Connection(
                "offline".into()
            )))]
        );
    }

    #[test]
    fn request_mode_overrides_the_default() {
        let h = Harness::new();
        let mut api = MockTokenApi::new();
        api.expect_create_token()
            .times(1)
            .returning(|_, done| done(Ok(Token::new("tok_direct"))));
        let dispatcher = h.dispatcher(DispatchMode::Parent, api);
        let (outcomes, make) = recorder();

        dispatcher.dispatch(
            TokenRequest::new(inputs(json!({ "number": "1", "month": "1", "year": "1" })))
                .with_mode(DispatchMode::Direct),
            make(),
        );

        assert_eq!(*outcomes.borrow(), vec![Ok(Token::new("tok_direct"))]);
        assert!(h.token_inits().is_empty());
    }

    #[test]
    fn validator_port_decides_what_is_missing() {
        let h = Harness::new();
        let mut validator = MockValidator::new();
        validator
            .expect_validate()
            .returning(|_, _| vec![ValidationFailure::new("cvv", "format")]);
        let dispatcher = TokenDispatcher::new(
            TokenDeps {
                bus: h.bus.handle(),
                scheduler: h.scheduler.clone(),
                token_api: Rc::new(no_api()),
                validator: Rc::new(validator),
            },
            DispatchMode::Direct,
            Vec::new(),
            Map::new(),
        );
        let (outcomes, make) = recorder();

        dispatcher.dispatch(TokenRequest::new(Map::new()), make());

        assert_eq!(
            *outcomes.borrow(),
            vec![Err(TokenError::Validation(vec![ValidationFailure::new(
                "cvv", "format"
            )]))]
        );
    }

    #[test]
    fn timeout_completes_and_late_reply_is_dropped() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(DispatchMode::Parent, no_api());
        let (outcomes, make) = recorder();

        let id = dispatcher
            .dispatch(TokenRequest::new(Map::new()).with_timeout(500), make())
            .unwrap();
        h.scheduler.advance(499);
        assert!(outcomes.borrow().is_empty());

        h.scheduler.advance(1);
        h.reply(&id, json!({ "token": { "id": "tok_late" } }));

        assert_eq!(*outcomes.borrow(), vec![Err(TokenError::Timeout)]);
    }

    #[test]
    fn expired_request_releases_its_timer() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(DispatchMode::Parent, no_api());
        let (_outcomes, make) = recorder();
        dispatcher.dispatch(TokenRequest::new(Map::new()).with_timeout(500), make());

        h.scheduler.advance(500);

        assert_eq!(h.scheduler.clears(), 1);
        assert_eq!(h.scheduler.pending(), 0);
    }

    #[test]
    fn reply_in_time_clears_the_timer() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(DispatchMode::Parent, no_api());
        let (outcomes, make) = recorder();

        let id = dispatcher
            .dispatch(TokenRequest::new(Map::new()).with_timeout(500), make())
            .unwrap();
        h.reply(&id, json!({ "token": { "id": "tok_1" } }));

        assert_eq!(h.scheduler.pending(), 0);
        h.scheduler.advance(1000);
        assert_eq!(outcomes.borrow().len(), 1);
    }

    #[test]
    fn destroy_cancels_pending_and_drops_late_replies() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(DispatchMode::Parent, no_api());
        let (outcomes, make) = recorder();
        let id = dispatcher
            .dispatch(TokenRequest::new(Map::new()).with_timeout(500), make())
            .unwrap();

        dispatcher.destroy();
        dispatcher.destroy();
        h.reply(&id, json!({ "token": { "id": "tok_1" } }));
        h.scheduler.advance(1000);

        assert_eq!(*outcomes.borrow(), vec![Err(TokenError::Cancelled)]);

        let (after, make) = recorder();
        assert!(dispatcher
            .dispatch(TokenRequest::new(Map::new()), make())
            .is_none());
        assert_eq!(*after.borrow(), vec![Err(TokenError::Cancelled)]);
    }

    #[test]
    fn bus_destroy_cancels_pending() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(DispatchMode::Parent, no_api());
        let (outcomes, make) = recorder();
        dispatcher.dispatch(TokenRequest::new(Map::new()), make());

        h.bus.destroy();

        assert_eq!(*outcomes.borrow(), vec![Err(TokenError::Cancelled)]);
    }

    #[test]
    fn late_api_reply_after_destroy_is_dropped() {
        let h = Harness::new();
        let parked: Rc<RefCell<Option<TokenApiCallback>>> = Rc::new(RefCell::new(None));

        struct ParkedApi(Rc<RefCell<Option<TokenApiCallback>>>);
        impl TokenApi for ParkedApi {
            fn create_token(&self, _: &Map<String, Value>, done: TokenApiCallback) {
                *self.0.borrow_mut() = Some(done);
            }
        }

        let dispatcher = h.dispatcher(DispatchMode::Direct, ParkedApi(Rc::clone(&parked)));
        let (outcomes, make) = recorder();
        dispatcher.dispatch(
            TokenRequest::new(inputs(json!({ "number": "1", "month": "1", "year": "1" }))),
            make(),
        );
        dispatcher.destroy();

        let late = parked.borrow_mut().take().unwrap();
        late(Ok(Token::new("tok_late")));

        assert_eq!(*outcomes.borrow(), vec![Err(TokenError::Cancelled)]);
    }

    #[test]
    fn completion_channel_resolves_the_future() {
        let (done, receiver) = completion_channel();
        done(Ok(Token::new("tok_1")));
        assert_eq!(receiver.now_or_never(), Some(Ok(Token::new("tok_1"))));

        let (done, receiver) = completion_channel();
        drop(done);
        assert_eq!(receiver.now_or_never(), Some(Err(TokenError::Cancelled)));
    }
}
