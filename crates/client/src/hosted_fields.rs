//! Secure field lifecycle.
//!
//! `HostedFields` mounts one secure context per configured field, tracks their
//! readiness and reported state, and joins the bus as a member so that field
//! signals (ready, state change, tab navigation, errors) are routed to it.
//!
//! Readiness advances `Unconfigured -> Initializing -> FieldsReady`, or straight
//! to `ReadyWithoutFields` when nothing could be attached. The only way back is
//! [`HostedFields::reset`], driven by a failed integrity check.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};

use securepay_shared::{
    ErrorPayload, EventKind, FieldConfig, FieldReady, FieldState, FieldStateSnapshot, FieldType,
    FieldsConfig, HostedFieldsReady, MemberId, Message,
};

use crate::bus::{BusHandle, Member};
use crate::error::TokenError;
use crate::ports::{BrowsingContext, FieldHost};

/// Bus identity of the field lifecycle member.
pub const MEMBER_ID: &str = "securepay-hosted-fields";

/// Readiness of the secure field set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    Unconfigured,
    Initializing,
    FieldsReady,
    /// Nothing could be attached; tokenization proceeds without secure fields.
    ReadyWithoutFields,
}

impl ReadyState {
    pub fn to_u8(self) -> u8 {
        match self {
            ReadyState::Unconfigured => 0,
            ReadyState::Initializing => 1,
            ReadyState::FieldsReady => 2,
            ReadyState::ReadyWithoutFields => 3,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => ReadyState::Initializing,
            2 => ReadyState::FieldsReady,
            3 => ReadyState::ReadyWithoutFields,
            _ => ReadyState::Unconfigured,
        }
    }

    pub fn is_ready(self) -> bool {
        self >= ReadyState::FieldsReady
    }
}

/// Why the attached field set no longer matches what the owner wants.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityMismatch {
    #[error("field configuration changed")]
    ConfigChanged,

    #[error("field container '{0}' is no longer in the document")]
    MissingContainer(String),
}

/// Body naming a single field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct FieldTarget {
    #[serde(rename = "type")]
    field_type: FieldType,
}

/// Body of `hostedFields:configure`.
#[derive(Serialize)]
struct ConfigureField<'a> {
    #[serde(rename = "type")]
    field_type: FieldType,
    #[serde(flatten)]
    config: &'a FieldConfig,
    key: &'a str,
}

struct AttachedField {
    field: FieldType,
    context: Rc<dyn BrowsingContext>,
    ready: bool,
}

impl AttachedField {
    /// Only signals stamped by this field's own context count. Unstamped
    /// frames and frames from a context torn down by a reset are ignored.
    fn accepts(&self, message: &Message) -> bool {
        message.source_id.as_ref() == Some(&self.context.id())
    }
}

struct FieldsState {
    ready_state: ReadyState,
    config: FieldsConfig,
    attached: Vec<AttachedField>,
    snapshot: FieldStateSnapshot,
    generation: u64,
    destroyed: bool,
}

struct Shared {
    id: MemberId,
    bus: BusHandle,
    host: Rc<dyn FieldHost>,
    public_key: String,
    state: RefCell<FieldsState>,
}

/// The secure field set of a parent context.
pub struct HostedFields {
    shared: Rc<Shared>,
}

impl HostedFields {
    pub fn new(bus: &BusHandle, host: Rc<dyn FieldHost>, public_key: impl Into<String>) -> Self {
        let id = MemberId::new(MEMBER_ID);
        Self {
            shared: Rc::new(Shared {
                bus: bus.as_member(id.clone()),
                id,
                host,
                public_key: public_key.into(),
                state: RefCell::new(FieldsState {
                    ready_state: ReadyState::Unconfigured,
                    config: FieldsConfig::default(),
                    attached: Vec::new(),
                    snapshot: FieldStateSnapshot::default(),
                    generation: 0,
                    destroyed: false,
                }),
            }),
        }
    }

    pub fn id(&self) -> &MemberId {
        &self.shared.id
    }

    pub fn ready_state(&self) -> ReadyState {
        self.shared.state.borrow().ready_state
    }

    /// Number of initializations so far, resets included.
    pub fn generation(&self) -> u64 {
        self.shared.state.borrow().generation
    }

    pub fn snapshot(&self) -> FieldStateSnapshot {
        self.shared.state.borrow().snapshot.clone()
    }

    pub fn config(&self) -> FieldsConfig {
        self.shared.state.borrow().config.clone()
    }

    /// Fields whose secure context was mounted, in tab order.
    pub fn attached_fields(&self) -> Vec<FieldType> {
        self.shared
            .state
            .borrow()
            .attached
            .iter()
            .map(|a| a.field)
            .collect()
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.state.borrow().destroyed
    }

    /// Mount every configured field and join the bus.
    ///
    /// Only valid from `Unconfigured`. Fields that fail to attach are reported
    /// as `hostedField:error` to local members; the rest continue.
    pub fn initialize(&self, config: FieldsConfig) {
        let shared = &self.shared;
        {
            let mut state = shared.state.borrow_mut();
            if state.destroyed {
                tracing::debug!("Initialize on destroyed hosted fields ignored");
                return;
            }
            if state.ready_state != ReadyState::Unconfigured {
                tracing::warn!(state = ?state.ready_state, "Hosted fields already initialized");
                return;
            }
            state.ready_state = ReadyState::Initializing;
            state.generation += 1;
            state.config = config.clone();
        }
        tracing::info!(fields = config.len(), "Initializing hosted fields");

        let mut attached = Vec::new();
        let mut failures = Vec::new();
        for (field, field_config) in config.iter() {
            match shared.host.attach(field, field_config) {
                Ok(context) => attached.push(AttachedField {
                    field,
                    context,
                    ready: false,
                }),
                Err(e) => {
                    tracing::warn!(field = %field, error = %e, "Secure field failed to attach");
                    failures.push(
                        ErrorPayload::new("attach_failed", e.to_string())
                            .with_fields(vec![field.to_string()]),
                    );
                }
            }
        }

        let contexts: Vec<_> = attached.iter().map(|a| Rc::clone(&a.context)).collect();
        let none_attached = attached.is_empty();
        {
            let mut state = shared.state.borrow_mut();
            state.snapshot = FieldStateSnapshot::default();
            for a in &attached {
                state.snapshot.insert(FieldState::blank(a.field));
            }
            state.attached = attached;
            if none_attached {
                state.ready_state = ReadyState::ReadyWithoutFields;
            }
        }

        shared.bus.add(member(shared));
        for context in contexts {
            shared.bus.add_remote(context);
        }
        for failure in failures {
            shared.bus.send_local(EventKind::HostedFieldError, failure);
        }
        if none_attached {
            tracing::info!("No secure fields attached, ready without fields");
            shared
                .bus
                .send(EventKind::HostedFieldsReady, HostedFieldsReady::default());
        }
    }

    /// Compare the attached set against a newly supplied configuration.
    ///
    /// Only meaningful once initialization has finished; earlier calls pass.
    pub fn check_integrity(&self, config: &FieldsConfig) -> Result<(), IntegrityMismatch> {
        let state = self.shared.state.borrow();
        if !state.ready_state.is_ready() {
            return Ok(());
        }
        if state.config != *config {
            return Err(IntegrityMismatch::ConfigChanged);
        }
        for attached in &state.attached {
            if let Some(field_config) = state.config.get(attached.field) {
                if !self.shared.host.contains(&field_config.selector) {
                    return Err(IntegrityMismatch::MissingContainer(
                        field_config.selector.clone(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Tear down the current field set and initialize again with `config`.
    pub fn reset(&self, config: FieldsConfig) {
        if self.is_destroyed() {
            return;
        }
        tracing::warn!(generation = self.generation(), "Resetting hosted fields");
        self.shared.teardown(false);
        self.initialize(config);
    }

    /// Whether a tokenization may be attempted right now.
    pub fn can_tokenize(&self) -> Result<(), TokenError> {
        let state = self.shared.state.borrow();
        if state.destroyed {
            return Err(TokenError::NotReady);
        }
        match state.ready_state {
            ReadyState::ReadyWithoutFields => Ok(()),
            ReadyState::FieldsReady => {
                let invalid = state.snapshot.invalid_fields();
                if invalid.is_empty() {
                    Ok(())
                } else {
                    Err(TokenError::invalid_fields(&invalid))
                }
            }
            ReadyState::Unconfigured | ReadyState::Initializing => Err(TokenError::NotReady),
        }
    }

    /// Terminal teardown. Idempotent.
    pub fn destroy(&self) {
        self.shared.teardown(true);
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
        .on(EventKind::HostedFieldReady, route(shared, Shared::field_ready))
        .on(
            EventKind::HostedFieldStateChange,
            route(shared, Shared::state_change),
        )
        .on(EventKind::HostedFieldTabNext, route(shared, |s, m| s.tab(m, true)))
        .on(
            EventKind::HostedFieldTabPrevious,
            route(shared, |s, m| s.tab(m, false)),
        )
        .on(EventKind::HostedFieldError, route(shared, Shared::field_error))
        .on(EventKind::Destroy, route(shared, |s, _| s.teardown(true)))
}

impl Shared {
    fn field_ready(&self, message: &Message) {
        let Ok(FieldReady { field_type }) = message.decode::<FieldReady>() else {
            tracing::debug!("Malformed field ready signal dropped");
            return;
        };

        let (config, all_ready) = {
            let mut state = self.state.borrow_mut();
            if state.ready_state != ReadyState::Initializing {
                tracing::debug!(field = %field_type, state = ?state.ready_state, "Field ready outside initialization");
                return;
            }
            let Some(entry) = state.attached.iter_mut().find(|a| a.field == field_type) else {
                tracing::debug!(field = %field_type, "Ready signal for unattached field");
                return;
            };
            if !entry.accepts(message) || entry.ready {
                return;
            }
            entry.ready = true;

            let config = state.config.get(field_type).cloned();
            let all_ready = state.attached.iter().all(|a| a.ready).then(|| {
                state.ready_state = ReadyState::FieldsReady;
                state.attached.iter().map(|a| a.field).collect::<Vec<_>>()
            });
            (config, all_ready)
        };

        tracing::debug!(field = %field_type, "Secure field ready");
        if let Some(config) = config {
            self.bus.send(
                EventKind::HostedFieldsConfigure,
                ConfigureField {
                    field_type,
                    config: &config,
                    key: &self.public_key,
                },
            );
        }
        if let Some(fields) = all_ready {
            tracing::info!(fields = fields.len(), "Hosted fields ready");
            self.bus
                .send(EventKind::HostedFieldsReady, HostedFieldsReady { fields });
        }
    }

    fn state_change(&self, message: &Message) {
        let Ok(field_state) = message.decode::<FieldState>() else {
            tracing::debug!("Malformed field state dropped");
            return;
        };

        let snapshot = {
            let mut state = self.state.borrow_mut();
            let known = state
                .attached
                .iter()
                .any(|a| a.field == field_state.field_type && a.accepts(message));
            if !known {
                return;
            }
            state.snapshot.insert(field_state);
            (state.ready_state == ReadyState::FieldsReady).then(|| state.snapshot.clone())
        };

        if let Some(snapshot) = snapshot {
            self.bus.send(EventKind::HostedFieldsStateChange, snapshot);
        }
    }

    fn tab(&self, message: &Message, forward: bool) {
        let Ok(FieldTarget { field_type }) = message.decode::<FieldTarget>() else {
            return;
        };

        let target = {
            let state = self.state.borrow();
            if state.ready_state != ReadyState::FieldsReady {
                return;
            }
            let Some(index) = state.attached.iter().position(|a| a.field == field_type) else {
                return;
            };
            let next = if forward {
                index.checked_add(1)
            } else {
                index.checked_sub(1)
            };
            next.and_then(|i| state.attached.get(i)).map(|a| a.field)
        };

        if let Some(field_type) = target {
            tracing::debug!(field = %field_type, "Moving focus");
            self.bus
                .send(EventKind::HostedFieldFocusRequest, FieldTarget { field_type });
        }
    }

    fn field_error(&self, message: &Message) {
        match message.decode::<ErrorPayload>() {
            Ok(error) => tracing::warn!(code = %error.code, fields = ?error.fields, "Secure field reported an error"),
            Err(e) => tracing::debug!(error = %e, "Malformed field error dropped"),
        }
    }

    fn teardown(&self, terminal: bool) {
        let attached = {
            let mut state = self.state.borrow_mut();
            if state.destroyed {
                return;
            }
            state.destroyed = terminal;
            state.ready_state = ReadyState::Unconfigured;
            state.snapshot = FieldStateSnapshot::default();
            std::mem::take(&mut state.attached)
        };

        self.bus.remove(&self.id);
        for field in attached {
            self.bus.remove(&field.context.id());
            field.context.close();
        }
        if terminal {
            tracing::info!("Hosted fields destroyed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::config::Origin;
    use crate::testing::FakeFieldHost;
    use serde_json::{json, Value};

    const ORIGIN: &str = "https://api.securepay.dev";

    struct Harness {
        bus: Bus,
        host: Rc<FakeFieldHost>,
        fields: HostedFields,
        log: Rc<RefCell<Vec<Message>>>,
    }

    impl Harness {
        fn new(selectors: &[&str]) -> Self {
            let bus = Bus::new(Origin::from_api(ORIGIN).unwrap());
            let host = FakeFieldHost::with_selectors(selectors);
            let fields = HostedFields::new(&bus.handle(), host.clone(), "pk_test");
            let log = Rc::new(RefCell::new(Vec::new()));
            let sink = Rc::clone(&log);
            bus.handle().add(
                Member::new(MemberId::new("owner"))
                    .fallback(move |m| sink.borrow_mut().push(m.clone())),
            );
            Self {
                bus,
                host,
                fields,
                log,
            }
        }

        fn from_field(&self, field: FieldType, event: &str, body: Value) {
            let context = self.host.context(field).unwrap();
            self.bus
                .handle()
                .receive(
                    ORIGIN,
                    &json!({ "event": event, "body": body, "source_id": context.id() }),
                )
                .unwrap();
        }

        fn ready_all(&self) {
            for field in self.fields.attached_fields() {
                self.from_field(field, "hostedField:ready", json!({ "type": field }));
            }
        }

        fn owner_saw(&self, kind: &EventKind) -> usize {
            self.log.borrow().iter().filter(|m| m.event == *kind).count()
        }
    }

    fn two_fields() -> FieldsConfig {
        FieldsConfig::new()
            .with(FieldType::Number, FieldConfig::new("#n"))
            .with(FieldType::Cvv, FieldConfig::new("#c"))
    }

    #[test]
    fn ready_state_round_trips_through_u8() {
        for state in [
            ReadyState::Unconfigured,
            ReadyState::Initializing,
            ReadyState::FieldsReady,
            ReadyState::ReadyWithoutFields,
        ] {
            assert_eq!(ReadyState::from_u8(state.to_u8()), state);
        }
        assert_eq!(ReadyState::from_u8(9), ReadyState::Unconfigured);
    }

    #[test]
    fn becomes_ready_once_every_field_reports() {
        let h = Harness::new(&["#n", "#c"]);
        h.fields.initialize(two_fields());
        assert_eq!(h.fields.ready_state(), ReadyState::Initializing);
        assert_eq!(h.fields.attached_fields(), vec![FieldType::Number, FieldType::Cvv]);

        h.from_field(FieldType::Number, "hostedField:ready", json!({ "type": "number" }));
        assert_eq!(h.fields.ready_state(), ReadyState::Initializing);
        assert_eq!(h.owner_saw(&EventKind::HostedFieldsReady), 0);

        h.from_field(FieldType::Cvv, "hostedField:ready", json!({ "type": "cvv" }));
        assert_eq!(h.fields.ready_state(), ReadyState::FieldsReady);
        assert_eq!(h.owner_saw(&EventKind::HostedFieldsReady), 1);
    }

    #[test]
    fn ready_field_receives_its_configuration() {
        let h = Harness::new(&["#n"]);
        h.fields.initialize(
            FieldsConfig::new().with(
                FieldType::Number,
                FieldConfig::new("#n").with_style("color", "red"),
            ),
        );
        h.ready_all();

        let frame = h.host.context(FieldType::Number).unwrap();
        let configure = frame
            .posted()
            .into_iter()
            .map(|(frame, _)| frame)
            .find(|f| f["event"] == "hostedFields:configure")
            .unwrap();
        assert_eq!(configure["body"]["type"], "number");
        assert_eq!(configure["body"]["selector"], "#n");
        assert_eq!(configure["body"]["style"]["color"], "red");
        assert_eq!(configure["body"]["key"], "pk_test");
        assert!(frame.posted_events().contains(&"hostedFields:ready".to_string()));
    }

    #[test]
    fn nothing_attachable_is_ready_without_fields() {
        let h = Harness::new(&[]);
        h.fields.initialize(two_fields());

        assert_eq!(h.fields.ready_state(), ReadyState::ReadyWithoutFields);
        assert_eq!(h.owner_saw(&EventKind::HostedFieldsReady), 1);
        assert_eq!(h.owner_saw(&EventKind::HostedFieldError), 2);
        assert!(h.fields.can_tokenize().is_ok());
    }

    #[test]
    fn partial_attach_reports_error_and_continues() {
        let h = Harness::new(&["#n"]);
        h.fields.initialize(two_fields());

        assert_eq!(h.fields.attached_fields(), vec![FieldType::Number]);
        let errors: Vec<Message> = h
            .log
            .borrow()
            .iter()
            .filter(|m| m.event == EventKind::HostedFieldError)
            .cloned()
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].body["fields"], json!(["cvv"]));

        h.ready_all();
        assert_eq!(h.fields.ready_state(), ReadyState::FieldsReady);
    }

    #[test]
    fn state_changes_are_republished_only_when_ready() {
        let h = Harness::new(&["#n", "#c"]);
        h.fields.initialize(two_fields());
        let valid_number = json!({ "type": "number", "valid": true, "empty": false, "brand": "visa" });

        h.from_field(FieldType::Number, "hostedField:state:change", valid_number.clone());
        assert_eq!(h.owner_saw(&EventKind::HostedFieldsStateChange), 0);
        assert_eq!(
            h.fields.snapshot().get(FieldType::Number).unwrap().brand.as_deref(),
            Some("visa")
        );

        h.ready_all();
        h.from_field(FieldType::Number, "hostedField:state:change", valid_number);
        assert_eq!(h.owner_saw(&EventKind::HostedFieldsStateChange), 1);
    }

    #[test]
    fn can_tokenize_requires_ready_and_valid_fields() {
        let h = Harness::new(&["#n", "#c"]);
        assert_eq!(h.fields.can_tokenize(), Err(TokenError::NotReady));

        h.fields.initialize(two_fields());
        h.ready_all();
        let err = h.fields.can_tokenize().unwrap_err();
        assert_eq!(err.field_names(), vec!["number", "cvv"]);

        for field in ["number", "cvv"] {
            let body = json!({ "type": field, "valid": true, "empty": false });
            let field_type: FieldType = serde_json::from_value(json!(field)).unwrap();
            h.from_field(field_type, "hostedField:state:change", body);
        }
        assert!(h.fields.can_tokenize().is_ok());
    }

    #[test]
    fn integrity_passes_for_identical_config() {
        let h = Harness::new(&["#n", "#c"]);
        h.fields.initialize(two_fields());
        h.ready_all();

        assert_eq!(h.fields.check_integrity(&two_fields()), Ok(()));
    }

    #[test]
    fn integrity_fails_on_changed_selector_or_missing_container() {
        let h = Harness::new(&["#n", "#c"]);
        h.fields.initialize(two_fields());
        h.ready_all();

        let moved = FieldsConfig::new()
            .with(FieldType::Number, FieldConfig::new("#other"))
            .with(FieldType::Cvv, FieldConfig::new("#c"));
        assert_eq!(
            h.fields.check_integrity(&moved),
            Err(IntegrityMismatch::ConfigChanged)
        );

        h.host.remove_selector("#c");
        assert_eq!(
            h.fields.check_integrity(&two_fields()),
            Err(IntegrityMismatch::MissingContainer("#c".into()))
        );
    }

    #[test]
    fn integrity_is_not_checked_while_initializing() {
        let h = Harness::new(&["#n", "#c"]);
        h.fields.initialize(two_fields());
        assert_eq!(h.fields.check_integrity(&FieldsConfig::new()), Ok(()));
    }

    #[test]
    fn reset_replaces_the_field_set() {
        let h = Harness::new(&["#n", "#c", "#other"]);
        h.fields.initialize(two_fields());
        h.ready_all();
        let old_number = h.host.context(FieldType::Number).unwrap();

        let moved = FieldsConfig::new().with(FieldType::Number, FieldConfig::new("#other"));
        h.fields.reset(moved.clone());

        assert_eq!(old_number.close_calls(), 1);
        assert_eq!(h.fields.ready_state(), ReadyState::Initializing);
        assert_eq!(h.fields.generation(), 2);
        assert_eq!(h.fields.config(), moved);
        assert_eq!(h.fields.attached_fields(), vec![FieldType::Number]);

        h.ready_all();
        assert_eq!(h.fields.ready_state(), ReadyState::FieldsReady);
        assert_eq!(h.owner_saw(&EventKind::HostedFieldsReady), 2);
    }

    #[test]
    fn signals_from_a_replaced_frame_are_ignored() {
        let h = Harness::new(&["#n", "#other"]);
        h.fields.initialize(FieldsConfig::new().with(FieldType::Number, FieldConfig::new("#n")));
        let stale = h.host.context(FieldType::Number).unwrap();
        h.ready_all();

        h.fields
            .reset(FieldsConfig::new().with(FieldType::Number, FieldConfig::new("#other")));
        h.bus
            .handle()
            .receive(
                ORIGIN,
                &json!({ "event": "hostedField:ready", "body": { "type": "number" }, "source_id": stale.id() }),
            )
            .unwrap();

        assert_eq!(h.fields.ready_state(), ReadyState::Initializing);
    }

    #[test]
    fn unstamped_field_signals_do_not_count() {
        let h = Harness::new(&["#n"]);
        h.fields.initialize(FieldsConfig::new().with(FieldType::Number, FieldConfig::new("#n")));

        for event in ["hostedField:ready", "hostedField:state:change"] {
            h.bus
                .handle()
                .receive(
                    ORIGIN,
                    &json!({ "event": event, "body": { "type": "number", "valid": true } }),
                )
                .unwrap();
        }

        assert_eq!(h.fields.ready_state(), ReadyState::Initializing);
        assert!(!h.fields.snapshot().get(FieldType::Number).is_some_and(|f| f.valid));
    }

    #[test]
    fn tab_navigation_requests_focus_on_adjacent_field() {
        let h = Harness::new(&["#n", "#c"]);
        h.fields.initialize(two_fields());
        h.ready_all();
        let cvv = h.host.context(FieldType::Cvv).unwrap();

        h.from_field(FieldType::Number, "hostedField:tab:next", json!({ "type": "number" }));
        let focus: Vec<Value> = cvv
            .posted()
            .into_iter()
            .map(|(f, _)| f)
            .filter(|f| f["event"] == "hostedField:focus!")
            .collect();
        assert_eq!(focus.len(), 1);
        assert_eq!(focus[0]["body"]["type"], "cvv");

        // Past either end nothing moves.
        let before = h.owner_saw(&EventKind::HostedFieldFocusRequest);
        h.from_field(FieldType::Cvv, "hostedField:tab:next", json!({ "type": "cvv" }));
        h.from_field(FieldType::Number, "hostedField:tab:previous", json!({ "type": "number" }));
        assert_eq!(h.owner_saw(&EventKind::HostedFieldFocusRequest), before);
    }

    #[test]
    fn destroy_is_terminal_and_idempotent() {
        let h = Harness::new(&["#n"]);
        h.fields.initialize(FieldsConfig::new().with(FieldType::Number, FieldConfig::new("#n")));
        let frame = h.host.context(FieldType::Number).unwrap();

        h.fields.destroy();
        h.fields.destroy();

        assert!(h.fields.is_destroyed());
        assert_eq!(h.fields.ready_state(), ReadyState::Unconfigured);
        assert_eq!(frame.close_calls(), 1);
        assert!(!h.bus.handle().contains(h.fields.id()));
        assert_eq!(h.fields.can_tokenize(), Err(TokenError::NotReady));

        h.fields.initialize(two_fields());
        assert_eq!(h.host.attach_count(), 1);
    }

    #[test]
    fn bus_destroy_tears_fields_down() {
        let h = Harness::new(&["#n"]);
        h.fields.initialize(FieldsConfig::new().with(FieldType::Number, FieldConfig::new("#n")));
        let frame = h.host.context(FieldType::Number).unwrap();

        h.bus.destroy();

        assert!(h.fields.is_destroyed());
        assert!(frame.is_closed());
    }
}
