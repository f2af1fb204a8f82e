//! SecurePay session demo.
//!
//! Drives one parent-mode session against in-memory field contexts: the
//! fields report ready and valid, a tokenization is routed through them, and the
//! client is torn down.

use std::cell::RefCell;
use std::rc::Rc;

#[cfg(not(target_arch = "wasm32"))]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use anyhow::{anyhow, Context};
use serde_json::{json, Map, Value};

use securepay_client::ports::{BrowsingContext, TokenApi, TokenApiCallback};
use securepay_client::testing::{FakeFieldHost, FakeWindowHost, ManualScheduler};
use securepay_client::{Client, ClientConfig, ClientEvent, ClientServices, Origin, TokenError};
use securepay_shared::{FieldConfig, FieldType, FieldsConfig, Token};

/// Stands in for the HTTP collaborator; only reached in direct mode.
struct OfflineTokenApi;

impl TokenApi for OfflineTokenApi {
    fn create_token(&self, _inputs: &Map<String, Value>, done: TokenApiCallback) {
        done(Ok(Token::new("tok_offline")));
    }
}

fn main() -> anyhow::Result<()> {
    #[cfg(not(target_arch = "wasm32"))]
    {
        dotenvy::dotenv().ok();
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "securepay_client=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    #[cfg(target_arch = "wasm32")]
    {
        console_error_panic_hook::set_once();
        tracing_wasm::set_as_global_default();
    }

    tracing::info!("Starting SecurePay session demo");

    let mut config = ClientConfig::from_env()?;
    if config.public_key.is_empty() {
        config.public_key = "pk_demo".into();
    }
    let config = config.with_fields(
        FieldsConfig::new()
            .with(FieldType::Number, FieldConfig::new("#card-number"))
            .with(FieldType::Cvv, FieldConfig::new("#card-cvv")),
    );
    let origin = Origin::from_api(&config.api)?;

    let host = FakeFieldHost::with_selectors(&["#card-number", "#card-cvv"]);
    let client = Client::new(ClientServices::new(
        host.clone(),
        FakeWindowHost::direct(),
        ManualScheduler::new(),
        Rc::new(OfflineTokenApi),
    ));
    client.on_event(|event| match event {
        ClientEvent::Ready => tracing::info!("Secure fields ready"),
        ClientEvent::Error(payload) => tracing::warn!(error = %payload, "Field error"),
        other => tracing::debug!(event = ?other, "Client event"),
    });
    client.configure(config)?;

    for field in [FieldType::Number, FieldType::Cvv] {
        let context = host
            .context(field)
            .with_context(|| format!("{field} was not attached"))?;
        for (event, body) in [
            ("hostedField:ready", json!({ "type": field })),
            (
                "hostedField:state:change",
                json!({ "type": field, "valid": true, "empty": false }),
            ),
        ] {
            client.receive(
                origin.as_str(),
                &json!({ "event": event, "body": body, "source_id": context.id() }),
            )?;
        }
    }

    let outcome: Rc<RefCell<Option<Result<Token, TokenError>>>> = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&outcome);
    let mut inputs = Map::new();
    inputs.insert("first_name".into(), json!("Ada"));
    inputs.insert("last_name".into(), json!("Lovelace"));
    client.tokenize(inputs, move |result| *slot.borrow_mut() = Some(result))?;

    // Answer as the number field would.
    let number = host
        .context(FieldType::Number)
        .context("number field missing")?;
    let init = number
        .posted()
        .into_iter()
        .map(|(frame, _)| frame)
        .find(|frame| frame["event"] == "token:init")
        .context("no token:init was posted")?;
    let id = init["body"]["id"]
        .as_str()
        .context("token:init without an id")?
        .to_string();
    client.receive(
        origin.as_str(),
        &json!({
            "event": format!("token:done:{id}"),
            "body": { "token": { "id": "tok_demo", "type": "card" } },
        }),
    )?;

    let token = outcome
        .borrow_mut()
        .take()
        .ok_or_else(|| anyhow!("tokenization did not complete"))??;
    tracing::info!(token = %token.id, "Tokenization complete");

    client.destroy();
    Ok(())
}
