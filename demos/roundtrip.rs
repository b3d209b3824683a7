//! Example: one full captcha round trip against an in-memory session.
//!
//! Run with: cargo run --example roundtrip

use base64::{engine::general_purpose, Engine as _};
use icon_captcha::config::IconAmount;
use icon_captcha::request::{LoadResponse, SelectionResponse, PAYLOAD_FIELD};
use icon_captcha::session::{KeyValueSessions, SessionBackend};
use icon_captcha::{Action, CaptchaOptions, CaptchaRequest, IconCaptcha, MemoryStore, Payload};
use image::{Rgba, RgbaImage};

const VISITOR: &str = "203.0.113.7";

fn decode<T: serde::de::DeserializeOwned>(body: &str) -> anyhow::Result<T> {
    Ok(serde_json::from_slice(&general_purpose::STANDARD.decode(body)?)?)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    // A tiny icon set: 12 solid colored squares.
    let assets = tempfile::tempdir()?;
    let light = assets.path().join("light");
    std::fs::create_dir_all(&light)?;
    for id in 1..=12u32 {
        let shade = (id * 21) as u8;
        RgbaImage::from_pixel(30, 30, Rgba([shade, 255 - shade, 128, 255]))
            .save(light.join(format!("icon-{}.png", id)))?;
    }

    let mut options = CaptchaOptions::default();
    options.icon_path = assets.path().to_path_buf();
    options.challenge.available_icons = 12;
    options.challenge.icon_amount = IconAmount { min: 5, max: 5 };

    let engine = IconCaptcha::builder(options).build()?;
    let session = MemoryStore::new();
    let token = engine.token(&session)?;
    println!("Form field: {}", engine.token_field(&session)?);

    let widget_id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp_millis();
    let mut payload = Payload {
        action: Action::Load,
        widget_id: widget_id.clone(),
        challenge_id: None,
        timestamp: now,
        init_timestamp: now - 1_000,
        theme: Some("light".into()),
        x: None,
        y: None,
        width: None,
        token: Some(token.clone()),
    };

    // LOAD
    let request = CaptchaRequest::post(VISITOR)
        .with_header("X-IconCaptcha-Token", token.as_str())
        .with_field(PAYLOAD_FIELD, payload.encode()?);
    let response = engine.handle(&request, &session)?;
    let loaded: LoadResponse = decode(&response.body)?;
    println!(
        "Challenge {} ({} bytes of base64 PNG)",
        loaded.identifier,
        loaded.challenge.len()
    );

    // Peek at the stored layout to play the part of a human.
    let data = KeyValueSessions::new(&session)
        .load(&widget_id, &loaded.identifier)?
        .ok_or_else(|| anyhow::anyhow!("challenge not stored"))?;
    let position = data
        .icons
        .iter()
        .find(|(_, id)| **id == data.correct_id)
        .map(|(p, _)| *p)
        .ok_or_else(|| anyhow::anyhow!("no correct icon"))?;

    // SELECTION
    payload.action = Action::Selection;
    payload.challenge_id = Some(loaded.identifier.clone());
    payload.timestamp = chrono::Utc::now().timestamp_millis();
    payload.x = Some((f64::from(position) - 0.5) * 64.0);
    payload.y = Some(25.0);
    payload.width = Some(320.0);
    let request = CaptchaRequest::post(VISITOR)
        .with_header("X-IconCaptcha-Token", token.as_str())
        .with_field(PAYLOAD_FIELD, payload.encode()?);
    let selected: SelectionResponse = decode(&engine.handle(&request, &session)?.body)?;
    println!("Selected position {}: completed = {}", position, selected.completed);

    // Form submission
    let form = CaptchaRequest::post(VISITOR)
        .with_field("_iconcaptcha-token", token.as_str())
        .with_field("ic-wid", widget_id.as_str())
        .with_field("ic-cid", loaded.identifier.as_str())
        .with_field("ic-hp", "");
    let result = engine.validate(&form, &session)?;
    println!("Validation: {:?}", result);

    let replay = engine.validate(&form, &session)?;
    println!("Replay: {:?}", replay.error_code());

    Ok(())
}
