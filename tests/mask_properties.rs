// tests/mask_properties.rs

mod common;

use std::error::Error;
use std::sync::Arc;

use common::event_writer;
use mailfleet::engine::RunLogger;
use mailfleet::mask::Masker;
use mailfleet::protocol::{EventType, LogLevel, LogLineEvent};
use proptest::prelude::*;

type TestResult = Result<(), Box<dyn Error>>;

#[test]
fn bearer_and_password_are_masked_on_the_log_path() -> TestResult {
    let (events, buf) = event_writer();
    let masker = Arc::new(Masker::new());
    let logger = RunLogger::new(events, masker);

    let message =
        r#"Bearer abcdefghijklmnopqrstuvwxyz0123 connected with password="hunter22longenough""#;
    logger.log("run-1-1", Some(1), LogLevel::Info, message);

    let envelopes = common::parse_envelopes(&buf);
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0].event_type, EventType::LogLine);

    let payload: LogLineEvent = serde_json::from_value(envelopes[0].data.clone().unwrap())?;
    let line = &payload.message;

    // The keyword survives; the credentials do not.
    assert!(line.contains("Bearer "));
    assert!(!line.contains("abcdefghijklmnopqrstuvwxyz0123"));
    assert!(!line.contains("hunter22longenough"));
    assert!(line.contains('•'));

    // Partial masks are fixed-width, so the line length stays close.
    let overhead = "[run-1-1:1] ".len();
    let expanded = line.chars().count() as i64 - overhead as i64;
    let original = message.chars().count() as i64;
    assert!(
        (expanded - original).abs() <= 20,
        "masked line drifted too far: {expanded} vs {original}"
    );

    Ok(())
}

proptest! {
    /// mask(mask(s)) == mask(s) for arbitrary input.
    #[test]
    fn masking_is_idempotent(input in ".{0,200}") {
        let masker = Masker::new();
        let once = masker.mask_text(&input);
        let twice = masker.mask_text(&once);
        prop_assert_eq!(once, twice);
    }

    /// Short alphanumeric runs with no key-value context survive unmodified.
    #[test]
    fn short_tokens_survive(token in "[a-zA-Z0-9]{1,15}") {
        let masker = Masker::new();
        let text = format!("deploying {token} now");
        // Words like "key" or "token" in the payload itself are not
        // key=value forms and must not trigger masking.
        prop_assert_eq!(masker.mask_text(&text), text);
    }

    /// Field-keyed masking never leaks the interior of the secret.
    #[test]
    fn partial_mask_hides_interior(secret in "[a-zA-Z0-9]{6,64}") {
        let masker = Masker::new();
        let masked = masker.mask_field("cf_api_token", &secret);
        let interior: String = secret.chars().skip(3).take(secret.chars().count() - 5).collect();
        if interior.len() >= 4 {
            prop_assert!(!masked.contains(&interior));
        }
        prop_assert!(masked.contains('•'));
    }
}
