//! Outbound header construction for grok.com, including the `x-statsig-id`
//! telemetry fingerprint.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::models::GrokConfig;

const ALPHANUMERIC: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const LOWERCASE: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

fn random_chars(charset: &[u8], len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| charset[rng.gen_range(0..charset.len())] as char)
        .collect()
}

/// Fabricates a fresh statsig id per request. Half the time it mimics a
/// null-children property error, otherwise an undefined-property error with
/// a random member name; either way the message is base64-encoded.
pub fn dynamic_statsig_id() -> String {
    let mut rng = rand::thread_rng();
    let message = if rng.gen_bool(0.5) {
        format!(
            "e:TypeError: Cannot read properties of null (reading 'children['{}']')",
            random_chars(ALPHANUMERIC, 5)
        )
    } else {
        format!(
            "e:TypeError: Cannot read properties of undefined (reading '{}')",
            random_chars(LOWERCASE, 10)
        )
    };
    BASE64.encode(message)
}

pub fn statsig_id(config: &GrokConfig) -> String {
    if config.dynamic_statsig || config.x_statsig_id.is_empty() {
        dynamic_statsig_id()
    } else {
        config.x_statsig_id.clone()
    }
}

/// `sso-rw` first, then `sso`, both carrying the raw token.
pub fn cookie_for(sso: &str) -> String {
    format!("sso-rw={};sso={}", sso, sso)
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// Baseline browser header set applied to every grok.com call, plus the
/// per-request statsig id and request id. `upload` switches the content
/// type the upload endpoints expect.
pub fn build_headers(config: &GrokConfig, sso: &str, upload: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    insert(&mut headers, "user-agent", crate::constants::BROWSER_USER_AGENT);
    insert(&mut headers, "accept", "*/*");
    insert(&mut headers, "accept-language", "en-US,en;q=0.9");
    insert(&mut headers, "sec-ch-ua", crate::constants::BROWSER_SEC_CH_UA);
    insert(&mut headers, "sec-ch-ua-mobile", "?0");
    insert(&mut headers, "sec-ch-ua-platform", "\"macOS\"");
    insert(&mut headers, "sec-fetch-dest", "empty");
    insert(&mut headers, "sec-fetch-mode", "cors");
    insert(&mut headers, "sec-fetch-site", "same-origin");
    insert(&mut headers, "origin", "https://grok.com");
    insert(&mut headers, "referer", "https://grok.com/");
    insert(
        &mut headers,
        "baggage",
        "sentry-environment=production,sentry-public_key=b311e0f2690c81f25e2c4cf6d4f7ce1c",
    );
    insert(&mut headers, "x-statsig-id", &statsig_id(config));
    insert(
        &mut headers,
        "x-xai-request-id",
        &uuid::Uuid::new_v4().to_string(),
    );
    let content_type = if upload {
        "text/plain;charset=UTF-8"
    } else {
        "application/json"
    };
    insert(&mut headers, "content-type", content_type);
    insert(&mut headers, "cookie", &cookie_for(sso));
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_ids_decode_to_one_of_two_error_shapes() {
        for _ in 0..32 {
            let id = dynamic_statsig_id();
            let decoded = BASE64.decode(&id).expect("valid base64");
            let message = String::from_utf8(decoded).expect("utf8 message");
            let null_form = message
                .starts_with("e:TypeError: Cannot read properties of null (reading 'children['");
            let undefined_form = message
                .starts_with("e:TypeError: Cannot read properties of undefined (reading '");
            assert!(null_form || undefined_form, "unexpected message: {}", message);
        }
    }

    #[test]
    fn cookie_carries_token_in_both_slots() {
        assert_eq!(cookie_for("tok"), "sso-rw=tok;sso=tok");
    }

    #[test]
    fn static_statsig_id_is_used_when_dynamic_off() {
        let config = GrokConfig {
            dynamic_statsig: false,
            x_statsig_id: "fixed-id".to_string(),
            ..GrokConfig::default()
        };
        assert_eq!(statsig_id(&config), "fixed-id");
    }

    #[test]
    fn headers_include_fingerprint_and_request_id() {
        let config = GrokConfig::default();
        let headers = build_headers(&config, "tok", false);
        assert!(headers.contains_key("x-statsig-id"));
        assert!(headers.contains_key("x-xai-request-id"));
        assert_eq!(headers.get("origin").expect("origin").to_str().unwrap(), "https://grok.com");
        assert_eq!(
            headers.get("content-type").expect("ct").to_str().unwrap(),
            "application/json"
        );
        assert_eq!(
            headers.get("cookie").expect("cookie").to_str().unwrap(),
            "sso-rw=tok;sso=tok"
        );

        let upload_headers = build_headers(&config, "tok", true);
        assert_eq!(
            upload_headers.get("content-type").expect("ct").to_str().unwrap(),
            "text/plain;charset=UTF-8"
        );
    }
}
