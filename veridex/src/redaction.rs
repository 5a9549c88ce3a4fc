//! PII redaction for payloads that leave the trust boundary.
//!
//! Local heuristics mask US SSNs, likely credit card numbers, emails and US
//! phone numbers. When a remote redaction service is configured its answer
//! supersedes the local pass; any remote failure falls back to the local
//! heuristic silently.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;

use crate::http::GatewayClient;

static SSN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{3})[- ]?(\d{2})[- ]?(\d{4})\b").unwrap());
static CC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(?:\d[ -]*?){13,19}\b").unwrap());
static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap());
static PHONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:\+?1[-.\s]?)?(?:\(\d{3}\)|\d{3})[-.\s]?\d{3}[-.\s]?\d{4}\b").unwrap()
});
static NON_DIGIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\D").unwrap());

/// Best-effort PII scrubbing.
///
/// - SSNs: `123-45-6789` -> `***-**-6789`
/// - Credit cards: keep last 4 digits as `[CC-**1234]`, or `[REDACTED-CC]`
///   when fewer than 8 digits matched
/// - Emails -> `[REDACTED-EMAIL]`, US phones -> `[REDACTED-PHONE]`
pub fn strip_pii(text: &str) -> String {
    let text = SSN_RE.replace_all(text, "***-**-$3");
    let text = CC_RE.replace_all(&text, |caps: &regex::Captures<'_>| {
        let digits = NON_DIGIT_RE.replace_all(caps.get(0).unwrap().as_str(), "");
        if digits.len() < 8 {
            "[REDACTED-CC]".to_string()
        } else {
            format!("[CC-**{}]", &digits[digits.len() - 4..])
        }
    });
    let text = EMAIL_RE.replace_all(&text, "[REDACTED-EMAIL]");
    PHONE_RE.replace_all(&text, "[REDACTED-PHONE]").into_owned()
}

/// Redaction seam carried by the workflow executor and the OCR pipeline.
///
/// The remote path posts `{"text": ...}` to the configured redaction route and
/// expects `{"text": ...}` back.
#[derive(Clone)]
pub struct Redactor {
    remote: Option<(Arc<GatewayClient>, String)>,
}

impl Redactor {
    /// Local-only redactor.
    pub fn local() -> Self {
        Redactor { remote: None }
    }

    /// Redactor preferring the platform redaction service at `path`.
    pub fn with_remote(client: Arc<GatewayClient>, path: impl Into<String>) -> Self {
        Redactor {
            remote: Some((client, path.into())),
        }
    }

    pub async fn redact_text(&self, text: &str, correlation_id: Option<&str>) -> String {
        if let Some((client, path)) = &self.remote {
            let body = serde_json::json!({ "text": text });
            match client.post_json(path, &body, correlation_id, None).await {
                Ok(resp) => {
                    if let Some(redacted) = resp.get("text").and_then(Value::as_str) {
                        if !redacted.is_empty() {
                            return redacted.to_string();
                        }
                    }
                }
                Err(e) => {
                    log::debug!("remote redaction unavailable, using local rules: {}", e);
                }
            }
        }
        strip_pii(text)
    }

    /// Redact a JSON payload by round-tripping its serialized form.
    pub async fn redact_value(&self, value: &Value, correlation_id: Option<&str>) -> Value {
        let serialized = value.to_string();
        let redacted = self.redact_text(&serialized, correlation_id).await;
        serde_json::from_str(&redacted).unwrap_or_else(|_| Value::String(redacted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssn_masked_to_last_four() {
        assert_eq!(strip_pii("ssn 123-45-6789 ok"), "ssn ***-**-6789 ok");
        assert_eq!(strip_pii("ssn 123 45 6789"), "ssn ***-**-6789");
    }

    #[test]
    fn test_credit_card_masked() {
        assert_eq!(strip_pii("card 4111 1111 1111 1111"), "card [CC-**1111]");
        assert_eq!(strip_pii("card 4111-1111-1111-1234"), "card [CC-**1234]");
    }

    #[test]
    fn test_email_and_phone_redacted() {
        assert_eq!(strip_pii("mail a.b@example.com"), "mail [REDACTED-EMAIL]");
        assert_eq!(strip_pii("call (555) 123-4567"), "call [REDACTED-PHONE]");
        assert_eq!(strip_pii("call +1 555.123.4567"), "call [REDACTED-PHONE]");
    }

    #[test]
    fn test_clean_text_unchanged() {
        let text = "parcel 42 recorded in book 7, page 13";
        assert_eq!(strip_pii(text), text);
    }

    #[tokio::test]
    async fn test_local_redactor_on_json_payload() {
        let redactor = Redactor::local();
        let payload = serde_json::json!({"owner_email": "jane@example.com", "parcel": 42});
        let redacted = redactor.redact_value(&payload, None).await;
        assert_eq!(redacted["owner_email"], "[REDACTED-EMAIL]");
        assert_eq!(redacted["parcel"], 42);
    }
}
