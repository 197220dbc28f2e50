//! Minimal WoT Form support: just enough to address a remote endpoint.
//!
//! A Form names the href and HTTP method for one operation of one thing.
//! When no form is available (the agent case) adapters fall back to the
//! fixed hub endpoints. This is deliberately not a Forms interpreter.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::Operation;

/// Endpoint metadata for a single operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Form {
    /// Target URL, absolute or relative to the server base
    pub href: String,
    /// HTTP method; defaults to POST when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Subprotocol hint, e.g. "sse"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subprotocol: Option<String>,
    /// Payload content type; defaults to application/json
    #[serde(default, rename = "contentType", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl Form {
    /// Create a form with just an href.
    pub fn new(href: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            method: None,
            subprotocol: None,
            content_type: None,
        }
    }

    /// The HTTP method to use, defaulting to POST.
    pub fn method_or_default(&self) -> &str {
        self.method.as_deref().unwrap_or("POST")
    }
}

/// Callback that looks up the form for an operation, or `None` to use the
/// fixed hub endpoints.
pub type GetFormHandler = Arc<dyn Fn(Operation, &str, &str) -> Option<Form> + Send + Sync>;

/// Substitute the `{operation}`, `{thingID}` and `{name}` URI template
/// variables. Missing values are replaced with "+" so the path stays valid.
pub fn substitute_uri_variables(template: &str, operation: &str, thing_id: &str, name: &str) -> String {
    let or_wildcard = |v: &str| if v.is_empty() { "+".to_string() } else { v.to_string() };
    template
        .replace("{operation}", &or_wildcard(operation))
        .replace("{thingID}", &or_wildcard(thing_id))
        .replace("{name}", &or_wildcard(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_variables_are_substituted() {
        let path = substitute_uri_variables("/wothub/{operation}/{thingID}/{name}", "invokeaction", "thing1", "");
        assert_eq!(path, "/wothub/invokeaction/thing1/+");
    }

    #[test]
    fn form_defaults() {
        let form = Form::new("/things/thing1/actions/action1");
        assert_eq!(form.method_or_default(), "POST");
    }
}
