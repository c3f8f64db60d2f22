//! Monadic mode: responses are `{message, context}` envelopes and the
//! context is threaded from one turn into the next.

pub mod partial;
pub mod schema;
pub mod validator;

pub use partial::{deep_merge, PartialEnvelopeParser};
pub use schema::{configure_response_format, MonadicSchema, ProviderKind};
pub use validator::{validate_str, validate_value, MonadicEnvelope};

use serde_json::{Map, Value};

/// Wrap a user message with the running context, as sent to the model.
pub fn monadic_unit(message: &str, context: &Map<String, Value>) -> String {
    MonadicEnvelope::new(message, context.clone()).to_json_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unit_wraps_context() {
        let mut ctx = Map::new();
        ctx.insert("topics".into(), json!(["rust"]));
        assert_eq!(
            monadic_unit("hi", &ctx),
            r#"{"message":"hi","context":{"topics":["rust"]}}"#
        );
        assert_eq!(monadic_unit("hi", &Map::new()), r#"{"message":"hi","context":{}}"#);
    }
}
