//! JSON Schema compilation and validation, bound to a single draft.

use jsonschema::{Draft, Validator};
use serde_json::Value;

use super::{ValidationError, ValidationMode};

/// Which JSON Schema draft a compiled validator is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum JsonSchemaDraft {
    /// Draft-04.
    Draft04,
    /// Draft-06.
    Draft06,
    /// Draft-07 (default).
    #[default]
    Draft07,
}

impl JsonSchemaDraft {
    fn as_jsonschema_draft(self) -> Draft {
        match self {
            JsonSchemaDraft::Draft04 => Draft::Draft4,
            JsonSchemaDraft::Draft06 => Draft::Draft6,
            JsonSchemaDraft::Draft07 => Draft::Draft7,
        }
    }
}

/// A JSON Schema compiled once at load time; immutable thereafter.
pub struct CompiledJsonSchema {
    validator: Validator,
}

impl CompiledJsonSchema {
    /// Compiles `schema_document` against the given draft.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid JSON or does not itself
    /// conform to the meta-schema for `draft`.
    pub fn compile(
        schema_document: &Value,
        draft: JsonSchemaDraft,
    ) -> Result<Self, jsonschema::ValidationError<'static>> {
        let validator = jsonschema::options()
            .with_draft(draft.as_jsonschema_draft())
            .build(schema_document)
            .map_err(|e| e.to_owned())?;
        Ok(Self { validator })
    }

    /// Validates `payload` (already parsed as JSON) against the compiled
    /// schema. `mode` governs whether unknown-additional-property violations
    /// are enforced or silently accepted; `WarnOnly` computes the same
    /// violation `Strict` would and leaves the decision to forward anyway to
    /// the caller, which is expected to log and still accept it.
    pub fn validate(&self, payload: &Value, mode: ValidationMode) -> Result<(), ValidationError> {
        let mut errors = self.validator.iter_errors(payload);
        let Some(first) = errors.next() else {
            return Ok(());
        };

        if mode == ValidationMode::Lenient
            && first.kind == jsonschema::error::ValidationErrorKind::AdditionalProperties
        {
            return Ok(());
        }

        Err(map_error(&first))
    }
}

fn map_error(error: &jsonschema::ValidationError<'_>) -> ValidationError {
    use jsonschema::error::ValidationErrorKind as K;
    let code = match &error.kind {
        K::Type { .. } => "schema.type_mismatch",
        K::Required { .. } => "schema.missing_required",
        K::Minimum { .. } | K::Maximum { .. } | K::ExclusiveMinimum { .. } | K::ExclusiveMaximum { .. } => {
            "schema.out_of_range"
        }
        K::AdditionalProperties { .. } => "schema.additional_property",
        _ => "schema.violation",
    };
    ValidationError {
        code: code.to_string(),
        message: error.to_string(),
        path: Some(error.instance_path.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "deviceId": {"type": "string"},
                "temperature": {"type": "number"}
            },
            "required": ["deviceId", "temperature"],
            "additionalProperties": false
        })
    }

    #[test]
    fn accepts_conforming_payload() {
        let compiled = CompiledJsonSchema::compile(&schema(), JsonSchemaDraft::Draft07).unwrap();
        let payload = json!({"deviceId": "TEMP-001", "temperature": 23.5});
        assert!(compiled.validate(&payload, ValidationMode::Strict).is_ok());
    }

    #[test]
    fn rejects_type_mismatch_with_stable_code() {
        let compiled = CompiledJsonSchema::compile(&schema(), JsonSchemaDraft::Draft07).unwrap();
        let payload = json!({"deviceId": "TEMP-001", "temperature": "hot"});
        let err = compiled
            .validate(&payload, ValidationMode::Strict)
            .unwrap_err();
        assert_eq!(err.code, "schema.type_mismatch");
        assert!(err.message.contains("temperature") || err.path.as_deref() == Some("/temperature"));
    }

    #[test]
    fn lenient_mode_accepts_additional_properties() {
        let compiled = CompiledJsonSchema::compile(&schema(), JsonSchemaDraft::Draft07).unwrap();
        let payload = json!({"deviceId": "TEMP-001", "temperature": 23.5, "extra": true});
        assert!(compiled
            .validate(&payload, ValidationMode::Strict)
            .is_err());
        assert!(compiled
            .validate(&payload, ValidationMode::Lenient)
            .is_ok());
    }

    #[test]
    fn warn_only_mode_surfaces_the_same_violation_as_strict() {
        let compiled = CompiledJsonSchema::compile(&schema(), JsonSchemaDraft::Draft07).unwrap();
        let payload = json!({"deviceId": "TEMP-001"});
        let err = compiled
            .validate(&payload, ValidationMode::WarnOnly)
            .unwrap_err();
        assert_eq!(err.code, "schema.missing_required");
    }
}
