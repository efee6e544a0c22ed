//! Protobuf message-type validation against a loaded descriptor set.
//!
//! Validation consists of attempting to parse the wire-format payload into
//! the bound message type; there is no further semantic check beyond what
//! the wire format itself enforces (required-field presence for proto2,
//! well-formed varints/tags, etc).

use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor};
use thiserror::Error;

use super::ValidationError;

/// Errors raised while resolving a protobuf message type within a
/// descriptor set.
#[derive(Debug, Error)]
pub enum ProtobufSchemaError {
    /// The descriptor set bytes could not be decoded.
    #[error("invalid descriptor set: {0}")]
    InvalidDescriptorSet(#[from] prost_reflect::DescriptorError),

    /// `message_type` was not found in the descriptor set.
    #[error("message type {0:?} not found in descriptor set")]
    MessageTypeNotFound(String),
}

/// A protobuf message type resolved within a loaded descriptor set.
pub struct CompiledProtobufSchema {
    message_descriptor: MessageDescriptor,
}

impl CompiledProtobufSchema {
    /// Decodes `descriptor_set_bytes` (a serialized `FileDescriptorSet`) and
    /// resolves `message_type` (fully qualified, e.g. `pkg.Message`) within
    /// it.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor set bytes are malformed or the
    /// message type cannot be found.
    pub fn compile(
        descriptor_set_bytes: &[u8],
        message_type: &str,
    ) -> Result<Self, ProtobufSchemaError> {
        let pool = DescriptorPool::decode(descriptor_set_bytes)?;
        let message_descriptor = pool
            .get_message_by_name(message_type)
            .ok_or_else(|| ProtobufSchemaError::MessageTypeNotFound(message_type.to_string()))?;
        Ok(Self { message_descriptor })
    }

    /// Attempts to parse `payload` as the bound message type.
    pub fn validate(&self, payload: &[u8]) -> Result<(), ValidationError> {
        DynamicMessage::decode(self.message_descriptor.clone(), payload)
            .map(|_| ())
            .map_err(|e| ValidationError {
                code: "protobuf.parse_error".to_string(),
                message: e.to_string(),
                path: None,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;
    use prost_reflect::prost_types::{
        DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
        field_descriptor_proto::{Label, Type},
    };

    fn telemetry_descriptor_set() -> Vec<u8> {
        let field = FieldDescriptorProto {
            name: Some("device_id".to_string()),
            number: Some(1),
            label: Some(Label::Optional as i32),
            r#type: Some(Type::String as i32),
            json_name: Some("deviceId".to_string()),
            ..Default::default()
        };
        let message = DescriptorProto {
            name: Some("Telemetry".to_string()),
            field: vec![field],
            ..Default::default()
        };
        let file = FileDescriptorProto {
            name: Some("telemetry.proto".to_string()),
            package: Some("governance".to_string()),
            message_type: vec![message],
            syntax: Some("proto3".to_string()),
            ..Default::default()
        };
        let set = FileDescriptorSet { file: vec![file] };
        set.encode_to_vec()
    }

    #[test]
    fn resolves_message_type_and_validates_wire_bytes() {
        let bytes = telemetry_descriptor_set();
        let compiled =
            CompiledProtobufSchema::compile(&bytes, "governance.Telemetry").unwrap();

        let descriptor = DescriptorPool::decode(bytes.as_slice())
            .unwrap()
            .get_message_by_name("governance.Telemetry")
            .unwrap();
        let mut dynamic = DynamicMessage::new(descriptor);
        dynamic.set_field_by_name("device_id", prost_reflect::Value::String("d1".to_string()));
        let payload = dynamic.encode_to_vec();

        assert!(compiled.validate(&payload).is_ok());
    }

    #[test]
    fn unknown_message_type_fails_to_compile() {
        let bytes = telemetry_descriptor_set();
        let result = CompiledProtobufSchema::compile(&bytes, "governance.Missing");
        assert!(matches!(
            result,
            Err(ProtobufSchemaError::MessageTypeNotFound(_))
        ));
    }

    #[test]
    fn malformed_payload_is_a_validation_error() {
        let bytes = telemetry_descriptor_set();
        let compiled =
            CompiledProtobufSchema::compile(&bytes, "governance.Telemetry").unwrap();
        let err = compiled.validate(&[0xFF, 0xFF, 0xFF]).unwrap_err();
        assert_eq!(err.code, "protobuf.parse_error");
    }
}
