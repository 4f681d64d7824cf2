//! Canonical JSON encoding of the finite-state-machine states stored in
//! object annotations.
//!
//! A state is encoded as a JSON object with a `"name"` field naming the
//! variant and one field per variant datum. All primitive values serialize as
//! strings (integers and error codes included); optional values serialize as
//! JSON `null`. Decoding is strict: an unknown variant name, a missing or
//! extra field, or a mistyped field value is an error.

mod provisioning;
mod staging;

pub use provisioning::ProvisioningState;
pub use staging::StagingState;

use serde_json::{Map, Value};
use thiserror::Error;
use tonic::Code;

#[derive(Debug, Error)]
pub enum StateDecodeError {
    #[error("state annotation is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("state is not a JSON object")]
    NotAnObject,
    #[error("state object has no \"name\" field")]
    MissingName,
    #[error("unknown state variant {0:?}")]
    UnknownVariant(String),
    #[error("missing field {0:?}")]
    MissingField(&'static str),
    #[error("field {0:?} has an invalid value")]
    InvalidField(&'static str),
    #[error("unexpected fields: {0}")]
    UnexpectedFields(String),
}

/// The canonical gRPC name of a status code, as stored in `error_code` fields.
fn code_name(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "CANCELLED",
        Code::Unknown => "UNKNOWN",
        Code::InvalidArgument => "INVALID_ARGUMENT",
        Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
        Code::NotFound => "NOT_FOUND",
        Code::AlreadyExists => "ALREADY_EXISTS",
        Code::PermissionDenied => "PERMISSION_DENIED",
        Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
        Code::FailedPrecondition => "FAILED_PRECONDITION",
        Code::Aborted => "ABORTED",
        Code::OutOfRange => "OUT_OF_RANGE",
        Code::Unimplemented => "UNIMPLEMENTED",
        Code::Internal => "INTERNAL",
        Code::Unavailable => "UNAVAILABLE",
        Code::DataLoss => "DATA_LOSS",
        Code::Unauthenticated => "UNAUTHENTICATED",
    }
}

fn code_from_name(name: &str) -> Option<Code> {
    let code = match name {
        "OK" => Code::Ok,
        "CANCELLED" => Code::Cancelled,
        "UNKNOWN" => Code::Unknown,
        "INVALID_ARGUMENT" => Code::InvalidArgument,
        "DEADLINE_EXCEEDED" => Code::DeadlineExceeded,
        "NOT_FOUND" => Code::NotFound,
        "ALREADY_EXISTS" => Code::AlreadyExists,
        "PERMISSION_DENIED" => Code::PermissionDenied,
        "RESOURCE_EXHAUSTED" => Code::ResourceExhausted,
        "FAILED_PRECONDITION" => Code::FailedPrecondition,
        "ABORTED" => Code::Aborted,
        "OUT_OF_RANGE" => Code::OutOfRange,
        "UNIMPLEMENTED" => Code::Unimplemented,
        "INTERNAL" => Code::Internal,
        "UNAVAILABLE" => Code::Unavailable,
        "DATA_LOSS" => Code::DataLoss,
        "UNAUTHENTICATED" => Code::Unauthenticated,
        _ => return None,
    };
    Some(code)
}

/// Accumulates the fields of a state being encoded.
struct Encoder {
    fields: Map<String, Value>,
}

impl Encoder {
    fn new(name: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("name".to_owned(), Value::String(name.to_owned()));
        Encoder { fields }
    }

    fn string(mut self, name: &str, value: &str) -> Self {
        self.fields
            .insert(name.to_owned(), Value::String(value.to_owned()));
        self
    }

    fn integer(self, name: &str, value: i64) -> Self {
        let text = value.to_string();
        self.string(name, &text)
    }

    fn optional_string(mut self, name: &str, value: &Option<String>) -> Self {
        let encoded = match value {
            Some(value) => Value::String(value.clone()),
            None => Value::Null,
        };
        self.fields.insert(name.to_owned(), encoded);
        self
    }

    fn optional_integer(mut self, name: &str, value: &Option<i64>) -> Self {
        let encoded = match value {
            Some(value) => Value::String(value.to_string()),
            None => Value::Null,
        };
        self.fields.insert(name.to_owned(), encoded);
        self
    }

    fn code(self, name: &str, value: Code) -> Self {
        let text = code_name(value);
        self.string(name, text)
    }

    fn finish(self) -> String {
        Value::Object(self.fields).to_string()
    }
}

/// Consumes the fields of a state being decoded, enforcing that every field
/// is present, correctly typed, and that no field is left over.
struct Decoder {
    fields: Map<String, Value>,
}

impl Decoder {
    fn parse(json: &str) -> Result<(String, Self), StateDecodeError> {
        let value: Value = serde_json::from_str(json)?;
        let mut fields = match value {
            Value::Object(fields) => fields,
            _ => return Err(StateDecodeError::NotAnObject),
        };
        let name = match fields.remove("name") {
            Some(Value::String(name)) => name,
            _ => return Err(StateDecodeError::MissingName),
        };
        Ok((name, Decoder { fields }))
    }

    fn string(&mut self, name: &'static str) -> Result<String, StateDecodeError> {
        match self.fields.remove(name) {
            Some(Value::String(value)) => Ok(value),
            Some(_) => Err(StateDecodeError::InvalidField(name)),
            None => Err(StateDecodeError::MissingField(name)),
        }
    }

    fn integer(&mut self, name: &'static str) -> Result<i64, StateDecodeError> {
        self.string(name)?
            .parse()
            .map_err(|_| StateDecodeError::InvalidField(name))
    }

    fn optional_string(&mut self, name: &'static str) -> Result<Option<String>, StateDecodeError> {
        match self.fields.remove(name) {
            Some(Value::String(value)) => Ok(Some(value)),
            Some(Value::Null) => Ok(None),
            Some(_) => Err(StateDecodeError::InvalidField(name)),
            None => Err(StateDecodeError::MissingField(name)),
        }
    }

    fn optional_integer(&mut self, name: &'static str) -> Result<Option<i64>, StateDecodeError> {
        match self.optional_string(name)? {
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| StateDecodeError::InvalidField(name)),
            None => Ok(None),
        }
    }

    fn code(&mut self, name: &'static str) -> Result<Code, StateDecodeError> {
        let value = self.string(name)?;
        code_from_name(&value).ok_or(StateDecodeError::InvalidField(name))
    }

    fn finish(self) -> Result<(), StateDecodeError> {
        if self.fields.is_empty() {
            Ok(())
        } else {
            let names = self.fields.keys().cloned().collect::<Vec<_>>().join(", ");
            Err(StateDecodeError::UnexpectedFields(names))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn code_names_round_trip() {
        for code in [
            Code::Ok,
            Code::InvalidArgument,
            Code::FailedPrecondition,
            Code::Aborted,
            Code::Internal,
        ] {
            assert_eq!(code_from_name(code_name(code)), Some(code));
        }
        assert_eq!(code_from_name("NOT_A_CODE"), None);
    }
}
