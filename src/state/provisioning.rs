//! States of the per-claim volume provisioning state machine.
//!
//! The diagram below depicts the possible transitions, except those that end
//! in `UnrecoverableFailure`. States enclosed in `[ ]` are handled by the
//! controller agent; others are either handled by a node agent or are not
//! handled at all.
//!
//! ```text
//! +-- [LaunchValidationPod] ---------------------------------------+
//! |             |                                                  |
//! |             v                                                  |
//! |    AwaitValidationPod ---------------------+                   |
//! |             |                              |                   |
//! |             v                              v                   |
//! |    RemoveValidationPod      RemoveValidationPodAfterFailure -->+
//! |             |                                                  |
//! |             v                                                  |
//! +--> [LaunchCreationPod] --------------------------------------->+
//!         |     |                                                  |
//! +-------+     v                                                  |
//! |     AwaitCreationPod ----------------------+                   |
//! |             |                              |                   |
//! |             v                              v                   |
//! |     RemoveCreationPod        RemoveCreationPodAfterFailure     |
//! |             |                              |                   |
//! |             v                              |                   |
//! +--------> Created                           |                   |
//!               |                              v                   |
//!               v                                                  |
//! +--- [LaunchDeletionPod]      [LaunchDeletionPodAfterFailure] -->+
//! |             |                              |                   |
//! |             v                              v                   |
//! |     AwaitDeletionPod         AwaitDeletionPodAfterFailure      |
//! |             |                              |                   |
//! |             v                              v                   |
//! |     RemoveDeletionPod        RemoveDeletionPodAfterFailure     |
//! |             |                              |                   |
//! |             v                              v                   |
//! +--------> Deleted                    CreationFailed <-----------+
//! ```

use tonic::Code;

use super::{Decoder, Encoder, StateDecodeError};

#[derive(Clone, Debug, PartialEq)]
pub enum ProvisioningState {
    LaunchValidationPod,
    AwaitValidationPod {
        validation_pod_namespace: String,
    },
    RemoveValidationPod {
        validation_pod_namespace: String,
    },
    LaunchCreationPod,
    AwaitCreationPod {
        creation_pod_namespace: String,
        handle: Option<String>,
        capacity: Option<i64>,
    },
    RemoveCreationPod {
        creation_pod_namespace: String,
        handle: String,
        capacity: i64,
    },
    Created {
        handle: String,
        capacity: i64,
    },
    LaunchDeletionPod,
    AwaitDeletionPod {
        deletion_pod_namespace: String,
    },
    RemoveDeletionPod {
        deletion_pod_namespace: String,
    },
    Deleted,
    RemoveValidationPodAfterFailure {
        validation_pod_namespace: String,
        error_code: Code,
        error_details: String,
    },
    RemoveCreationPodAfterFailure {
        creation_pod_namespace: String,
        error_code: Code,
        error_details: String,
    },
    LaunchDeletionPodAfterFailure {
        error_code: Code,
        error_details: String,
    },
    AwaitDeletionPodAfterFailure {
        deletion_pod_namespace: String,
        error_code: Code,
        error_details: String,
    },
    RemoveDeletionPodAfterFailure {
        deletion_pod_namespace: String,
        error_code: Code,
        error_details: String,
    },
    CreationFailed {
        error_code: Code,
        error_details: String,
    },
    UnrecoverableFailure {
        error_code: Code,
        error_details: String,
    },
}

impl ProvisioningState {
    /// Whether this state has no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProvisioningState::Created { .. }
                | ProvisioningState::Deleted
                | ProvisioningState::CreationFailed { .. }
                | ProvisioningState::UnrecoverableFailure { .. }
        )
    }

    /// Whether this state can only be reached after `Created`. A pending
    /// creation RPC observing one of these states must abort.
    pub fn is_after_created(&self) -> bool {
        matches!(
            self,
            ProvisioningState::LaunchDeletionPod
                | ProvisioningState::AwaitDeletionPod { .. }
                | ProvisioningState::RemoveDeletionPod { .. }
                | ProvisioningState::Deleted
        )
    }

    /// The carried error, for states on the failure branch.
    pub fn failure(&self) -> Option<(Code, &str)> {
        match self {
            ProvisioningState::RemoveValidationPodAfterFailure {
                error_code,
                error_details,
                ..
            }
            | ProvisioningState::RemoveCreationPodAfterFailure {
                error_code,
                error_details,
                ..
            }
            | ProvisioningState::LaunchDeletionPodAfterFailure {
                error_code,
                error_details,
            }
            | ProvisioningState::AwaitDeletionPodAfterFailure {
                error_code,
                error_details,
                ..
            }
            | ProvisioningState::RemoveDeletionPodAfterFailure {
                error_code,
                error_details,
                ..
            }
            | ProvisioningState::CreationFailed {
                error_code,
                error_details,
            }
            | ProvisioningState::UnrecoverableFailure {
                error_code,
                error_details,
            } => Some((*error_code, error_details)),
            _ => None,
        }
    }

    pub fn to_json(&self) -> String {
        match self {
            ProvisioningState::LaunchValidationPod => Encoder::new("LaunchValidationPod").finish(),
            ProvisioningState::AwaitValidationPod {
                validation_pod_namespace,
            } => Encoder::new("AwaitValidationPod")
                .string("validation_pod_namespace", validation_pod_namespace)
                .finish(),
            ProvisioningState::RemoveValidationPod {
                validation_pod_namespace,
            } => Encoder::new("RemoveValidationPod")
                .string("validation_pod_namespace", validation_pod_namespace)
                .finish(),
            ProvisioningState::LaunchCreationPod => Encoder::new("LaunchCreationPod").finish(),
            ProvisioningState::AwaitCreationPod {
                creation_pod_namespace,
                handle,
                capacity,
            } => Encoder::new("AwaitCreationPod")
                .string("creation_pod_namespace", creation_pod_namespace)
                .optional_string("handle", handle)
                .optional_integer("capacity", capacity)
                .finish(),
            ProvisioningState::RemoveCreationPod {
                creation_pod_namespace,
                handle,
                capacity,
            } => Encoder::new("RemoveCreationPod")
                .string("creation_pod_namespace", creation_pod_namespace)
                .string("handle", handle)
                .integer("capacity", *capacity)
                .finish(),
            ProvisioningState::Created { handle, capacity } => Encoder::new("Created")
                .string("handle", handle)
                .integer("capacity", *capacity)
                .finish(),
            ProvisioningState::LaunchDeletionPod => Encoder::new("LaunchDeletionPod").finish(),
            ProvisioningState::AwaitDeletionPod {
                deletion_pod_namespace,
            } => Encoder::new("AwaitDeletionPod")
                .string("deletion_pod_namespace", deletion_pod_namespace)
                .finish(),
            ProvisioningState::RemoveDeletionPod {
                deletion_pod_namespace,
            } => Encoder::new("RemoveDeletionPod")
                .string("deletion_pod_namespace", deletion_pod_namespace)
                .finish(),
            ProvisioningState::Deleted => Encoder::new("Deleted").finish(),
            ProvisioningState::RemoveValidationPodAfterFailure {
                validation_pod_namespace,
                error_code,
                error_details,
            } => Encoder::new("RemoveValidationPodAfterFailure")
                .string("validation_pod_namespace", validation_pod_namespace)
                .code("error_code", *error_code)
                .string("error_details", error_details)
                .finish(),
            ProvisioningState::RemoveCreationPodAfterFailure {
                creation_pod_namespace,
                error_code,
                error_details,
            } => Encoder::new("RemoveCreationPodAfterFailure")
                .string("creation_pod_namespace", creation_pod_namespace)
                .code("error_code", *error_code)
                .string("error_details", error_details)
                .finish(),
            ProvisioningState::LaunchDeletionPodAfterFailure {
                error_code,
                error_details,
            } => Encoder::new("LaunchDeletionPodAfterFailure")
                .code("error_code", *error_code)
                .string("error_details", error_details)
                .finish(),
            ProvisioningState::AwaitDeletionPodAfterFailure {
                deletion_pod_namespace,
                error_code,
                error_details,
            } => Encoder::new("AwaitDeletionPodAfterFailure")
                .string("deletion_pod_namespace", deletion_pod_namespace)
                .code("error_code", *error_code)
                .string("error_details", error_details)
                .finish(),
            ProvisioningState::RemoveDeletionPodAfterFailure {
                deletion_pod_namespace,
                error_code,
                error_details,
            } => Encoder::new("RemoveDeletionPodAfterFailure")
                .string("deletion_pod_namespace", deletion_pod_namespace)
                .code("error_code", *error_code)
                .string("error_details", error_details)
                .finish(),
            ProvisioningState::CreationFailed {
                error_code,
                error_details,
            } => Encoder::new("CreationFailed")
                .code("error_code", *error_code)
                .string("error_details", error_details)
                .finish(),
            ProvisioningState::UnrecoverableFailure {
                error_code,
                error_details,
            } => Encoder::new("UnrecoverableFailure")
                .code("error_code", *error_code)
                .string("error_details", error_details)
                .finish(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, StateDecodeError> {
        let (name, mut fields) = Decoder::parse(json)?;
        let state = match name.as_str() {
            "LaunchValidationPod" => ProvisioningState::LaunchValidationPod,
            "AwaitValidationPod" => ProvisioningState::AwaitValidationPod {
                validation_pod_namespace: fields.string("validation_pod_namespace")?,
            },
            "RemoveValidationPod" => ProvisioningState::RemoveValidationPod {
                validation_pod_namespace: fields.string("validation_pod_namespace")?,
            },
            "LaunchCreationPod" => ProvisioningState::LaunchCreationPod,
            "AwaitCreationPod" => ProvisioningState::AwaitCreationPod {
                creation_pod_namespace: fields.string("creation_pod_namespace")?,
                handle: fields.optional_string("handle")?,
                capacity: fields.optional_integer("capacity")?,
            },
            "RemoveCreationPod" => ProvisioningState::RemoveCreationPod {
                creation_pod_namespace: fields.string("creation_pod_namespace")?,
                handle: fields.string("handle")?,
                capacity: fields.integer("capacity")?,
            },
            "Created" => ProvisioningState::Created {
                handle: fields.string("handle")?,
                capacity: fields.integer("capacity")?,
            },
            "LaunchDeletionPod" => ProvisioningState::LaunchDeletionPod,
            "AwaitDeletionPod" => ProvisioningState::AwaitDeletionPod {
                deletion_pod_namespace: fields.string("deletion_pod_namespace")?,
            },
            "RemoveDeletionPod" => ProvisioningState::RemoveDeletionPod {
                deletion_pod_namespace: fields.string("deletion_pod_namespace")?,
            },
            "Deleted" => ProvisioningState::Deleted,
            "RemoveValidationPodAfterFailure" => ProvisioningState::RemoveValidationPodAfterFailure {
                validation_pod_namespace: fields.string("validation_pod_namespace")?,
                error_code: fields.code("error_code")?,
                error_details: fields.string("error_details")?,
            },
            "RemoveCreationPodAfterFailure" => ProvisioningState::RemoveCreationPodAfterFailure {
                creation_pod_namespace: fields.string("creation_pod_namespace")?,
                error_code: fields.code("error_code")?,
                error_details: fields.string("error_details")?,
            },
            "LaunchDeletionPodAfterFailure" => ProvisioningState::LaunchDeletionPodAfterFailure {
                error_code: fields.code("error_code")?,
                error_details: fields.string("error_details")?,
            },
            "AwaitDeletionPodAfterFailure" => ProvisioningState::AwaitDeletionPodAfterFailure {
                deletion_pod_namespace: fields.string("deletion_pod_namespace")?,
                error_code: fields.code("error_code")?,
                error_details: fields.string("error_details")?,
            },
            "RemoveDeletionPodAfterFailure" => ProvisioningState::RemoveDeletionPodAfterFailure {
                deletion_pod_namespace: fields.string("deletion_pod_namespace")?,
                error_code: fields.code("error_code")?,
                error_details: fields.string("error_details")?,
            },
            "CreationFailed" => ProvisioningState::CreationFailed {
                error_code: fields.code("error_code")?,
                error_details: fields.string("error_details")?,
            },
            "UnrecoverableFailure" => ProvisioningState::UnrecoverableFailure {
                error_code: fields.code("error_code")?,
                error_details: fields.string("error_details")?,
            },
            _ => return Err(StateDecodeError::UnknownVariant(name)),
        };
        fields.finish()?;
        Ok(state)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn round_trip(state: ProvisioningState) {
        let json = state.to_json();
        assert_eq!(ProvisioningState::from_json(&json).unwrap(), state);
    }

    #[test]
    fn states_round_trip() {
        round_trip(ProvisioningState::LaunchValidationPod);
        round_trip(ProvisioningState::AwaitValidationPod {
            validation_pod_namespace: "default".into(),
        });
        round_trip(ProvisioningState::AwaitCreationPod {
            creation_pod_namespace: "default".into(),
            handle: None,
            capacity: Some(10_737_418_240),
        });
        round_trip(ProvisioningState::AwaitCreationPod {
            creation_pod_namespace: "default".into(),
            handle: Some("vol-1".into()),
            capacity: None,
        });
        round_trip(ProvisioningState::RemoveCreationPod {
            creation_pod_namespace: "default".into(),
            handle: "pvc-123".into(),
            capacity: 1024,
        });
        round_trip(ProvisioningState::Created {
            handle: "pvc-123".into(),
            capacity: 1024,
        });
        round_trip(ProvisioningState::RemoveValidationPodAfterFailure {
            validation_pod_namespace: "default".into(),
            error_code: Code::InvalidArgument,
            error_details: "Validation pod failed: boom".into(),
        });
        round_trip(ProvisioningState::CreationFailed {
            error_code: Code::InvalidArgument,
            error_details: "Creation pod failed: boom".into(),
        });
        round_trip(ProvisioningState::UnrecoverableFailure {
            error_code: Code::Internal,
            error_details: "Deletion pod failed: boom".into(),
        });
    }

    #[test]
    fn integers_are_encoded_as_strings() {
        let json = ProvisioningState::Created {
            handle: "pvc-123".into(),
            capacity: 10_737_418_240,
        }
        .to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["name"], "Created");
        assert_eq!(value["capacity"], "10737418240");
    }

    #[test]
    fn absent_optionals_are_encoded_as_null() {
        let json = ProvisioningState::AwaitCreationPod {
            creation_pod_namespace: "default".into(),
            handle: None,
            capacity: None,
        }
        .to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value["handle"].is_null());
        assert!(value["capacity"].is_null());
    }

    #[test]
    fn decoding_is_strict() {
        // not an object
        assert!(ProvisioningState::from_json("[]").is_err());
        // no name
        assert!(ProvisioningState::from_json("{}").is_err());
        // unknown variant
        assert!(ProvisioningState::from_json(r#"{"name": "Nonsense"}"#).is_err());
        // missing field
        assert!(ProvisioningState::from_json(r#"{"name": "AwaitValidationPod"}"#).is_err());
        // extra field
        assert!(
            ProvisioningState::from_json(r#"{"name": "LaunchValidationPod", "extra": "x"}"#)
                .is_err()
        );
        // mistyped field: integers must be string-encoded
        assert!(ProvisioningState::from_json(
            r#"{"name": "Created", "handle": "h", "capacity": 1024}"#
        )
        .is_err());
        // non-numeric capacity
        assert!(ProvisioningState::from_json(
            r#"{"name": "Created", "handle": "h", "capacity": "lots"}"#
        )
        .is_err());
        // unknown error code
        assert!(ProvisioningState::from_json(
            r#"{"name": "CreationFailed", "error_code": "EISDIR", "error_details": "x"}"#
        )
        .is_err());
    }

    #[test]
    fn terminal_and_after_created_membership() {
        assert!(ProvisioningState::Deleted.is_terminal());
        assert!(ProvisioningState::Created {
            handle: "h".into(),
            capacity: 1
        }
        .is_terminal());
        assert!(!ProvisioningState::LaunchCreationPod.is_terminal());

        assert!(ProvisioningState::LaunchDeletionPod.is_after_created());
        assert!(ProvisioningState::Deleted.is_after_created());
        assert!(!ProvisioningState::Created {
            handle: "h".into(),
            capacity: 1
        }
        .is_after_created());
        assert!(!ProvisioningState::LaunchDeletionPodAfterFailure {
            error_code: Code::InvalidArgument,
            error_details: "x".into()
        }
        .is_after_created());
    }
}
