//! States of the per-mount volume staging state machine. One such machine
//! runs for every (client pod, claim) pair, entirely on the node agent of the
//! pod's node.
//!
//! ```text
//!       LaunchStagingPod ---------------------+------------------+
//!               |                             |                  |
//!               v                             v                  |
//!        AwaitStagingPod ---------------------+                  |
//!               |                             |                  |
//!               v                             |                  |
//!            Staged                           |                  |
//!               |                             |                  |
//!               v                             v                  |
//!       RemoveStagingPod        RemoveStagingPodAfterFailure     |
//!               |                             |                  |
//!               v                             v                  |
//! +--- LaunchUnstagingPod      LaunchUnstagingPodAfterFailure -->+
//! |             |                             |                  |
//! |             v                             v                  |
//! |     AwaitUnstagingPod       AwaitUnstagingPodAfterFailure    |
//! |             |                             |                  |
//! |             v                             v                  |
//! |    RemoveUnstagingPod      RemoveUnstagingPodAfterFailure    |
//! |             |                             |                  |
//! |             v                             v                  |
//! +-------> Unstaged                    StagingFailed <----------+
//! ```

use tonic::Code;

use super::{Decoder, Encoder, StateDecodeError};

#[derive(Clone, Debug, PartialEq)]
pub enum StagingState {
    LaunchStagingPod,
    AwaitStagingPod {
        staging_pod_namespace: String,
    },
    Staged {
        staging_pod_namespace: String,
    },
    RemoveStagingPod {
        staging_pod_namespace: String,
    },
    LaunchUnstagingPod,
    AwaitUnstagingPod {
        unstaging_pod_namespace: String,
    },
    RemoveUnstagingPod {
        unstaging_pod_namespace: String,
    },
    Unstaged,
    RemoveStagingPodAfterFailure {
        staging_pod_namespace: String,
        error_code: Code,
        error_details: String,
    },
    LaunchUnstagingPodAfterFailure {
        error_code: Code,
        error_details: String,
    },
    AwaitUnstagingPodAfterFailure {
        unstaging_pod_namespace: String,
        error_code: Code,
        error_details: String,
    },
    RemoveUnstagingPodAfterFailure {
        unstaging_pod_namespace: String,
        error_code: Code,
        error_details: String,
    },
    StagingFailed {
        error_code: Code,
        error_details: String,
    },
    UnrecoverableFailure {
        error_code: Code,
        error_details: String,
    },
}

impl StagingState {
    /// Whether this state has no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StagingState::Unstaged
                | StagingState::StagingFailed { .. }
                | StagingState::UnrecoverableFailure { .. }
        )
    }

    /// Whether this state can only be reached after `Staged`. A pending
    /// publish RPC observing one of these states must abort.
    pub fn is_after_staged(&self) -> bool {
        matches!(
            self,
            StagingState::RemoveStagingPod { .. }
                | StagingState::LaunchUnstagingPod
                | StagingState::AwaitUnstagingPod { .. }
                | StagingState::RemoveUnstagingPod { .. }
                | StagingState::Unstaged
        )
    }

    /// The carried error, for states on the failure branch.
    pub fn failure(&self) -> Option<(Code, &str)> {
        match self {
            StagingState::RemoveStagingPodAfterFailure {
                error_code,
                error_details,
                ..
            }
            | StagingState::LaunchUnstagingPodAfterFailure {
                error_code,
                error_details,
            }
            | StagingState::AwaitUnstagingPodAfterFailure {
                error_code,
                error_details,
                ..
            }
            | StagingState::RemoveUnstagingPodAfterFailure {
                error_code,
                error_details,
                ..
            }
            | StagingState::StagingFailed {
                error_code,
                error_details,
            }
            | StagingState::UnrecoverableFailure {
                error_code,
                error_details,
            } => Some((*error_code, error_details)),
            _ => None,
        }
    }

    pub fn to_json(&self) -> String {
        match self {
            StagingState::LaunchStagingPod => Encoder::new("LaunchStagingPod").finish(),
            StagingState::AwaitStagingPod {
                staging_pod_namespace,
            } => Encoder::new("AwaitStagingPod")
                .string("staging_pod_namespace", staging_pod_namespace)
                .finish(),
            StagingState::Staged {
                staging_pod_namespace,
            } => Encoder::new("Staged")
                .string("staging_pod_namespace", staging_pod_namespace)
                .finish(),
            StagingState::RemoveStagingPod {
                staging_pod_namespace,
            } => Encoder::new("RemoveStagingPod")
                .string("staging_pod_namespace", staging_pod_namespace)
                .finish(),
            StagingState::LaunchUnstagingPod => Encoder::new("LaunchUnstagingPod").finish(),
            StagingState::AwaitUnstagingPod {
                unstaging_pod_namespace,
            } => Encoder::new("AwaitUnstagingPod")
                .string("unstaging_pod_namespace", unstaging_pod_namespace)
                .finish(),
            StagingState::RemoveUnstagingPod {
                unstaging_pod_namespace,
            } => Encoder::new("RemoveUnstagingPod")
                .string("unstaging_pod_namespace", unstaging_pod_namespace)
                .finish(),
            StagingState::Unstaged => Encoder::new("Unstaged").finish(),
            StagingState::RemoveStagingPodAfterFailure {
                staging_pod_namespace,
                error_code,
                error_details,
            } => Encoder::new("RemoveStagingPodAfterFailure")
                .string("staging_pod_namespace", staging_pod_namespace)
                .code("error_code", *error_code)
                .string("error_details", error_details)
                .finish(),
            StagingState::LaunchUnstagingPodAfterFailure {
                error_code,
                error_details,
            } => Encoder::new("LaunchUnstagingPodAfterFailure")
                .code("error_code", *error_code)
                .string("error_details", error_details)
                .finish(),
            StagingState::AwaitUnstagingPodAfterFailure {
                unstaging_pod_namespace,
                error_code,
                error_details,
            } => Encoder::new("AwaitUnstagingPodAfterFailure")
                .string("unstaging_pod_namespace", unstaging_pod_namespace)
                .code("error_code", *error_code)
                .string("error_details", error_details)
                .finish(),
            StagingState::RemoveUnstagingPodAfterFailure {
                unstaging_pod_namespace,
                error_code,
                error_details,
            } => Encoder::new("RemoveUnstagingPodAfterFailure")
                .string("unstaging_pod_namespace", unstaging_pod_namespace)
                .code("error_code", *error_code)
                .string("error_details", error_details)
                .finish(),
            StagingState::StagingFailed {
                error_code,
                error_details,
            } => Encoder::new("StagingFailed")
                .code("error_code", *error_code)
                .string("error_details", error_details)
                .finish(),
            StagingState::UnrecoverableFailure {
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
            "LaunchStagingPod" => StagingState::LaunchStagingPod,
            "AwaitStagingPod" => StagingState::AwaitStagingPod {
                staging_pod_namespace: fields.string("staging_pod_namespace")?,
            },
            "Staged" => StagingState::Staged {
                staging_pod_namespace: fields.string("staging_pod_namespace")?,
            },
            "RemoveStagingPod" => StagingState::RemoveStagingPod {
                staging_pod_namespace: fields.string("staging_pod_namespace")?,
            },
            "LaunchUnstagingPod" => StagingState::LaunchUnstagingPod,
            "AwaitUnstagingPod" => StagingState::AwaitUnstagingPod {
                unstaging_pod_namespace: fields.string("unstaging_pod_namespace")?,
            },
            "RemoveUnstagingPod" => StagingState::RemoveUnstagingPod {
                unstaging_pod_namespace: fields.string("unstaging_pod_namespace")?,
            },
            "Unstaged" => StagingState::Unstaged,
            "RemoveStagingPodAfterFailure" => StagingState::RemoveStagingPodAfterFailure {
                staging_pod_namespace: fields.string("staging_pod_namespace")?,
                error_code: fields.code("error_code")?,
                error_details: fields.string("error_details")?,
            },
            "LaunchUnstagingPodAfterFailure" => StagingState::LaunchUnstagingPodAfterFailure {
                error_code: fields.code("error_code")?,
                error_details: fields.string("error_details")?,
            },
            "AwaitUnstagingPodAfterFailure" => StagingState::AwaitUnstagingPodAfterFailure {
                unstaging_pod_namespace: fields.string("unstaging_pod_namespace")?,
                error_code: fields.code("error_code")?,
                error_details: fields.string("error_details")?,
            },
            "RemoveUnstagingPodAfterFailure" => StagingState::RemoveUnstagingPodAfterFailure {
                unstaging_pod_namespace: fields.string("unstaging_pod_namespace")?,
                error_code: fields.code("error_code")?,
                error_details: fields.string("error_details")?,
            },
            "StagingFailed" => StagingState::StagingFailed {
                error_code: fields.code("error_code")?,
                error_details: fields.string("error_details")?,
            },
            "UnrecoverableFailure" => StagingState::UnrecoverableFailure {
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

    fn round_trip(state: StagingState) {
        let json = state.to_json();
        assert_eq!(StagingState::from_json(&json).unwrap(), state);
    }

    #[test]
    fn states_round_trip() {
        round_trip(StagingState::LaunchStagingPod);
        round_trip(StagingState::AwaitStagingPod {
            staging_pod_namespace: "default".into(),
        });
        round_trip(StagingState::Staged {
            staging_pod_namespace: "default".into(),
        });
        round_trip(StagingState::Unstaged);
        round_trip(StagingState::RemoveStagingPodAfterFailure {
            staging_pod_namespace: "default".into(),
            error_code: Code::InvalidArgument,
            error_details: "Staging pod failed: boom".into(),
        });
        round_trip(StagingState::StagingFailed {
            error_code: Code::InvalidArgument,
            error_details: "/pav/volume must resolve to a block special file".into(),
        });
        round_trip(StagingState::UnrecoverableFailure {
            error_code: Code::InvalidArgument,
            error_details: "Unstaging pod failed: boom".into(),
        });
    }

    #[test]
    fn decoding_is_strict() {
        assert!(StagingState::from_json(r#"{"name": "NotAState"}"#).is_err());
        assert!(StagingState::from_json(r#"{"name": "Staged"}"#).is_err());
        assert!(StagingState::from_json(
            r#"{"name": "Unstaged", "staging_pod_namespace": "default"}"#
        )
        .is_err());
    }

    #[test]
    fn after_staged_membership() {
        assert!(StagingState::RemoveStagingPod {
            staging_pod_namespace: "default".into()
        }
        .is_after_staged());
        assert!(StagingState::Unstaged.is_after_staged());
        assert!(!StagingState::Staged {
            staging_pod_namespace: "default".into()
        }
        .is_after_staged());
        assert!(!StagingState::RemoveStagingPodAfterFailure {
            staging_pod_namespace: "default".into(),
            error_code: Code::InvalidArgument,
            error_details: "x".into()
        }
        .is_after_staged());
    }

    #[test]
    fn terminal_membership() {
        assert!(StagingState::Unstaged.is_terminal());
        assert!(StagingState::StagingFailed {
            error_code: Code::InvalidArgument,
            error_details: "x".into()
        }
        .is_terminal());
        assert!(!StagingState::Staged {
            staging_pod_namespace: "default".into()
        }
        .is_terminal());
    }
}
