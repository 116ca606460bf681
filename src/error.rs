use thiserror::Error;

use crate::zulip::{BAD_EVENT_QUEUE_ID, RATE_LIMIT_HIT, ZulipError};

/// How the relay reacts to a failure.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Retried after the poll delay; nothing is lost.
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    /// The event queue expired server-side; re-register with the original options.
    #[error("event queue no longer recognised: {0}")]
    StaleSubscription(String),
    /// The remote API rejected a well-formed request; the operation is dropped.
    #[error("remote rejected request ({code}): {msg}")]
    RemoteValidation { code: String, msg: String },
    /// A correlated channel or message vanished on one side.
    #[error("dangling reference: {0}")]
    DanglingReference(String),
    #[error("linkifier pattern rejected: {0}")]
    PatternCompilation(String),
    #[error("event queue registration failed: {0}")]
    Registration(String),
}

impl BridgeError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::TransientNetwork(_) | BridgeError::StaleSubscription(_)
        )
    }
}

impl From<ZulipError> for BridgeError {
    fn from(error: ZulipError) -> Self {
        match error {
            ZulipError::Http(e) => BridgeError::TransientNetwork(e.to_string()),
            ZulipError::Decode(msg) => BridgeError::TransientNetwork(msg),
            ZulipError::Server { status, msg } => {
                BridgeError::TransientNetwork(format!("{status}: {msg}"))
            }
            ZulipError::NotFound(msg) => BridgeError::DanglingReference(msg),
            ZulipError::Api { code, msg } if code == BAD_EVENT_QUEUE_ID => {
                BridgeError::StaleSubscription(msg)
            }
            ZulipError::Api { code, msg } if code == RATE_LIMIT_HIT => {
                BridgeError::TransientNetwork(msg)
            }
            ZulipError::Api { code, msg } => BridgeError::RemoteValidation { code, msg },
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::BridgeError;
    use crate::zulip::ZulipError;

    fn api(code: &str) -> ZulipError {
        ZulipError::Api {
            code: code.to_string(),
            msg: "boom".to_string(),
        }
    }

    #[test_case("BAD_EVENT_QUEUE_ID", true ; "stale queue is retried")]
    #[test_case("RATE_LIMIT_HIT", true ; "rate limit is retried")]
    #[test_case("BAD_REQUEST", false ; "validation error is dropped")]
    fn zulip_api_errors_are_classified(code: &str, retryable: bool) {
        assert_eq!(BridgeError::from(api(code)).is_retryable(), retryable);
    }

    #[test]
    fn bad_event_queue_maps_to_stale_subscription() {
        assert!(matches!(
            BridgeError::from(api("BAD_EVENT_QUEUE_ID")),
            BridgeError::StaleSubscription(_)
        ));
    }

    #[test]
    fn server_errors_are_transient() {
        let error = BridgeError::from(ZulipError::Server {
            status: 502,
            msg: "Bad Gateway".to_string(),
        });
        assert!(error.is_retryable());
    }

    #[test]
    fn decode_failures_are_transient() {
        assert!(matches!(
            BridgeError::from(ZulipError::Decode("eof".to_string())),
            BridgeError::TransientNetwork(_)
        ));
    }
}
