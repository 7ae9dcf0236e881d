// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wire framing for the WebSocket protocol (§6.1). All application frames
//! are UTF-8 JSON; the outermost JSON-emitting boundary lives here, per
//! §7's propagation rule and §9's "error carriage" note.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dispatcher::DispatchEvent;
use crate::errors::ActionError;
use crate::txlog::{Bundle, TransactionRecord};

/// Maximum size, in bytes, of an inbound frame (§4.3 framing and limits).
pub const MAX_FRAME_BYTES: usize = 400 * 1024;

/// Client -> server request envelope.
#[derive(Deserialize, Debug)]
pub struct IncomingFrame {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub action: String,
    #[serde(default)]
    pub params: Value,
}

/// HTTP-convention status codes carried in `response.status` (§6.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Status(pub u16);

impl Status {
    pub const OK: Status = Status(200);
    pub const BAD_REQUEST: Status = Status(400);
    pub const UNAUTHORIZED: Status = Status(401);
    pub const FORBIDDEN: Status = Status(403);
    pub const NOT_FOUND: Status = Status(404);
    pub const TOO_MANY_REQUESTS: Status = Status(429);
    pub const INTERNAL_ERROR: Status = Status(500);
    pub const SERVICE_UNAVAILABLE: Status = Status(503);
    pub const GATEWAY_TIMEOUT: Status = Status(504);
}

impl From<&ActionError> for Status {
    fn from(err: &ActionError) -> Self {
        match err {
            ActionError::BadRequest(_) => Status::BAD_REQUEST,
            ActionError::Unauthorized => Status::UNAUTHORIZED,
            ActionError::Forbidden => Status::FORBIDDEN,
            ActionError::NotFound => Status::NOT_FOUND,
            ActionError::TooManyRequests => Status::TOO_MANY_REQUESTS,
            ActionError::Internal(_) => Status::INTERNAL_ERROR,
            ActionError::ServiceUnavailable => Status::SERVICE_UNAVAILABLE,
            ActionError::GatewayTimeout => Status::GATEWAY_TIMEOUT,
        }
    }
}

#[derive(Serialize, Debug)]
pub struct ResponseBody {
    pub status: u16,
    pub data: Value,
}

/// Server -> client response to a specific `requestId` (§6.1).
#[derive(Serialize, Debug)]
pub struct OutgoingResponse {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub route: String,
    pub response: ResponseBody,
}

impl OutgoingResponse {
    pub fn ok(request_id: String, route: impl Into<String>, data: Value) -> Self {
        Self {
            request_id,
            route: route.into(),
            response: ResponseBody {
                status: Status::OK.0,
                data,
            },
        }
    }

    pub fn error(request_id: String, route: impl Into<String>, err: &ActionError) -> Self {
        let status = Status::from(err);
        let data = if status == Status::TOO_MANY_REQUESTS {
            serde_json::json!({ "retryDelay": crate::rate_limiter::RETRY_DELAY_MS })
        } else {
            serde_json::json!({ "message": err.to_string() })
        };
        Self {
            request_id,
            route: route.into(),
            response: ResponseBody {
                status: status.0,
                data,
            },
        }
    }
}

/// Server -> client frames with no `requestId` (§6.1).
#[derive(Debug, Clone)]
pub enum OutgoingMessage {
    /// Sent once on upgrade, carrying the key-validation challenge.
    Connection {
        key_salts: Vec<u8>,
        encrypted_validation_message: Vec<u8>,
    },
    Ping,
    TransactionLog(Vec<TransactionRecord>),
    BundlePublished(Bundle),
    SessionRevoked,
    /// A plain-text, non-JSON protocol error (oversized frame, unknown
    /// action): §4.3, §9 open question on the unknown-action branch.
    PlainTextError(String),
    Response(std::sync::Arc<OutgoingResponse>),
}

impl From<DispatchEvent> for OutgoingMessage {
    fn from(event: DispatchEvent) -> Self {
        match event {
            DispatchEvent::TransactionLog(records) => OutgoingMessage::TransactionLog(records),
            DispatchEvent::BundlePublished(bundle) => OutgoingMessage::BundlePublished(bundle),
        }
    }
}

#[derive(Serialize)]
struct WireUnsolicited<'a> {
    route: &'a str,
    response: ResponseBody,
}

impl OutgoingMessage {
    /// Encode this message as the bytes that should be written to the
    /// transport. Plain-text protocol errors are not JSON, per §4.3.
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        match self {
            OutgoingMessage::PlainTextError(msg) => Ok(msg.clone().into_bytes()),
            OutgoingMessage::Response(resp) => {
                serde_json::to_vec(resp.as_ref()).map_err(|e| e.to_string())
            }
            OutgoingMessage::Connection {
                key_salts,
                encrypted_validation_message,
            } => {
                let wire = WireUnsolicited {
                    route: "Connection",
                    response: ResponseBody {
                        status: Status::OK.0,
                        data: serde_json::json!({
                            "keySalts": key_salts,
                            "encryptedValidationMessage": encrypted_validation_message,
                        }),
                    },
                };
                serde_json::to_vec(&wire).map_err(|e| e.to_string())
            }
            OutgoingMessage::Ping => {
                let wire = WireUnsolicited {
                    route: "Ping",
                    response: ResponseBody {
                        status: Status::OK.0,
                        data: Value::Null,
                    },
                };
                serde_json::to_vec(&wire).map_err(|e| e.to_string())
            }
            OutgoingMessage::TransactionLog(records) => {
                let wire = WireUnsolicited {
                    route: "TransactionLog",
                    response: ResponseBody {
                        status: Status::OK.0,
                        data: serde_json::to_value(records).map_err(|e| e.to_string())?,
                    },
                };
                serde_json::to_vec(&wire).map_err(|e| e.to_string())
            }
            OutgoingMessage::BundlePublished(bundle) => {
                let wire = WireUnsolicited {
                    route: "BundlePublished",
                    response: ResponseBody {
                        status: Status::OK.0,
                        data: serde_json::json!({
                            "bundleSeqNo": bundle.bundle_seq_no,
                            "bundle": bundle.blob,
                        }),
                    },
                };
                serde_json::to_vec(&wire).map_err(|e| e.to_string())
            }
            OutgoingMessage::SessionRevoked => {
                let wire = WireUnsolicited {
                    route: "SessionRevoked",
                    response: ResponseBody {
                        status: Status::OK.0,
                        data: Value::Null,
                    },
                };
                serde_json::to_vec(&wire).map_err(|e| e.to_string())
            }
        }
    }
}
