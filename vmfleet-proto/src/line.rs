//! Line-oriented parsing for the hypervisor datagram transport.
//!
//! Guests send newline-delimited text commands and read newline-delimited
//! responses (§4.6). Exactly one command is recognised by name —
//! `CALLBACK <method> <json_params>` — everything else is an opaque,
//! agent-defined verb that is round-tripped to the client unmodified.

use serde::{Deserialize, Serialize};

use crate::callback::CallbackResponse;

/// A single decoded line from a guest connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// `CALLBACK <method> <json_params>`.
    Callback {
        /// The callback's method name.
        method: String,
        /// Parsed JSON parameters.
        params: serde_json::Value,
    },
    /// Any other verb (`EXEC`, `UPLOAD`, `DOWNLOAD`, ...); opaque to the core.
    Verb {
        /// The leading whitespace-delimited token.
        verb: String,
        /// Everything after the verb, unparsed.
        body: String,
    },
}

/// A line failed to decode.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The line was empty after trimming.
    #[error("empty line")]
    Empty,
    /// `CALLBACK` was missing its method token.
    #[error("CALLBACK line missing method")]
    MissingMethod,
    /// The JSON parameter payload did not parse.
    #[error("invalid JSON params: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Parses one newline-delimited command line (the trailing `\n` already stripped).
pub fn decode_command(line: &str) -> Result<Command, DecodeError> {
    let line = line.trim_end_matches('\r');
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(DecodeError::Empty);
    }

    let (verb, rest) = trimmed.split_once(' ').unwrap_or((trimmed, ""));
    if verb.eq_ignore_ascii_case("CALLBACK") {
        let rest = rest.trim_start();
        let (method, params_json) = rest.split_once(' ').unwrap_or((rest, ""));
        if method.is_empty() {
            return Err(DecodeError::MissingMethod);
        }
        let params_json = params_json.trim();
        let params = if params_json.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(params_json)?
        };
        Ok(Command::Callback {
            method: method.to_owned(),
            params,
        })
    } else {
        Ok(Command::Verb {
            verb: verb.to_owned(),
            body: rest.to_owned(),
        })
    }
}

/// Renders a [`CallbackResponse`] as a single newline-terminated JSON line.
pub fn encode_response(resp: &CallbackResponse) -> String {
    let mut line = serde_json::to_string(resp).unwrap_or_else(|_| "{}".to_owned());
    line.push('\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_callback_line() {
        let cmd = decode_command("CALLBACK echo {\"x\":1}").expect("parses");
        match cmd {
            Command::Callback { method, params } => {
                assert_eq!(method, "echo");
                assert_eq!(params, serde_json::json!({"x": 1}));
            }
            Command::Verb { .. } => panic!("expected Callback"),
        }
    }

    #[test]
    fn callback_without_params_defaults_to_null() {
        let cmd = decode_command("CALLBACK ping").expect("parses");
        assert_eq!(
            cmd,
            Command::Callback {
                method: "ping".to_owned(),
                params: serde_json::Value::Null,
            }
        );
    }

    #[test]
    fn callback_missing_method_is_rejected() {
        assert!(matches!(
            decode_command("CALLBACK"),
            Err(DecodeError::MissingMethod)
        ));
    }

    #[test]
    fn unrecognised_verb_is_opaque() {
        let cmd = decode_command("EXEC ls -la /tmp").expect("parses");
        assert_eq!(
            cmd,
            Command::Verb {
                verb: "EXEC".to_owned(),
                body: "ls -la /tmp".to_owned(),
            }
        );
    }

    #[test]
    fn empty_line_is_rejected() {
        assert!(matches!(decode_command("   "), Err(DecodeError::Empty)));
    }

    #[test]
    fn response_line_is_newline_terminated() {
        let resp = CallbackResponse::ok("alpha:1", serde_json::json!({"x": 1}));
        let line = encode_response(&resp);
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }
}
