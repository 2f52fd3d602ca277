//! Agent opcodes, the message envelope, and request/response bodies.
//!
//! See `PROTOCOL.agent` in OpenSSH and draft-miller-ssh-agent.

use crate::error::{RequestError, WireError};
use crate::wire::{Reader, put_string};

/// Protocol tag carried by every envelope exchanged on a channel.
pub const AGENT_MSG_TYPE: &str = "auth-agent@openssh.com";

/// Sign request flag selecting `rsa-sha2-256`.
pub const SSH_AGENT_RSA_SHA2_256: u32 = 0x02;
/// Sign request flag selecting `rsa-sha2-512`.
pub const SSH_AGENT_RSA_SHA2_512: u32 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Failure = 5,
    Success = 6,
    RequestIdentities = 11,
    IdentitiesAnswer = 12,
    SignRequest = 13,
    SignResponse = 14,
    AddIdentity = 17,
    RemoveIdentity = 18,
    RemoveAllIdentities = 19,
    AddSmartcardKey = 20,
    RemoveSmartcardKey = 21,
    Lock = 22,
    Unlock = 23,
    AddIdConstrained = 25,
    AddSmartcardKeyConstrained = 26,
    Extension = 27,
    ExtensionFailure = 28,
}

impl Opcode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Opcode {
    type Error = RequestError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            5 => Self::Failure,
            6 => Self::Success,
            11 => Self::RequestIdentities,
            12 => Self::IdentitiesAnswer,
            13 => Self::SignRequest,
            14 => Self::SignResponse,
            17 => Self::AddIdentity,
            18 => Self::RemoveIdentity,
            19 => Self::RemoveAllIdentities,
            20 => Self::AddSmartcardKey,
            21 => Self::RemoveSmartcardKey,
            22 => Self::Lock,
            23 => Self::Unlock,
            25 => Self::AddIdConstrained,
            26 => Self::AddSmartcardKeyConstrained,
            27 => Self::Extension,
            28 => Self::ExtensionFailure,
            other => return Err(RequestError::UnknownOpcode(other)),
        })
    }
}

/// One unit exchanged on a channel: a protocol tag and opcode-plus-body
/// bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: String,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(kind: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// An envelope tagged with [`AGENT_MSG_TYPE`].
    pub fn agent(data: Vec<u8>) -> Self {
        Self::new(AGENT_MSG_TYPE, data)
    }

    pub fn is_agent(&self) -> bool {
        self.kind == AGENT_MSG_TYPE
    }
}

/// A decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request<'a> {
    RequestIdentities,
    Sign {
        key_blob: &'a [u8],
        data: &'a [u8],
        flags: u32,
    },
    /// A defined opcode this agent refuses: key management, locking,
    /// extensions, and response codes sent in the wrong direction.
    Unsupported(Opcode),
}

impl<'a> Request<'a> {
    pub fn decode(message: &'a [u8]) -> Result<Self, RequestError> {
        let (&first, body) = message.split_first().ok_or(RequestError::Empty)?;
        let opcode = Opcode::try_from(first)?;
        match opcode {
            Opcode::RequestIdentities => {
                Reader::new(body).finish()?;
                Ok(Self::RequestIdentities)
            }
            Opcode::SignRequest => {
                let mut reader = Reader::new(body);
                let key_blob = reader.read_string()?;
                let data = reader.read_string()?;
                let flags = reader.read_u32()?;
                reader.finish()?;
                Ok(Self::Sign {
                    key_blob,
                    data,
                    flags,
                })
            }
            Opcode::AddIdentity
            | Opcode::RemoveIdentity
            | Opcode::RemoveAllIdentities
            | Opcode::AddSmartcardKey
            | Opcode::RemoveSmartcardKey
            | Opcode::Lock
            | Opcode::Unlock
            | Opcode::AddIdConstrained
            | Opcode::AddSmartcardKeyConstrained
            | Opcode::Extension
            | Opcode::Failure
            | Opcode::Success
            | Opcode::IdentitiesAnswer
            | Opcode::SignResponse
            | Opcode::ExtensionFailure => Ok(Self::Unsupported(opcode)),
        }
    }
}

/// `SSH_AGENT_FAILURE` with no body.
pub fn failure() -> Vec<u8> {
    vec![Opcode::Failure.as_u8()]
}

/// `SSH2_AGENT_IDENTITIES_ANSWER ++ uint32 count ++ {string blob, string comment}*`.
pub fn identities_answer<'i>(identities: impl ExactSizeIterator<Item = (&'i [u8], &'i str)>) -> Vec<u8> {
    let mut out = vec![Opcode::IdentitiesAnswer.as_u8()];
    out.extend_from_slice(&crate::wire::encode_uint32(identities.len() as u32));
    for (blob, comment) in identities {
        put_string(&mut out, blob);
        put_string(&mut out, comment.as_bytes());
    }
    out
}

/// `SSH2_AGENT_SIGN_RESPONSE ++ string signature`.
pub fn sign_response(signature: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + signature.len());
    out.push(Opcode::SignResponse.as_u8());
    put_string(&mut out, signature);
    out
}

/// Parse an identities answer back into `(blob, comment)` pairs.
///
/// The agent never receives this message; clients and tests do.
pub fn decode_identities_answer(message: &[u8]) -> Result<Vec<(Vec<u8>, String)>, WireError> {
    let mut reader = Reader::new(message);
    let opcode = reader.read_u8()?;
    if opcode != Opcode::IdentitiesAnswer.as_u8() {
        return Err(WireError::UnexpectedOpcode(opcode));
    }
    let count = reader.read_u32()? as usize;
    let mut identities = Vec::with_capacity(count.min(reader.remaining() / 8));
    for _ in 0..count {
        let blob = reader.read_string()?.to_vec();
        let comment = String::from_utf8_lossy(reader.read_string()?).into_owned();
        identities.push((blob, comment));
    }
    reader.finish()?;
    Ok(identities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::encode_string;

    fn sign_body(blob: &[u8], data: &[u8], flags: u32) -> Vec<u8> {
        let mut msg = vec![Opcode::SignRequest.as_u8()];
        msg.extend(encode_string(blob));
        msg.extend(encode_string(data));
        msg.extend(flags.to_be_bytes());
        msg
    }

    #[test]
    fn opcode_values_match_protocol() {
        assert_eq!(Opcode::Failure.as_u8(), 5);
        assert_eq!(Opcode::RequestIdentities.as_u8(), 11);
        assert_eq!(Opcode::IdentitiesAnswer.as_u8(), 12);
        assert_eq!(Opcode::SignRequest.as_u8(), 13);
        assert_eq!(Opcode::SignResponse.as_u8(), 14);
        for code in 0..=u8::MAX {
            if let Ok(op) = Opcode::try_from(code) {
                assert_eq!(op.as_u8(), code);
            }
        }
    }

    #[test]
    fn undefined_opcode_is_unknown() {
        assert!(matches!(
            Request::decode(&[99]),
            Err(RequestError::UnknownOpcode(99))
        ));
        assert!(matches!(Request::decode(&[]), Err(RequestError::Empty)));
    }

    #[test]
    fn decode_request_identities() {
        assert_eq!(Request::decode(&[11]).unwrap(), Request::RequestIdentities);
        assert!(matches!(
            Request::decode(&[11, 0]),
            Err(RequestError::Wire(WireError::TrailingBytes(1)))
        ));
    }

    #[test]
    fn decode_sign_request() {
        let msg = sign_body(b"blob", b"payload", SSH_AGENT_RSA_SHA2_256);
        assert_eq!(
            Request::decode(&msg).unwrap(),
            Request::Sign {
                key_blob: b"blob",
                data: b"payload",
                flags: 2
            }
        );
    }

    #[test]
    fn truncated_sign_request_is_malformed() {
        let msg = sign_body(b"blob", b"payload", 0);
        for len in 1..msg.len() {
            assert!(matches!(
                Request::decode(&msg[..len]),
                Err(RequestError::Wire(WireError::TruncatedInput { .. }))
            ));
        }
    }

    #[test]
    fn management_opcodes_are_unsupported() {
        for op in [
            Opcode::AddIdentity,
            Opcode::RemoveIdentity,
            Opcode::RemoveAllIdentities,
            Opcode::AddSmartcardKey,
            Opcode::RemoveSmartcardKey,
            Opcode::Lock,
            Opcode::Unlock,
            Opcode::AddIdConstrained,
            Opcode::AddSmartcardKeyConstrained,
            Opcode::Extension,
            Opcode::SignResponse,
        ] {
            assert_eq!(Request::decode(&[op.as_u8(), 0, 0]).unwrap(), Request::Unsupported(op));
        }
    }

    #[test]
    fn identities_answer_layout() {
        assert_eq!(identities_answer(std::iter::empty()), vec![12, 0, 0, 0, 0]);

        let entries = [(&b"k1"[..], "one"), (&b"k2"[..], "")];
        let answer = identities_answer(entries.iter().copied());
        let decoded = decode_identities_answer(&answer).unwrap();
        assert_eq!(
            decoded,
            vec![
                (b"k1".to_vec(), "one".to_string()),
                (b"k2".to_vec(), String::new())
            ]
        );
    }

    #[test]
    fn sign_response_wraps_signature_in_string() {
        assert_eq!(sign_response(&[1, 2]), vec![14, 0, 0, 0, 2, 1, 2]);
        assert_eq!(failure(), vec![5]);
    }

    #[test]
    fn envelope_tag() {
        let msg = Message::agent(vec![11]);
        assert!(msg.is_agent());
        assert!(!Message::new("chrome-extension-port", vec![11]).is_agent());
    }
}
