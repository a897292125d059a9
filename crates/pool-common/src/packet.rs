//! Pool wire-protocol packet serialization and parsing.
//!
//! Every message on either link (wallet or miner) is a packet: a single
//! header byte, a 32-bit big-endian payload length, and the payload bytes.
//! The header values form a closed set; anything else is a framing error.

use thiserror::Error;

/// BLOCK_DATA: wallet → pool carries a serialized block template;
/// pool → miner carries the template followed by an 8-byte nonce seed.
pub const BLOCK_DATA: u8 = 0;
/// SUBMIT_BLOCK: pool → wallet, a solved block candidate (proof ‖ nonce).
pub const SUBMIT_BLOCK: u8 = 1;
/// BLOCK_HEIGHT: wallet → pool, the current chain height.
pub const BLOCK_HEIGHT: u8 = 2;
/// SET_CHANNEL: pool → wallet, selects the mining channel (1 = PRIME, 2 = HASH).
pub const SET_CHANNEL: u8 = 3;
/// LOGIN: miner → pool, carries the account name.
pub const LOGIN: u8 = 4;
/// LOGIN_SUCCESS: pool → miner, login accepted.
pub const LOGIN_SUCCESS: u8 = 5;
/// LOGIN_FAIL: pool → miner, login rejected.
pub const LOGIN_FAIL: u8 = 6;
/// SUBMIT_SHARE: miner → pool, a proof-of-work attempt (proof ‖ nonce).
pub const SUBMIT_SHARE: u8 = 7;
/// GET_BLOCK: request for a block template; used on both links.
pub const GET_BLOCK: u8 = 129;
/// GET_HEIGHT: pool → wallet, polls the chain height.
pub const GET_HEIGHT: u8 = 130;
/// ACCEPT: positive response; wallet → pool for submissions, pool → miner for shares.
pub const ACCEPT: u8 = 200;
/// REJECT: negative response; wallet → pool for submissions, pool → miner for shares.
pub const REJECT: u8 = 201;
/// BLOCK: pool → miner, the share was a block candidate and went upstream.
pub const BLOCK: u8 = 202;
/// PING: application-level keepalive; answered with PING.
pub const PING: u8 = 253;

/// Wire header size: header byte + 32-bit big-endian payload length.
pub const HEADER_LEN: usize = 5;

/// Maximum payload size in bytes (2 MiB).
pub const MAX_PAYLOAD: usize = 2 * 1024 * 1024;

/// Length of the proof segment echoed in submissions.
pub const PROOF_LEN: usize = 64;

/// Exact payload size of SUBMIT_BLOCK and SUBMIT_SHARE: proof ‖ 8-byte nonce.
pub const SUBMISSION_LEN: usize = PROOF_LEN + 8;

/// Maximum accepted LOGIN account-name length in bytes.
pub const MAX_LOGIN_LEN: usize = 256;

/// A parsed pool-protocol packet.
///
/// Variants map 1:1 to the wire header constants defined in this module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Serialized block template (wallet link) or template ‖ nonce seed (miner link).
    BlockData(Vec<u8>),
    /// Solved block candidate submitted upstream.
    SubmitBlock {
        /// 64-byte proof segment of the block being solved.
        proof: [u8; PROOF_LEN],
        /// Nonce that satisfied the network target.
        nonce: u64,
    },
    /// Current chain height announced by the wallet.
    BlockHeight(u32),
    /// Mining-channel selection sent during the wallet handshake.
    SetChannel(u32),
    /// Miner login carrying the account name.
    Login(String),
    /// Login accepted.
    LoginSuccess,
    /// Login rejected.
    LoginFail,
    /// Proof-of-work attempt from a miner.
    SubmitShare {
        /// 64-byte proof segment the miner hashed.
        proof: [u8; PROOF_LEN],
        /// Nonce of this attempt.
        nonce: u64,
    },
    /// Block template request.
    GetBlock,
    /// Chain height poll.
    GetHeight,
    /// Positive response.
    Accept,
    /// Negative response.
    Reject,
    /// Share was a block candidate and was submitted upstream.
    Block,
    /// Keepalive.
    Ping,
}

/// Errors produced while parsing or framing packets.
///
/// Any of these is fatal to the connection that produced the bytes.
#[derive(Debug, Error)]
pub enum FramingError {
    /// The header byte does not match any known packet type.
    #[error("unknown packet header {0}")]
    UnknownHeader(u8),
    /// The declared payload length exceeds the protocol maximum.
    #[error("payload too large: max {max}, got {actual}")]
    PayloadTooLarge {
        /// Maximum allowed payload size.
        max: usize,
        /// Declared payload size.
        actual: usize,
    },
    /// The payload size does not match what the header requires.
    #[error("bad payload length for header {header}: expected {expected}, got {actual}")]
    LengthMismatch {
        /// Header byte of the offending packet.
        header: u8,
        /// Required payload size.
        expected: usize,
        /// Actual payload size.
        actual: usize,
    },
    /// A LOGIN payload was empty, oversized, or not valid UTF-8.
    #[error("invalid login payload")]
    InvalidLogin,
    /// Underlying transport error surfaced through the codec.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn fixed_len(header: u8, expected: usize, payload: &[u8]) -> Result<(), FramingError> {
    if payload.len() == expected {
        Ok(())
    } else {
        Err(FramingError::LengthMismatch {
            header,
            expected,
            actual: payload.len(),
        })
    }
}

fn parse_submission(header: u8, payload: &[u8]) -> Result<([u8; PROOF_LEN], u64), FramingError> {
    fixed_len(header, SUBMISSION_LEN, payload)?;
    let mut proof = [0u8; PROOF_LEN];
    proof.copy_from_slice(&payload[..PROOF_LEN]);
    let nonce = u64::from_be_bytes(payload[PROOF_LEN..].try_into().expect("8 nonce bytes"));
    Ok((proof, nonce))
}

impl Packet {
    /// Parses a packet from its header byte and payload.
    ///
    /// The payload must already be the exact declared length; the stream
    /// codec guarantees this before calling in.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError`] on an unknown header, an oversized payload,
    /// or a payload whose size does not match the header's requirement.
    pub fn parse(header: u8, payload: &[u8]) -> Result<Self, FramingError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(FramingError::PayloadTooLarge {
                max: MAX_PAYLOAD,
                actual: payload.len(),
            });
        }
        match header {
            BLOCK_DATA => Ok(Self::BlockData(payload.to_vec())),
            SUBMIT_BLOCK => {
                let (proof, nonce) = parse_submission(header, payload)?;
                Ok(Self::SubmitBlock { proof, nonce })
            }
            BLOCK_HEIGHT => {
                fixed_len(header, 4, payload)?;
                Ok(Self::BlockHeight(be_u32(payload)))
            }
            SET_CHANNEL => {
                fixed_len(header, 4, payload)?;
                Ok(Self::SetChannel(be_u32(payload)))
            }
            LOGIN => {
                if payload.is_empty() || payload.len() > MAX_LOGIN_LEN {
                    return Err(FramingError::InvalidLogin);
                }
                let name =
                    std::str::from_utf8(payload).map_err(|_| FramingError::InvalidLogin)?;
                Ok(Self::Login(name.to_owned()))
            }
            LOGIN_SUCCESS => fixed_len(header, 0, payload).map(|()| Self::LoginSuccess),
            LOGIN_FAIL => fixed_len(header, 0, payload).map(|()| Self::LoginFail),
            SUBMIT_SHARE => {
                let (proof, nonce) = parse_submission(header, payload)?;
                Ok(Self::SubmitShare { proof, nonce })
            }
            GET_BLOCK => fixed_len(header, 0, payload).map(|()| Self::GetBlock),
            GET_HEIGHT => fixed_len(header, 0, payload).map(|()| Self::GetHeight),
            ACCEPT => fixed_len(header, 0, payload).map(|()| Self::Accept),
            REJECT => fixed_len(header, 0, payload).map(|()| Self::Reject),
            BLOCK => fixed_len(header, 0, payload).map(|()| Self::Block),
            PING => fixed_len(header, 0, payload).map(|()| Self::Ping),
            h => Err(FramingError::UnknownHeader(h)),
        }
    }

    /// Returns the wire header byte for this packet.
    #[must_use]
    pub const fn header(&self) -> u8 {
        match self {
            Self::BlockData(_) => BLOCK_DATA,
            Self::SubmitBlock { .. } => SUBMIT_BLOCK,
            Self::BlockHeight(_) => BLOCK_HEIGHT,
            Self::SetChannel(_) => SET_CHANNEL,
            Self::Login(_) => LOGIN,
            Self::LoginSuccess => LOGIN_SUCCESS,
            Self::LoginFail => LOGIN_FAIL,
            Self::SubmitShare { .. } => SUBMIT_SHARE,
            Self::GetBlock => GET_BLOCK,
            Self::GetHeight => GET_HEIGHT,
            Self::Accept => ACCEPT,
            Self::Reject => REJECT,
            Self::Block => BLOCK,
            Self::Ping => PING,
        }
    }

    /// Serializes this packet into header ‖ length ‖ payload.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut v = Vec::with_capacity(HEADER_LEN + payload.len());
        v.push(self.header());
        v.extend_from_slice(&u32::try_from(payload.len()).expect("payload fits u32").to_be_bytes());
        v.extend_from_slice(&payload);
        v
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Self::BlockData(data) => data.clone(),
            Self::SubmitBlock { proof, nonce } | Self::SubmitShare { proof, nonce } => {
                let mut v = Vec::with_capacity(SUBMISSION_LEN);
                v.extend_from_slice(proof);
                v.extend_from_slice(&nonce.to_be_bytes());
                v
            }
            Self::BlockHeight(n) | Self::SetChannel(n) => n.to_be_bytes().to_vec(),
            Self::Login(name) => name.as_bytes().to_vec(),
            Self::LoginSuccess
            | Self::LoginFail
            | Self::GetBlock
            | Self::GetHeight
            | Self::Accept
            | Self::Reject
            | Self::Block
            | Self::Ping => Vec::new(),
        }
    }
}

fn be_u32(payload: &[u8]) -> u32 {
    u32::from_be_bytes(payload.try_into().expect("4 payload bytes"))
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_proof() -> impl Strategy<Value = [u8; PROOF_LEN]> {
        prop::collection::vec(any::<u8>(), PROOF_LEN).prop_map(|v| {
            let mut arr = [0u8; PROOF_LEN];
            arr.copy_from_slice(&v);
            arr
        })
    }

    fn arb_template_bytes() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 0..4096)
    }

    fn arb_login() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9_.-]{1,64}"
    }

    proptest! {
        #[test]
        fn block_data_serialize_parse_roundtrip(data in arb_template_bytes()) {
            let packet = Packet::BlockData(data);
            let bytes = packet.serialize();
            let parsed = Packet::parse(bytes[0], &bytes[HEADER_LEN..]).unwrap();
            prop_assert_eq!(packet, parsed);
        }

        #[test]
        fn submit_share_serialize_parse_roundtrip(proof in arb_proof(), nonce in any::<u64>()) {
            let packet = Packet::SubmitShare { proof, nonce };
            let bytes = packet.serialize();
            let parsed = Packet::parse(bytes[0], &bytes[HEADER_LEN..]).unwrap();
            prop_assert_eq!(packet, parsed);
        }

        #[test]
        fn submit_block_serialize_parse_roundtrip(proof in arb_proof(), nonce in any::<u64>()) {
            let packet = Packet::SubmitBlock { proof, nonce };
            let bytes = packet.serialize();
            let parsed = Packet::parse(bytes[0], &bytes[HEADER_LEN..]).unwrap();
            prop_assert_eq!(packet, parsed);
        }

        #[test]
        fn login_serialize_parse_roundtrip(name in arb_login()) {
            let packet = Packet::Login(name);
            let bytes = packet.serialize();
            let parsed = Packet::parse(bytes[0], &bytes[HEADER_LEN..]).unwrap();
            prop_assert_eq!(packet, parsed);
        }

        #[test]
        fn numeric_payloads_roundtrip(height in any::<u32>(), channel in any::<u32>()) {
            for packet in [Packet::BlockHeight(height), Packet::SetChannel(channel)] {
                let bytes = packet.serialize();
                let parsed = Packet::parse(bytes[0], &bytes[HEADER_LEN..]).unwrap();
                prop_assert_eq!(packet, parsed);
            }
        }

        #[test]
        fn length_prefix_is_always_big_endian_payload_len(data in arb_template_bytes()) {
            let bytes = Packet::BlockData(data.clone()).serialize();
            let declared = u32::from_be_bytes(bytes[1..5].try_into().unwrap());
            prop_assert_eq!(declared as usize, data.len());
        }
    }
}
