//! Final-hop validation of BOLT-4 onion packets.
//!
//! Only the last hop is ever processed here: the wallet is always the final recipient of
//! an incoming swap, so a packet whose next HMAC is not all zeros is rejected.

use crate::error::{Error, Result};
use bitcoin::secp256k1::{self, PublicKey, Secp256k1, SecretKey, ecdh::SharedSecret};
use chacha20::ChaCha20;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha2::Sha256;

const VERSION: u8 = 0;
const HOP_PAYLOADS_LEN: usize = 1300;
const HMAC_LEN: usize = 32;
pub const PACKET_LEN: usize = 1 + 33 + HOP_PAYLOADS_LEN + HMAC_LEN;

const TLV_AMT_TO_FORWARD: u64 = 2;
const TLV_OUTGOING_CLTV: u64 = 4;
const TLV_PAYMENT_DATA: u64 = 8;

type HmacSha256 = Hmac<Sha256>;

/// What the sender asked the final hop to accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalHopPayload {
    pub amt_to_forward_msat: u64,
    pub outgoing_cltv: u32,
    pub payment_secret: Option<[u8; 32]>,
    pub total_msat: Option<u64>,
}

/// Check the onion against what the wallet expects to receive.
///
/// `expiry` of 0 skips the CLTV check.
pub fn validate(
    packet: &[u8],
    payment_hash: &[u8; 32],
    payment_secret: &[u8; 32],
    node_key: &SecretKey,
    expiry: u32,
    expected_msat: u64,
) -> Result<FinalHopPayload> {
    let payload = decode_final_hop(packet, payment_hash, node_key)?;

    if payload.amt_to_forward_msat > expected_msat {
        return Err(Error::IncomingSwap(format!(
            "onion asks for {} msat, expected at most {}",
            payload.amt_to_forward_msat, expected_msat
        )));
    }

    match payload.payment_secret {
        Some(secret) if &secret == payment_secret => {}
        Some(_) => {
            return Err(Error::IncomingSwap("payment secret mismatch".to_string()));
        }
        None => {
            return Err(Error::IncomingSwap("onion carries no payment secret".to_string()));
        }
    }

    if expiry > 0 && payload.outgoing_cltv > expiry {
        return Err(Error::IncomingSwap(format!(
            "outgoing cltv {} is past htlc expiry {}",
            payload.outgoing_cltv, expiry
        )));
    }

    Ok(payload)
}

/// Peel the onion with `node_key` and parse the final hop payload.
pub fn decode_final_hop(
    packet: &[u8],
    payment_hash: &[u8; 32],
    node_key: &SecretKey,
) -> Result<FinalHopPayload> {
    if packet.len() != PACKET_LEN {
        return Err(invalid(format!("packet is {} bytes", packet.len())));
    }
    if packet[0] != VERSION {
        return Err(invalid(format!("unknown version {}", packet[0])));
    }

    let ephemeral = PublicKey::from_slice(&packet[1..34])
        .map_err(|e| invalid(format!("bad ephemeral key: {}", e)))?;
    let hop_payloads = &packet[34..34 + HOP_PAYLOADS_LEN];
    let packet_hmac = &packet[34 + HOP_PAYLOADS_LEN..];

    let shared_secret = SharedSecret::new(&ephemeral, node_key).secret_bytes();

    let mut mac = keyed_mac(b"mu", &shared_secret)?;
    mac.update(hop_payloads);
    mac.update(payment_hash);
    mac.verify_slice(packet_hmac)
        .map_err(|_| invalid("hmac mismatch".to_string()))?;

    let rho = generate_key(b"rho", &shared_secret)?;
    let mut plain = vec![0u8; 2 * HOP_PAYLOADS_LEN];
    plain[..HOP_PAYLOADS_LEN].copy_from_slice(hop_payloads);
    apply_stream(&rho, &mut plain);

    let (length, offset) = read_bigsize(&plain)?;
    let length = usize::try_from(length).map_err(|_| invalid("payload too long".to_string()))?;
    if length == 0 || offset + length + HMAC_LEN > HOP_PAYLOADS_LEN {
        return Err(invalid(format!("bad payload length {}", length)));
    }

    let tlv = &plain[offset..offset + length];
    let next_hmac = &plain[offset + length..offset + length + HMAC_LEN];
    if next_hmac.iter().any(|b| *b != 0) {
        return Err(invalid("not the final hop".to_string()));
    }

    parse_payload(tlv)
}

/// Build a single-hop onion for `node`. Used by tooling and tests to stand in for a payer.
pub fn build_final_hop_onion(
    node: &PublicKey,
    payment_hash: &[u8; 32],
    payload: &FinalHopPayload,
    session_key: &SecretKey,
) -> Result<Vec<u8>> {
    let secp = Secp256k1::new();
    let ephemeral = PublicKey::from_secret_key(&secp, session_key);
    let shared_secret = SharedSecret::new(node, session_key).secret_bytes();

    let tlv = encode_payload(payload);
    let mut hop = Vec::new();
    write_bigsize(&mut hop, tlv.len() as u64);
    hop.extend_from_slice(&tlv);
    hop.extend_from_slice(&[0u8; HMAC_LEN]);
    if hop.len() > HOP_PAYLOADS_LEN {
        return Err(invalid("payload does not fit".to_string()));
    }

    let mut hop_payloads = vec![0u8; HOP_PAYLOADS_LEN];
    let pad = generate_key(b"pad", &session_key.secret_bytes())?;
    apply_stream(&pad, &mut hop_payloads);
    hop_payloads[..hop.len()].copy_from_slice(&hop);

    let rho = generate_key(b"rho", &shared_secret)?;
    apply_stream(&rho, &mut hop_payloads);

    let mut mac = keyed_mac(b"mu", &shared_secret)?;
    mac.update(&hop_payloads);
    mac.update(payment_hash);
    let hmac = mac.finalize().into_bytes();

    let mut packet = Vec::with_capacity(PACKET_LEN);
    packet.push(VERSION);
    packet.extend_from_slice(&ephemeral.serialize());
    packet.extend_from_slice(&hop_payloads);
    packet.extend_from_slice(&hmac);
    Ok(packet)
}

fn invalid(reason: String) -> Error {
    Error::IncomingSwap(format!("invalid sphinx: {}", reason))
}

fn keyed_mac(key_type: &[u8], secret: &[u8]) -> Result<HmacSha256> {
    let key = generate_key(key_type, secret)?;
    HmacSha256::new_from_slice(&key).map_err(|e| invalid(format!("hmac init: {}", e)))
}

fn generate_key(key_type: &[u8], secret: &[u8]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key_type)
        .map_err(|e| invalid(format!("hmac init: {}", e)))?;
    mac.update(secret);
    Ok(mac.finalize().into_bytes().into())
}

fn apply_stream(key: &[u8; 32], buf: &mut [u8]) {
    let nonce = [0u8; 12];
    let mut cipher = ChaCha20::new(key.into(), &nonce.into());
    cipher.apply_keystream(buf);
}

fn read_bigsize(buf: &[u8]) -> Result<(u64, usize)> {
    let first = *buf.first().ok_or_else(|| invalid("truncated bigsize".to_string()))?;
    let (width, min) = match first {
        0xfd => (2, 0xfd),
        0xfe => (4, 0x1_0000),
        0xff => (8, 0x1_0000_0000),
        n => return Ok((n as u64, 1)),
    };
    let bytes = buf
        .get(1..1 + width)
        .ok_or_else(|| invalid("truncated bigsize".to_string()))?;
    let value = bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
    if value < min {
        return Err(invalid("non-minimal bigsize".to_string()));
    }
    Ok((value, 1 + width))
}

fn write_bigsize(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => out.push(value as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(value as u16).to_be_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(value as u32).to_be_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&value.to_be_bytes());
        }
    }
}

fn read_truncated(bytes: &[u8], max: usize) -> Result<u64> {
    if bytes.len() > max || bytes.first() == Some(&0) {
        return Err(invalid("bad truncated integer".to_string()));
    }
    Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
}

fn write_truncated(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

fn parse_payload(tlv: &[u8]) -> Result<FinalHopPayload> {
    let mut amt = None;
    let mut cltv = None;
    let mut payment_secret = None;
    let mut total_msat = None;

    let mut cursor = 0;
    let mut last_type = None;
    while cursor < tlv.len() {
        let (tlv_type, read) = read_bigsize(&tlv[cursor..])?;
        cursor += read;
        let (length, read) = read_bigsize(&tlv[cursor..])?;
        cursor += read;

        if last_type.is_some_and(|last| tlv_type <= last) {
            return Err(invalid("tlv records out of order".to_string()));
        }
        last_type = Some(tlv_type);

        let end = usize::try_from(length)
            .ok()
            .and_then(|length| cursor.checked_add(length))
            .filter(|end| *end <= tlv.len())
            .ok_or_else(|| invalid("truncated tlv record".to_string()))?;
        let value = &tlv[cursor..end];
        cursor = end;

        match tlv_type {
            TLV_AMT_TO_FORWARD => amt = Some(read_truncated(value, 8)?),
            TLV_OUTGOING_CLTV => cltv = Some(read_truncated(value, 4)? as u32),
            TLV_PAYMENT_DATA => {
                if value.len() < 32 {
                    return Err(invalid("short payment_data".to_string()));
                }
                let mut secret = [0u8; 32];
                secret.copy_from_slice(&value[..32]);
                payment_secret = Some(secret);
                total_msat = Some(read_truncated(&value[32..], 8)?);
            }
            t if t % 2 == 0 => {
                return Err(invalid(format!("unknown required tlv type {}", t)));
            }
            _ => {}
        }
    }

    Ok(FinalHopPayload {
        amt_to_forward_msat: amt.ok_or_else(|| invalid("missing amt_to_forward".to_string()))?,
        outgoing_cltv: cltv.ok_or_else(|| invalid("missing outgoing_cltv_value".to_string()))?,
        payment_secret,
        total_msat,
    })
}

fn encode_payload(payload: &FinalHopPayload) -> Vec<u8> {
    let mut out = Vec::new();
    let mut record = |tlv_type: u64, value: &[u8]| {
        write_bigsize(&mut out, tlv_type);
        write_bigsize(&mut out, value.len() as u64);
        out.extend_from_slice(value);
    };

    record(TLV_AMT_TO_FORWARD, &write_truncated(payload.amt_to_forward_msat));
    record(TLV_OUTGOING_CLTV, &write_truncated(payload.outgoing_cltv as u64));
    if let Some(secret) = payload.payment_secret {
        let mut value = secret.to_vec();
        value.extend(write_truncated(payload.total_msat.unwrap_or(payload.amt_to_forward_msat)));
        record(TLV_PAYMENT_DATA, &value);
    }
    out
}

/// Public key of `node_key`, for callers that only hold the secret.
pub fn node_public_key(node_key: &SecretKey) -> secp256k1::PublicKey {
    PublicKey::from_secret_key(&Secp256k1::signing_only(), node_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> (SecretKey, SecretKey) {
        (
            SecretKey::from_slice(&[0x41; 32]).unwrap(),
            SecretKey::from_slice(&[0x42; 32]).unwrap(),
        )
    }

    fn payload() -> FinalHopPayload {
        FinalHopPayload {
            amt_to_forward_msat: 100_000_000,
            outgoing_cltv: 700_123,
            payment_secret: Some([7u8; 32]),
            total_msat: Some(100_000_000),
        }
    }

    #[test]
    fn test_build_then_validate() {
        let (node, session) = keys();
        let hash = [3u8; 32];
        let packet =
            build_final_hop_onion(&node_public_key(&node), &hash, &payload(), &session).unwrap();
        assert_eq!(packet.len(), PACKET_LEN);

        let decoded = validate(&packet, &hash, &[7u8; 32], &node, 700_200, 100_000_000).unwrap();
        assert_eq!(decoded, payload());
    }

    #[test]
    fn test_rejects_wrong_expectations() {
        let (node, session) = keys();
        let hash = [3u8; 32];
        let packet =
            build_final_hop_onion(&node_public_key(&node), &hash, &payload(), &session).unwrap();

        // Asks for more than we expect to receive.
        assert!(validate(&packet, &hash, &[7u8; 32], &node, 0, 99_999_999).is_err());
        // Wrong payment secret.
        assert!(validate(&packet, &hash, &[8u8; 32], &node, 0, 100_000_000).is_err());
        // CLTV beyond the HTLC expiry.
        assert!(validate(&packet, &hash, &[7u8; 32], &node, 700_000, 100_000_000).is_err());
        // HMAC commits to the payment hash.
        assert!(validate(&packet, &[4u8; 32], &[7u8; 32], &node, 0, 100_000_000).is_err());
        // Not addressed to us.
        assert!(validate(&packet, &hash, &[7u8; 32], &session, 0, 100_000_000).is_err());
    }

    #[test]
    fn test_rejects_tampering() {
        let (node, session) = keys();
        let hash = [3u8; 32];
        let mut packet =
            build_final_hop_onion(&node_public_key(&node), &hash, &payload(), &session).unwrap();
        packet[100] ^= 1;
        assert!(decode_final_hop(&packet, &hash, &node).is_err());
        assert!(decode_final_hop(&packet[..100], &hash, &node).is_err());
    }

    #[test]
    fn test_bigsize_and_truncated_ints() {
        for value in [0u64, 0xfc, 0xfd, 0xffff, 0x1_0000, 0xffff_ffff, 0x1_0000_0000] {
            let mut buf = Vec::new();
            write_bigsize(&mut buf, value);
            assert_eq!(read_bigsize(&buf).unwrap(), (value, buf.len()));
        }
        assert!(read_bigsize(&[0xfd, 0x00, 0x10]).is_err());

        assert_eq!(write_truncated(0), Vec::<u8>::new());
        assert_eq!(write_truncated(0x0102), vec![1, 2]);
        assert_eq!(read_truncated(&[1, 2], 8).unwrap(), 0x0102);
        assert!(read_truncated(&[0, 2], 8).is_err());
    }
}
