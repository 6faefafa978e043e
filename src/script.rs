//! Script classification and OP_RETURN payload extraction.

use bitcoin::{Address, Network, Script};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptType {
    OpReturn,
    P2pkh,
    P2sh,
    P2wpkh,
    P2wsh,
    P2tr,
    Other,
}

/// Classifies a scriptPubKey by its byte-length/opcode signature, mirroring the
/// RPC's own `scriptPubKey.type` field when that field is absent from a response.
pub fn classify(script_hex: &[u8]) -> ScriptType {
    if script_hex.is_empty() {
        return ScriptType::Other;
    }
    if script_hex[0] == 0x6a {
        return ScriptType::OpReturn;
    }
    match script_hex.len() {
        25 if script_hex[0] == 0x76 && script_hex[1] == 0xa9 && script_hex[2] == 0x14 => {
            ScriptType::P2pkh
        }
        23 if script_hex[0] == 0xa9 && script_hex[1] == 0x14 => ScriptType::P2sh,
        22 if script_hex[0] == 0x00 && script_hex[1] == 0x14 => ScriptType::P2wpkh,
        34 if script_hex[0] == 0x00 && script_hex[1] == 0x20 => ScriptType::P2wsh,
        34 if script_hex[0] == 0x51 && script_hex[1] == 0x20 => ScriptType::P2tr,
        _ => ScriptType::Other,
    }
}

pub fn is_op_return(script_hex: &[u8]) -> bool {
    classify(script_hex) == ScriptType::OpReturn
}

/// A "standard" output is one the indexer is willing to treat as a sender/recipient:
/// any recognized script type other than OP_RETURN.
pub fn is_standard_output(script_hex: &[u8]) -> bool {
    !matches!(classify(script_hex), ScriptType::OpReturn | ScriptType::Other)
}

/// Extracts the pushed payload from an OP_RETURN script, honoring direct pushes
/// (0x01-0x4b) and OP_PUSHDATA1/2/4. Returns `None` on any structural failure
/// (truncated length prefix, length exceeding remaining bytes).
pub fn extract_op_return_data(script: &[u8]) -> Option<Vec<u8>> {
    if script.is_empty() || script[0] != 0x6a {
        return None;
    }
    let rest = &script[1..];
    if rest.is_empty() {
        return None;
    }

    let opcode = rest[0];
    let (len, data_start): (usize, usize) = match opcode {
        0x01..=0x4b => (opcode as usize, 1),
        0x4c => {
            if rest.len() < 2 {
                return None;
            }
            (rest[1] as usize, 2)
        }
        0x4d => {
            if rest.len() < 3 {
                return None;
            }
            (u16::from_le_bytes([rest[1], rest[2]]) as usize, 3)
        }
        0x4e => {
            if rest.len() < 5 {
                return None;
            }
            (
                u32::from_le_bytes([rest[1], rest[2], rest[3], rest[4]]) as usize,
                5,
            )
        }
        _ => return None,
    };

    if data_start + len > rest.len() {
        return None;
    }

    Some(rest[data_start..data_start + len].to_vec())
}

pub const SIGHASH_SINGLE_ANYONECANPAY: u8 = 0x83;

/// Last byte of a DER signature is the sighash type.
pub fn extract_sighash_type(der_signature: &[u8]) -> Option<u8> {
    der_signature.last().copied()
}

pub fn is_sighash_single_anyonecanpay(der_signature: &[u8]) -> bool {
    extract_sighash_type(der_signature) == Some(SIGHASH_SINGLE_ANYONECANPAY)
}

/// Extracts the first signature observed for an input: the witness stack's first
/// element for segwit inputs, else the first token of `scriptSig.asm` for legacy.
pub fn extract_signature_from_input(witness: &[Vec<u8>], script_sig_asm: &str) -> Option<Vec<u8>> {
    if let Some(first) = witness.first() {
        if !first.is_empty() {
            return Some(first.clone());
        }
    }
    let first_token = script_sig_asm.split_whitespace().next()?;
    hex::decode(first_token).ok()
}

/// Derives an address from a scriptPubKey's raw bytes, used only when the RPC
/// response omits a pre-decoded address. Segwit/taproot outputs are encoded
/// correctly via `bitcoin::Address` rather than a hand-rolled approximation.
pub fn extract_address_from_script(script_hex: &[u8], network: Network) -> Option<String> {
    let script = Script::from_bytes(script_hex);
    Address::from_script(script, network).ok().map(|a| a.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_op_return() {
        assert_eq!(classify(&[0x6a, 0x10]), ScriptType::OpReturn);
    }

    #[test]
    fn direct_push_roundtrips() {
        let mut script = vec![0x6a, 0x04];
        script.extend_from_slice(b"ABCD");
        assert_eq!(extract_op_return_data(&script), Some(b"ABCD".to_vec()));
    }

    #[test]
    fn pushdata1_roundtrips() {
        let payload = vec![b'x'; 80];
        let mut script = vec![0x6a, 0x4c, 80];
        script.extend_from_slice(&payload);
        assert_eq!(extract_op_return_data(&script), Some(payload));
    }

    #[test]
    fn truncated_length_prefix_is_rejected() {
        let script = vec![0x6a, 0x4d, 0x05];
        assert_eq!(extract_op_return_data(&script), None);
    }

    #[test]
    fn sighash_detection() {
        let mut sig = vec![0u8; 70];
        sig[69] = 0x83;
        assert!(is_sighash_single_anyonecanpay(&sig));
    }
}
