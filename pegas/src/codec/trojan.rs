//! Trojan header construction. Spec §4.1 / §4.2 / GLOSSARY.
//!
//! No corpus example implements Trojan; this follows spec.md's explicit
//! byte-level description directly: `SHA224(password) hex ∥ CRLF ∥
//! SOCKS5-formatted dest ∥ CRLF`. The destination encoding reuses
//! `codec::socks5::encode_dest` since spec §4.2 calls it out as literally
//! "SOCKS5-formatted dest".

use sha2::{Digest, Sha224};

use super::{socks5, Destination};

const CRLF: &[u8] = b"\r\n";
/// Trojan's own CONNECT command byte (spec §4.2: literal `0x01`).
const CMD_CONNECT: u8 = 0x01;

/// Builds the Trojan header to send immediately after the transport is
/// established (TLS-only for `trojan_gfw`, inside the first WebSocket
/// binary frame for `trojan_ws`).
pub fn build_header(password: &str, dest: &Destination) -> Vec<u8> {
    let hash = Sha224::digest(password.as_bytes());
    let hex = hex::encode(hash);

    let mut header = Vec::with_capacity(hex.len() + 2 + 2 + 2 + 20);
    header.extend_from_slice(hex.as_bytes());
    header.extend_from_slice(CRLF);
    header.push(CMD_CONNECT);
    header.extend_from_slice(&socks5::encode_dest(dest));
    header.extend_from_slice(CRLF);
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_has_56_hex_char_password_digest() {
        let dest = Destination::Domain("example.com".into(), 80);
        let header = build_header("s3cr3t", &dest);
        let first_crlf = header.windows(2).position(|w| w == CRLF).unwrap();
        assert_eq!(first_crlf, 56);
        let hex_part = std::str::from_utf8(&header[..56]).unwrap();
        assert!(hex_part.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
