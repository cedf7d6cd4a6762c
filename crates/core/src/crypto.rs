use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{AeadCore, AeadInPlace, KeyInit, OsRng},
};

use crate::{Error, Result};

pub const FRAMING_VERSION: u8 = 0x01;
pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;
pub const FRAMING_OVERHEAD_BYTES: usize = 1 + NONCE_LEN + TAG_LEN;

/// Binds a ciphertext to its file and position so parts cannot be swapped remotely.
pub fn chunk_aad(file_id: &str, part_number: u32) -> String {
    format!("syncbridge.chunk.v1:{file_id}:{part_number}")
}

pub fn encrypt_framed(master_key: &[u8; 32], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(master_key.into());
    let nonce: XNonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

    let mut buffer = Vec::with_capacity(plaintext.len() + TAG_LEN);
    buffer.extend_from_slice(plaintext);
    cipher
        .encrypt_in_place(&nonce, aad, &mut buffer)
        .map_err(|_| Error::Crypto)?;

    let mut out = Vec::with_capacity(1 + NONCE_LEN + buffer.len());
    out.push(FRAMING_VERSION);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&buffer);
    Ok(out)
}

pub fn decrypt_framed(master_key: &[u8; 32], aad: &[u8], framed: &[u8]) -> Result<Vec<u8>> {
    if framed.len() < FRAMING_OVERHEAD_BYTES || framed[0] != FRAMING_VERSION {
        return Err(Error::Crypto);
    }

    let cipher = XChaCha20Poly1305::new(master_key.into());
    let nonce = XNonce::from_slice(&framed[1..1 + NONCE_LEN]);

    let mut buffer = framed[1 + NONCE_LEN..].to_vec();
    cipher
        .decrypt_in_place(nonce, aad, &mut buffer)
        .map_err(|_| Error::Crypto)?;
    Ok(buffer)
}
