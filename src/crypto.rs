use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use spake2::{Ed25519Group, Identity, Password, Spake2};

use crate::error::Error;
use crate::{KEY_SIZE, NONCE_SIZE};

const KEY_DERIVATION_INFO: &[u8] = b"skiff-session-key";

/// Begins a symmetric SPAKE2 exchange for the given password and identity.
///
/// Both parties call this with the same password and identity; each sends the
/// returned start message to the other and completes the exchange with
/// [`finish_pake`].
pub fn start_pake(password: &str, identity: &str) -> (Spake2<Ed25519Group>, Vec<u8>) {
    let pw = Password::new(password.as_bytes());
    let id = Identity::new(identity.as_bytes());
    Spake2::<Ed25519Group>::start_symmetric(&pw, &id)
}

/// Completes the SPAKE2 exchange and derives the 32-byte session key.
///
/// The raw shared secret is expanded with HKDF-SHA256 so both sides end up
/// with a uniformly distributed AEAD key. Fails with an auth error if the
/// inbound message is malformed.
pub fn finish_pake(
    spake: Spake2<Ed25519Group>,
    inbound_message: &[u8],
) -> Result<[u8; KEY_SIZE], Error> {
    let shared_secret = spake.finish(inbound_message).map_err(|_| Error::Auth)?;

    let hkdf = Hkdf::<Sha256>::new(None, shared_secret.as_ref());
    let mut session_key = [0u8; KEY_SIZE];
    hkdf.expand(KEY_DERIVATION_INFO, &mut session_key)
        .expect("32 bytes is a valid length for HKDF");

    Ok(session_key)
}

/// Seal `plaintext` with AES-256-GCM under a fresh random nonce.
///
/// The nonce is prepended in the clear: AES-GCM does not require it to be
/// secret, and a random 12-byte nonce keeps collisions negligible for the
/// message volumes a session sees.
pub fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>, Error> {
    let cipher = Aes256Gcm::new(key.into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from(nonce_bytes);

    let ciphertext = cipher.encrypt(&nonce, plaintext).map_err(|_| Error::Encrypt)?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a sealed payload produced by [`seal`].
///
/// Fails with an auth error if the payload is too short to carry a nonce or
/// the authentication tag does not verify.
pub fn open(key: &[u8; KEY_SIZE], sealed: &[u8]) -> Result<Vec<u8>, Error> {
    if sealed.len() < NONCE_SIZE {
        return Err(Error::Auth);
    }

    let cipher = Aes256Gcm::new(key.into());
    let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);
    cipher
        .decrypt(nonce, &sealed[NONCE_SIZE..])
        .map_err(|_| Error::Auth)
}
