//! Channel encryption handshake and per-frame AEAD.
//!
//! After the socket connects the server sends `ChannelEncryptRequest` carrying a random
//! challenge. The client generates a 32-byte session key, appends the challenge, encrypts
//! both with RSA-OAEP under the universe's public key and answers with
//! `ChannelEncryptResponse`. Only the holder of the universe's private key can recover
//! the session key. The server confirms with `ChannelEncryptResult`; on `OK` every later
//! frame body is sealed with AES-256-GCM under the session key.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit};
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, TransportError};
use crate::message::{MsgHeader, PacketMsg, StructHeader};
use crate::protocol::{EResult, MsgType, Universe, CHANNEL_PROTOCOL_VERSION};

/// Size of the server challenge.
pub const CHALLENGE_SIZE: usize = 16;
/// Size of the symmetric session key.
pub const SESSION_KEY_SIZE: usize = 32;
/// AES-GCM nonce size.
pub const NONCE_SIZE: usize = 12;
/// AES-GCM tag size.
pub const TAG_SIZE: usize = 16;

const PUBLIC_UNIVERSE_KEY: &str = include_str!("../keys/public.pem");
const BETA_UNIVERSE_KEY: &str = include_str!("../keys/beta.pem");
const INTERNAL_UNIVERSE_KEY: &str = include_str!("../keys/internal.pem");
const DEV_UNIVERSE_KEY: &str = include_str!("../keys/dev.pem");

/// Symmetric key protecting one session.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey(pub [u8; SESSION_KEY_SIZE]);

impl SessionKey {
    /// Random session key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        SessionKey(bytes)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKey([REDACTED])")
    }
}

fn oaep() -> Oaep {
    Oaep::new::<Sha256>()
}

/// Public RSA key of a universe. Clients wrap session keys with it; only the CM
/// servers of that universe hold the private half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniverseKey {
    key: RsaPublicKey,
}

impl UniverseKey {
    /// Built-in public key for `universe`.
    pub fn for_universe(universe: Universe) -> Result<Self> {
        let pem = match universe {
            Universe::Public => PUBLIC_UNIVERSE_KEY,
            Universe::Beta => BETA_UNIVERSE_KEY,
            Universe::Internal => INTERNAL_UNIVERSE_KEY,
            Universe::Dev => DEV_UNIVERSE_KEY,
            Universe::Invalid => {
                return Err(TransportError::Handshake {
                    reason: "no public key for the invalid universe".into(),
                })
            }
        };
        Self::from_pem(pem)
    }

    /// Parses a PEM encoded SubjectPublicKeyInfo (`-----BEGIN PUBLIC KEY-----`).
    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = RsaPublicKey::from_public_key_pem(pem.trim()).map_err(|e| {
            TransportError::Handshake {
                reason: format!("universe key is not a valid public key: {}", e),
            }
        })?;
        Ok(Self { key })
    }

    /// PEM encoding of the key.
    pub fn to_pem(&self) -> Result<String> {
        self.key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| TransportError::EncryptionFailed(e.to_string()))
    }

    /// Encrypts `key || challenge` with RSA-OAEP (SHA-256). The output is randomized,
    /// so wrapping the same key twice gives different bytes.
    pub fn wrap_session_key(&self, key: &SessionKey, challenge: &[u8]) -> Result<Vec<u8>> {
        let mut plain = Vec::with_capacity(SESSION_KEY_SIZE + challenge.len());
        plain.extend_from_slice(&key.0);
        plain.extend_from_slice(challenge);
        let wrapped = self
            .key
            .encrypt(&mut rand::thread_rng(), oaep(), &plain)
            .map_err(|e| TransportError::EncryptionFailed(e.to_string()));
        plain.zeroize();
        wrapped
    }
}

/// Private half of a universe key. Held by CM servers, never by clients.
#[derive(Clone)]
pub struct UniversePrivateKey {
    key: RsaPrivateKey,
}

impl UniversePrivateKey {
    /// Fresh key pair of `bits` bits.
    pub fn generate(bits: usize) -> Result<Self> {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .map_err(|e| TransportError::EncryptionFailed(e.to_string()))?;
        Ok(Self { key })
    }

    /// Parses a PEM encoded PKCS#8 private key.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem.trim()).map_err(|e| {
            TransportError::Handshake {
                reason: format!("universe private key is not valid PKCS#8: {}", e),
            }
        })?;
        Ok(Self { key })
    }

    /// Public half to hand to clients.
    pub fn public_key(&self) -> UniverseKey {
        UniverseKey {
            key: self.key.to_public_key(),
        }
    }

    /// Recovers a session key wrapped by [`UniverseKey::wrap_session_key`] and checks
    /// that it was bound to `challenge`.
    pub fn unwrap_session_key(&self, wrapped: &[u8], challenge: &[u8]) -> Result<SessionKey> {
        let mut plain = self
            .key
            .decrypt(oaep(), wrapped)
            .map_err(|_| TransportError::Handshake {
                reason: "wrapped session key does not decrypt".into(),
            })?;
        let outcome = if plain.len() != SESSION_KEY_SIZE + challenge.len() {
            Err(TransportError::Handshake {
                reason: format!("wrapped session key has {} bytes", plain.len()),
            })
        } else if &plain[SESSION_KEY_SIZE..] != challenge {
            Err(TransportError::Handshake {
                reason: "wrapped session key is bound to another challenge".into(),
            })
        } else {
            let mut key = [0u8; SESSION_KEY_SIZE];
            key.copy_from_slice(&plain[..SESSION_KEY_SIZE]);
            Ok(SessionKey(key))
        };
        plain.zeroize();
        outcome
    }
}

impl std::fmt::Debug for UniversePrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UniversePrivateKey([REDACTED])")
    }
}

fn seal(cipher: &Aes256Gcm, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(
            aes_gcm::Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| TransportError::EncryptionFailed(e.to_string()))?;
    let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn open(cipher: &Aes256Gcm, frame: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if frame.len() < NONCE_SIZE + TAG_SIZE {
        return Err(TransportError::DecryptionFailed);
    }
    let (nonce, sealed) = frame.split_at(NONCE_SIZE);
    cipher
        .decrypt(
            aes_gcm::Nonce::from_slice(nonce),
            Payload { msg: sealed, aad },
        )
        .map_err(|_| TransportError::DecryptionFailed)
}

/// Symmetric cipher for an established channel.
pub struct ChannelCipher {
    cipher: Aes256Gcm,
}

impl ChannelCipher {
    /// Cipher keyed with `key`.
    pub fn new(key: &SessionKey) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(&key.0)
            .map_err(|e| TransportError::EncryptionFailed(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Seals one frame body. A fresh random nonce is used for every call.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        seal(&self.cipher, plaintext, &[])
    }

    /// Opens one frame body. Any modification fails with `DecryptionFailed`.
    pub fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>> {
        open(&self.cipher, frame, &[])
    }
}

impl std::fmt::Debug for ChannelCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChannelCipher")
    }
}

/// `ChannelEncryptRequest` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptRequest {
    /// Channel protocol version.
    pub protocol_version: u32,
    /// Universe of the server.
    pub universe: Universe,
    /// Random challenge the wrapped key is bound to.
    pub challenge: [u8; CHALLENGE_SIZE],
}

impl EncryptRequest {
    /// New request with a random challenge.
    pub fn random(universe: Universe) -> Self {
        let mut challenge = [0u8; CHALLENGE_SIZE];
        rand::thread_rng().fill_bytes(&mut challenge);
        Self {
            protocol_version: CHANNEL_PROTOCOL_VERSION,
            universe,
            challenge,
        }
    }

    /// Serializes the body.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + CHALLENGE_SIZE);
        out.extend_from_slice(&self.protocol_version.to_le_bytes());
        out.extend_from_slice(&(self.universe.as_u8() as u32).to_le_bytes());
        out.extend_from_slice(&self.challenge);
        out
    }

    /// Parses the body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < 8 + CHALLENGE_SIZE {
            return Err(TransportError::Handshake {
                reason: format!("encrypt request body has {} bytes", body.len()),
            });
        }
        let protocol_version = read_u32(&body[0..4]);
        let universe = Universe::from_u8(read_u32(&body[4..8]) as u8);
        let mut challenge = [0u8; CHALLENGE_SIZE];
        challenge.copy_from_slice(&body[8..8 + CHALLENGE_SIZE]);
        Ok(Self {
            protocol_version,
            universe,
            challenge,
        })
    }

    /// Wraps the body in a `ChannelEncryptRequest` message.
    pub fn to_packet(&self) -> PacketMsg {
        handshake_packet(MsgType::CHANNEL_ENCRYPT_REQUEST, self.universe, self.encode())
    }
}

/// `ChannelEncryptResponse` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptResponse {
    /// Channel protocol version.
    pub protocol_version: u32,
    /// Session key wrapped with the universe key.
    pub wrapped_key: Vec<u8>,
}

impl EncryptResponse {
    /// Serializes the body, including the wrapped-key checksum.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.wrapped_key.len());
        out.extend_from_slice(&self.protocol_version.to_le_bytes());
        out.extend_from_slice(&(self.wrapped_key.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.wrapped_key);
        out.extend_from_slice(&crc32fast::hash(&self.wrapped_key).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out
    }

    /// Parses the body and verifies the checksum.
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < 8 {
            return Err(TransportError::Handshake {
                reason: format!("encrypt response body has {} bytes", body.len()),
            });
        }
        let protocol_version = read_u32(&body[0..4]);
        let key_size = read_u32(&body[4..8]) as usize;
        if body.len() < 8 + key_size + 4 {
            return Err(TransportError::Handshake {
                reason: format!("encrypt response truncated: key size {}", key_size),
            });
        }
        let wrapped_key = body[8..8 + key_size].to_vec();
        let crc = read_u32(&body[8 + key_size..12 + key_size]);
        if crc != crc32fast::hash(&wrapped_key) {
            return Err(TransportError::Handshake {
                reason: "wrapped key checksum mismatch".into(),
            });
        }
        Ok(Self {
            protocol_version,
            wrapped_key,
        })
    }
}

/// `ChannelEncryptResult` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptResult {
    /// Outcome of the handshake.
    pub result: EResult,
}

impl EncryptResult {
    /// Serializes the body.
    pub fn encode(&self) -> Vec<u8> {
        self.result.0.to_le_bytes().to_vec()
    }

    /// Parses the body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < 4 {
            return Err(TransportError::Handshake {
                reason: format!("encrypt result body has {} bytes", body.len()),
            });
        }
        Ok(Self {
            result: EResult(read_u32(&body[0..4]) as i32),
        })
    }

    /// Wraps the body in a `ChannelEncryptResult` message.
    pub fn to_packet(&self, universe: Universe) -> PacketMsg {
        handshake_packet(MsgType::CHANNEL_ENCRYPT_RESULT, universe, self.encode())
    }
}

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
}

fn handshake_packet(msg_type: MsgType, universe: Universe, body: Vec<u8>) -> PacketMsg {
    PacketMsg {
        msg_type,
        header: MsgHeader::Struct(StructHeader {
            universe,
            ..StructHeader::default()
        }),
        body: body.into(),
        payload: Default::default(),
    }
}

/// Progress of the channel handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Socket not yet connected.
    Idle,
    /// Waiting for `ChannelEncryptRequest`.
    AwaitingChallenge,
    /// Response sent, waiting for `ChannelEncryptResult`.
    KeyAccepted,
    /// Channel is encrypted.
    Established,
    /// Handshake failed; the connection must be torn down.
    Failed,
}

/// Client side of the channel handshake.
#[derive(Debug)]
pub struct ChannelNegotiator {
    state: HandshakeState,
    universe: Universe,
    universe_key: UniverseKey,
    session_key: Option<SessionKey>,
}

impl ChannelNegotiator {
    /// Negotiator for `universe` using `universe_key` to wrap session keys.
    pub fn new(universe: Universe, universe_key: UniverseKey) -> Self {
        Self {
            state: HandshakeState::Idle,
            universe,
            universe_key,
            session_key: None,
        }
    }

    /// Current handshake state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Socket connected; wait for the challenge.
    pub fn start(&mut self) {
        self.state = HandshakeState::AwaitingChallenge;
        self.session_key = None;
    }

    fn fail(&mut self, reason: impl Into<String>) -> TransportError {
        self.state = HandshakeState::Failed;
        self.session_key = None;
        TransportError::Handshake {
            reason: reason.into(),
        }
    }

    /// Handles `ChannelEncryptRequest` and returns the `ChannelEncryptResponse` to send.
    pub fn handle_challenge(&mut self, packet: &PacketMsg) -> Result<PacketMsg> {
        if self.state != HandshakeState::AwaitingChallenge {
            return Err(self.fail(format!("unexpected challenge in state {:?}", self.state)));
        }
        if packet.msg_type != MsgType::CHANNEL_ENCRYPT_REQUEST {
            return Err(self.fail(format!("expected ChannelEncryptRequest, got {}", packet.msg_type)));
        }
        let request = match EncryptRequest::decode(&packet.body) {
            Ok(request) => request,
            Err(e) => return Err(self.fail(e.to_string())),
        };
        if request.universe != self.universe {
            return Err(self.fail(format!(
                "server universe {:?} does not match {:?}",
                request.universe, self.universe
            )));
        }
        debug!(
            protocol_version = request.protocol_version,
            universe = ?request.universe,
            "received channel challenge"
        );

        let session_key = SessionKey::generate();
        let wrapped_key = match self
            .universe_key
            .wrap_session_key(&session_key, &request.challenge)
        {
            Ok(wrapped) => wrapped,
            Err(e) => return Err(self.fail(e.to_string())),
        };
        self.session_key = Some(session_key);
        self.state = HandshakeState::KeyAccepted;

        let response = EncryptResponse {
            protocol_version: CHANNEL_PROTOCOL_VERSION,
            wrapped_key,
        };
        let mut reply = handshake_packet(
            MsgType::CHANNEL_ENCRYPT_RESPONSE,
            self.universe,
            response.encode(),
        );
        reply.header.set_target_job(packet.source_job());
        Ok(reply)
    }

    /// Handles `ChannelEncryptResult`. Returns the channel cipher on `OK`.
    pub fn handle_result(&mut self, packet: &PacketMsg) -> Result<ChannelCipher> {
        if self.state != HandshakeState::KeyAccepted {
            return Err(self.fail(format!("unexpected result in state {:?}", self.state)));
        }
        if packet.msg_type != MsgType::CHANNEL_ENCRYPT_RESULT {
            return Err(self.fail(format!("expected ChannelEncryptResult, got {}", packet.msg_type)));
        }
        let result = match EncryptResult::decode(&packet.body) {
            Ok(result) => result.result,
            Err(e) => return Err(self.fail(e.to_string())),
        };
        if !result.is_ok() {
            return Err(self.fail(format!("result {}", result)));
        }
        let Some(key) = self.session_key.take() else {
            return Err(self.fail("no session key"));
        };
        let cipher = match ChannelCipher::new(&key) {
            Ok(cipher) => cipher,
            Err(e) => return Err(self.fail(e.to_string())),
        };
        self.state = HandshakeState::Established;
        Ok(cipher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{decode_message, encode_message};
    use std::sync::OnceLock;

    fn server_key() -> &'static UniversePrivateKey {
        static KEY: OnceLock<UniversePrivateKey> = OnceLock::new();
        KEY.get_or_init(|| UniversePrivateKey::generate(1024).unwrap())
    }

    fn roundtrip(packet: &PacketMsg) -> PacketMsg {
        decode_message(&encode_message(
            packet.msg_type,
            &packet.header,
            &packet.body,
            &packet.payload,
        ))
        .unwrap()
    }

    struct Exchange {
        challenge: [u8; CHALLENGE_SIZE],
        wrapped_key: Vec<u8>,
        server_key: SessionKey,
        outcome: Result<ChannelCipher>,
    }

    /// Runs the server side against `negotiator` and returns what crossed the wire.
    fn server_side(negotiator: &mut ChannelNegotiator, result: EResult) -> Exchange {
        let request = EncryptRequest::random(Universe::Public);
        negotiator.start();
        let response_packet = negotiator
            .handle_challenge(&roundtrip(&request.to_packet()))
            .unwrap();
        let response_packet = roundtrip(&response_packet);
        assert_eq!(response_packet.msg_type, MsgType::CHANNEL_ENCRYPT_RESPONSE);
        let response = EncryptResponse::decode(&response_packet.body).unwrap();
        let server_key = server_key()
            .unwrap_session_key(&response.wrapped_key, &request.challenge)
            .unwrap();
        let outcome = negotiator.handle_result(&roundtrip(&EncryptResult { result }.to_packet(Universe::Public)));
        Exchange {
            challenge: request.challenge,
            wrapped_key: response.wrapped_key,
            server_key,
            outcome,
        }
    }

    fn negotiator() -> ChannelNegotiator {
        ChannelNegotiator::new(Universe::Public, server_key().public_key())
    }

    #[test]
    fn test_handshake_success() {
        let mut negotiator = negotiator();
        assert_eq!(negotiator.state(), HandshakeState::Idle);
        let exchange = server_side(&mut negotiator, EResult::OK);
        let client_cipher = exchange.outcome.unwrap();
        assert_eq!(negotiator.state(), HandshakeState::Established);

        let server_cipher = ChannelCipher::new(&exchange.server_key).unwrap();
        let sealed = client_cipher.encrypt(b"ClientHello").unwrap();
        assert_eq!(server_cipher.decrypt(&sealed).unwrap(), b"ClientHello");
    }

    #[test]
    fn test_observer_without_private_key_cannot_read_channel() {
        let mut negotiator = negotiator();
        let exchange = server_side(&mut negotiator, EResult::OK);
        let client_cipher = exchange.outcome.unwrap();
        let sealed = client_cipher.encrypt(b"secret logon password").unwrap();

        // Everything an observer sees: the public key, the challenge, the wrapped key.
        let wire = &exchange.wrapped_key;
        assert!(!wire
            .windows(SESSION_KEY_SIZE)
            .any(|w| w == exchange.server_key.0.as_slice()));
        let public_pem = server_key().public_key().to_pem().unwrap();
        assert!(!public_pem.contains("PRIVATE"));

        let other = UniversePrivateKey::generate(1024).unwrap();
        assert!(other.unwrap_session_key(wire, &exchange.challenge).is_err());

        let mut guess = [0u8; SESSION_KEY_SIZE];
        guess[..CHALLENGE_SIZE].copy_from_slice(&exchange.challenge);
        let guessed = ChannelCipher::new(&SessionKey(guess)).unwrap();
        assert!(guessed.decrypt(&sealed).is_err());

        let server_cipher = ChannelCipher::new(&exchange.server_key).unwrap();
        assert_eq!(server_cipher.decrypt(&sealed).unwrap(), b"secret logon password");
    }

    #[test]
    fn test_wrapping_is_randomized() {
        let public = server_key().public_key();
        let key = SessionKey::generate();
        let challenge = [3u8; CHALLENGE_SIZE];
        let first = public.wrap_session_key(&key, &challenge).unwrap();
        let second = public.wrap_session_key(&key, &challenge).unwrap();
        assert_ne!(first, second);
        assert_eq!(server_key().unwrap_session_key(&first, &challenge).unwrap().0, key.0);
        assert_eq!(server_key().unwrap_session_key(&second, &challenge).unwrap().0, key.0);
    }

    #[test]
    fn test_handshake_negative_result() {
        let mut negotiator = negotiator();
        let exchange = server_side(&mut negotiator, EResult::FAIL);
        assert!(matches!(exchange.outcome, Err(TransportError::Handshake { .. })));
        assert_eq!(negotiator.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_universe_mismatch_fails() {
        let mut negotiator = ChannelNegotiator::new(Universe::Beta, server_key().public_key());
        negotiator.start();
        let request = EncryptRequest::random(Universe::Public).to_packet();
        assert!(negotiator.handle_challenge(&request).is_err());
        assert_eq!(negotiator.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_result_before_challenge_fails() {
        let mut negotiator = negotiator();
        negotiator.start();
        let result = EncryptResult { result: EResult::OK }.to_packet(Universe::Public);
        assert!(negotiator.handle_result(&result).is_err());
        assert_eq!(negotiator.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_wrapped_key_bound_to_challenge() {
        let key = SessionKey::generate();
        let challenge = [7u8; CHALLENGE_SIZE];
        let wrapped = server_key()
            .public_key()
            .wrap_session_key(&key, &challenge)
            .unwrap();
        assert!(server_key()
            .unwrap_session_key(&wrapped, &[8u8; CHALLENGE_SIZE])
            .is_err());
        let mut corrupted = wrapped.clone();
        corrupted[0] ^= 0x01;
        assert!(server_key().unwrap_session_key(&corrupted, &challenge).is_err());
    }

    #[test]
    fn test_builtin_universe_keys_parse() {
        let public = UniverseKey::for_universe(Universe::Public).unwrap();
        let beta = UniverseKey::for_universe(Universe::Beta).unwrap();
        assert_ne!(public, beta);
        assert!(UniverseKey::for_universe(Universe::Internal).is_ok());
        assert!(UniverseKey::for_universe(Universe::Dev).is_ok());
        assert!(UniverseKey::for_universe(Universe::Invalid).is_err());
    }

    #[test]
    fn test_tampered_frame_fails() {
        let cipher = ChannelCipher::new(&SessionKey::generate()).unwrap();
        let mut sealed = cipher.encrypt(b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(
            cipher.decrypt(&sealed),
            Err(TransportError::DecryptionFailed)
        ));
        assert!(matches!(
            cipher.decrypt(&[0u8; 8]),
            Err(TransportError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_response_crc_checked() {
        let response = EncryptResponse {
            protocol_version: 1,
            wrapped_key: vec![1, 2, 3, 4],
        };
        let mut body = response.encode();
        assert_eq!(EncryptResponse::decode(&body).unwrap(), response);
        body[9] ^= 0xFF;
        assert!(EncryptResponse::decode(&body).is_err());
    }

    #[test]
    fn test_universe_key_pem_roundtrip() {
        let public = server_key().public_key();
        let pem = public.to_pem().unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));
        assert_eq!(UniverseKey::from_pem(&pem).unwrap(), public);
        assert!(UniverseKey::from_pem("not a key").is_err());
        assert!(UniversePrivateKey::from_pem("not a key").is_err());
    }

    #[test]
    fn test_debug_redacts_keys() {
        let key = SessionKey([1u8; 32]);
        assert_eq!(format!("{:?}", key), "SessionKey([REDACTED])");
        assert_eq!(
            format!("{:?}", server_key()),
            "UniversePrivateKey([REDACTED])"
        );
    }
}
