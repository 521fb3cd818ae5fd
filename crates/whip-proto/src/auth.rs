//! The shared-secret challenge/response handshake.
//!
//! The server opens every connection with an 8-byte challenge carrying a
//! random 7-character phrase. The connecting side answers with 41 bytes: an
//! identifier byte naming what it is (plain client or peer server) followed
//! by the lowercase-hex SHA-1 of `password || phrase`. The server closes the
//! handshake with a 2-byte status.

use rand::Rng;
use sha1::{Digest, Sha1};

use crate::ProtocolError;

pub const CHALLENGE_SIZE: usize = 8;
pub const PHRASE_SIZE: usize = 7;
pub const RESPONSE_SIZE: usize = 41;
pub const STATUS_SIZE: usize = 2;

const CHALLENGE_IDENTIFIER: u8 = 0;
const STATUS_IDENTIFIER: u8 = 1;

/// Identifier byte leading an auth response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ident {
    /// An ordinary asset client.
    Client = 0,
    /// Another WHIP server (intramesh or replication). Servers are answered
    /// from local storage only, never by recursing back into the mesh.
    Server = 100,
}

#[derive(Debug, PartialEq, Eq)]
pub struct AuthChallenge {
    phrase: [u8; PHRASE_SIZE],
}

impl AuthChallenge {
    /// Generates a fresh challenge with a random printable phrase in
    /// `'0'..='z'`.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut phrase = [0u8; PHRASE_SIZE];
        for ch in phrase.iter_mut() {
            *ch = rng.gen_range(b'0'..=b'z');
        }
        AuthChallenge { phrase }
    }

    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() != CHALLENGE_SIZE {
            return Err(ProtocolError::Truncated);
        }
        if buf[0] != CHALLENGE_IDENTIFIER {
            return Err(ProtocolError::InvalidAuthMessage);
        }
        let mut phrase = [0u8; PHRASE_SIZE];
        phrase.copy_from_slice(&buf[1..]);
        Ok(AuthChallenge { phrase })
    }

    pub fn encode(&self) -> [u8; CHALLENGE_SIZE] {
        let mut buf = [0u8; CHALLENGE_SIZE];
        buf[0] = CHALLENGE_IDENTIFIER;
        buf[1..].copy_from_slice(&self.phrase);
        buf
    }

    pub fn phrase(&self) -> &[u8] {
        &self.phrase
    }
}

/// `hex(sha1(password || phrase))`, which both sides must compute
/// identically.
pub fn challenge_hash(password: &str, phrase: &[u8]) -> String {
    let mut sha = Sha1::new();
    sha.update(password.as_bytes());
    sha.update(phrase);
    hex::encode(sha.finalize())
}

#[derive(Debug, PartialEq, Eq)]
pub struct AuthResponse {
    ident: u8,
    digest: [u8; RESPONSE_SIZE - 1],
}

impl AuthResponse {
    /// Builds the answer to `challenge` for a connection of the given kind.
    pub fn answer(ident: Ident, password: &str, phrase: &[u8]) -> Self {
        let hash = challenge_hash(password, phrase);
        let mut digest = [0u8; RESPONSE_SIZE - 1];
        digest.copy_from_slice(hash.as_bytes());
        AuthResponse {
            ident: ident as u8,
            digest,
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() != RESPONSE_SIZE {
            return Err(ProtocolError::Truncated);
        }
        if buf[0] != Ident::Client as u8 && buf[0] != Ident::Server as u8 {
            return Err(ProtocolError::InvalidAuthMessage);
        }
        let mut digest = [0u8; RESPONSE_SIZE - 1];
        digest.copy_from_slice(&buf[1..]);
        Ok(AuthResponse {
            ident: buf[0],
            digest,
        })
    }

    pub fn encode(&self) -> [u8; RESPONSE_SIZE] {
        let mut buf = [0u8; RESPONSE_SIZE];
        buf[0] = self.ident;
        buf[1..].copy_from_slice(&self.digest);
        buf
    }

    pub fn is_server(&self) -> bool {
        self.ident == Ident::Server as u8
    }

    /// Checks the embedded digest against the hash the server expects.
    pub fn verifies(&self, password: &str, phrase: &[u8]) -> bool {
        self.digest == challenge_hash(password, phrase).as_bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Success,
    Failure,
}

impl AuthStatus {
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() != STATUS_SIZE {
            return Err(ProtocolError::Truncated);
        }
        if buf[0] != STATUS_IDENTIFIER {
            return Err(ProtocolError::InvalidAuthMessage);
        }
        match buf[1] {
            0 => Ok(AuthStatus::Success),
            1 => Ok(AuthStatus::Failure),
            _ => Err(ProtocolError::InvalidAuthMessage),
        }
    }

    pub fn encode(&self) -> [u8; STATUS_SIZE] {
        let status = match self {
            AuthStatus::Success => 0,
            AuthStatus::Failure => 1,
        };
        [STATUS_IDENTIFIER, status]
    }
}
