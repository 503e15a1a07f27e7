//! Secret values and at-rest encryption of secrets inside records
//!
//! A [`Secret`] serializes as `{"@secret": "<value>"}` so it survives the trip
//! through arbitrary JSON outputs. Before a record is written, a
//! [`SecretCipher`] seals every such node into `{"@secret-sealed": "<base64>"}`;
//! after reading, it opens them again.

use crate::error::{Result, StateError};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

pub const SECRET_TAG: &str = "@secret";
pub const SEALED_TAG: &str = "@secret-sealed";

const KEY_CONTEXT: &str = "stratum 2024-06 state secret key";
const NONCE_LEN: usize = 12;

/// A sensitive string value
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The plaintext value, for the point where it is handed to an external API
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Whether a JSON value is a serialized secret
    pub fn is_secret_value(value: &Value) -> bool {
        single_key(value, SECRET_TAG).is_some()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(****)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "****")
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(SECRET_TAG, &self.0)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Tagged {
            #[serde(rename = "@secret")]
            secret: String,
        }
        Tagged::deserialize(deserializer).map(|t| Secret(t.secret))
    }
}

/// Encrypts secret nodes of JSON documents with AES-256-GCM
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

impl SecretCipher {
    /// Derive the key from a passphrase
    pub fn from_passphrase(passphrase: &str) -> Result<Self> {
        if passphrase.is_empty() {
            return Err(StateError::Secret("passphrase must not be empty".into()));
        }
        let key_bytes = blake3::derive_key(KEY_CONTEXT, passphrase.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| StateError::Secret("encryption failed".into()))?;

        let mut payload = nonce.to_vec();
        payload.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(payload))
    }

    pub fn decrypt(&self, sealed: &str) -> Result<String> {
        let payload = STANDARD
            .decode(sealed)
            .map_err(|e| StateError::Secret(format!("invalid sealed secret: {}", e)))?;
        if payload.len() <= NONCE_LEN {
            return Err(StateError::Secret("sealed secret is truncated".into()));
        }
        let (nonce, ciphertext) = payload.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| StateError::Secret("cannot decrypt secret (wrong passphrase?)".into()))?;
        String::from_utf8(plaintext)
            .map_err(|_| StateError::Secret("decrypted secret is not UTF-8".into()))
    }

    /// Replace every `{"@secret": ..}` node with its sealed form
    pub fn seal(&self, value: &Value) -> Result<Value> {
        map_secrets(value, &mut |node| match single_key(node, SECRET_TAG) {
            Some(Value::String(plain)) => {
                let sealed = self.encrypt(plain)?;
                Ok(Some(tagged(SEALED_TAG, sealed)))
            }
            _ => Ok(None),
        })
    }

    /// Replace every sealed node with the plain `{"@secret": ..}` form
    pub fn unseal(&self, value: &Value) -> Result<Value> {
        map_secrets(value, &mut |node| match single_key(node, SEALED_TAG) {
            Some(Value::String(sealed)) => {
                let plain = self.decrypt(sealed)?;
                Ok(Some(tagged(SECRET_TAG, plain)))
            }
            _ => Ok(None),
        })
    }
}

/// Fail when a document holds sealed secrets but no cipher is configured
pub fn ensure_no_sealed(value: &Value) -> Result<()> {
    map_secrets(value, &mut |node| {
        if single_key(node, SEALED_TAG).is_some() {
            return Err(StateError::Secret(
                "state contains encrypted secrets but no passphrase is configured".into(),
            ));
        }
        Ok(None)
    })
    .map(|_| ())
}

fn single_key<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get(key),
        _ => None,
    }
}

fn tagged(key: &str, value: String) -> Value {
    let mut map = Map::new();
    map.insert(key.to_string(), Value::String(value));
    Value::Object(map)
}

fn map_secrets<F>(value: &Value, f: &mut F) -> Result<Value>
where
    F: FnMut(&Value) -> Result<Option<Value>>,
{
    if let Some(replaced) = f(value)? {
        return Ok(replaced);
    }
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), map_secrets(v, f)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .map(|v| map_secrets(v, f))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}
