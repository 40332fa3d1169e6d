//! Algorithm profiles for the `ssh` transport.
//!
//! `secure` is russh's own preference set. `legacy_compatible` appends the
//! SHA-1 key exchanges, CBC ciphers, `hmac-sha1` and SHA-1 RSA / DSA host
//! keys still spoken by old embedded sftp servers, after the modern ones, so
//! a modern peer still negotiates the modern algorithms.

use async_ssh2_tokio::ServerCheckMethod;
use russh::keys::Algorithm;
use russh::{Preferred, cipher, kex, mac};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

const LEGACY_KEX: &[kex::Name] = &[kex::DH_G14_SHA1, kex::DH_GEX_SHA1, kex::DH_G1_SHA1];
const LEGACY_CIPHERS: &[cipher::Name] = &[
    cipher::AES_256_CBC,
    cipher::AES_192_CBC,
    cipher::AES_128_CBC,
];
const LEGACY_MACS: &[mac::Name] = &[mac::HMAC_SHA1];
const LEGACY_HOST_KEYS: &[Algorithm] = &[Algorithm::Rsa { hash: None }, Algorithm::Dsa];

/// Algorithm profile selected by the `security` connection parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    #[default]
    Secure,
    LegacyCompatible,
}

/// Algorithm profile plus host key policy of one ssh transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSecurityOptions {
    pub level: SecurityLevel,
    pub server_check: ServerCheckMethod,
}

impl Default for ConnectionSecurityOptions {
    fn default() -> Self {
        Self::for_level(SecurityLevel::Secure)
    }
}

impl ConnectionSecurityOptions {
    /// Secure servers are checked against `~/.ssh/known_hosts`. Legacy
    /// devices rarely have stable keys there, so their keys are not checked.
    pub fn for_level(level: SecurityLevel) -> Self {
        let server_check = match level {
            SecurityLevel::Secure => ServerCheckMethod::DefaultKnownHostsFile,
            SecurityLevel::LegacyCompatible => ServerCheckMethod::NoCheck,
        };
        Self {
            level,
            server_check,
        }
    }

    pub(super) fn preferred(&self) -> Preferred {
        let modern = Preferred::default();
        match self.level {
            SecurityLevel::Secure => modern,
            SecurityLevel::LegacyCompatible => Preferred {
                kex: Cow::Owned(append_missing(&modern.kex, LEGACY_KEX)),
                key: Cow::Owned(append_missing(&modern.key, LEGACY_HOST_KEYS)),
                cipher: Cow::Owned(append_missing(&modern.cipher, LEGACY_CIPHERS)),
                mac: Cow::Owned(append_missing(&modern.mac, LEGACY_MACS)),
                compression: modern.compression,
            },
        }
    }
}

fn append_missing<T: Clone + PartialEq>(modern: &[T], extra: &[T]) -> Vec<T> {
    let mut all = modern.to_vec();
    for alg in extra {
        if !all.contains(alg) {
            all.push(alg.clone());
        }
    }
    all
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_profile_extends_modern_preferences() {
        let modern = ConnectionSecurityOptions::for_level(SecurityLevel::Secure).preferred();
        let legacy =
            ConnectionSecurityOptions::for_level(SecurityLevel::LegacyCompatible).preferred();

        // Modern algorithms keep their rank, so a modern server is unaffected.
        assert_eq!(&legacy.kex[..modern.kex.len()], &modern.kex[..]);
        assert_eq!(&legacy.cipher[..modern.cipher.len()], &modern.cipher[..]);
        assert_eq!(&legacy.mac[..modern.mac.len()], &modern.mac[..]);
        assert_eq!(legacy.compression, modern.compression);

        assert!(legacy.kex.contains(&kex::DH_G1_SHA1));
        assert!(legacy.cipher.contains(&cipher::AES_128_CBC));
        assert!(legacy.mac.contains(&mac::HMAC_SHA1));
        assert!(legacy.key.contains(&Algorithm::Dsa));
    }

    #[test]
    fn secure_profile_offers_no_cbc_cipher() {
        let secure = ConnectionSecurityOptions::default().preferred();
        for cbc in LEGACY_CIPHERS {
            assert!(!secure.cipher.contains(cbc), "{cbc:?} must not be offered");
        }
        assert!(!secure.key.contains(&Algorithm::Dsa));
    }

    #[test]
    fn only_legacy_profile_skips_host_key_check() {
        assert!(matches!(
            ConnectionSecurityOptions::default().server_check,
            ServerCheckMethod::DefaultKnownHostsFile
        ));
        assert!(matches!(
            ConnectionSecurityOptions::for_level(SecurityLevel::LegacyCompatible).server_check,
            ServerCheckMethod::NoCheck
        ));
    }

    #[test]
    fn append_missing_keeps_order_and_skips_duplicates() {
        assert_eq!(append_missing(&[1, 2, 3], &[3, 4, 1, 5]), vec![1, 2, 3, 4, 5]);
    }
}
