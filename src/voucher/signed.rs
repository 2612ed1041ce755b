//! Ed25519 reference voucher scheme.
//!
//! The client identifier is the 32-byte Ed25519 verifying key. The signature
//! covers a domain-separated SHA-256 digest:
//!
//! ```text
//! SHA-256("micropay-voucher-v1" || vendor[32] || nonce_be[8] || atoms_be[8])
//! ```
//!
//! The client key is implied by the verification and is not hashed.

use crate::error::{Error, Result};
use crate::voucher::{Atoms, Voucher};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Domain separation tag for voucher signatures.
pub const VOUCHER_DOMAIN: &[u8] = b"micropay-voucher-v1";

/// Client identifier: an Ed25519 verifying key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientKey(pub [u8; 32]);

/// Vendor identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VendorId(pub [u8; 32]);

macro_rules! hex_id {
    ($t:ty) => {
        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($t), hex::encode(self.0))
            }
        }

        impl std::str::FromStr for $t {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                let bytes = hex::decode(s.trim_start_matches("0x"))
                    .map_err(|e| Error::Serialization(format!("invalid hex id: {e}")))?;
                let arr: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
                    Error::Serialization(format!("id must be 32 bytes, got {}", b.len()))
                })?;
                Ok(Self(arr))
            }
        }
    };
}

hex_id!(ClientKey);
hex_id!(VendorId);

/// A voucher signed with Ed25519.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedVoucher {
    /// Signing client.
    pub client: ClientKey,
    /// Paid vendor.
    pub vendor: VendorId,
    /// Chain position.
    pub nonce: u64,
    /// Value in atoms.
    pub atoms: Atoms,
    /// Ed25519 signature over [`SignedVoucher::signing_digest`].
    pub signature: Vec<u8>,
}

impl SignedVoucher {
    /// Digest covered by the signature.
    #[must_use]
    pub fn signing_digest(vendor: &VendorId, nonce: u64, atoms: Atoms) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(VOUCHER_DOMAIN);
        hasher.update(vendor.0);
        hasher.update(nonce.to_be_bytes());
        hasher.update(atoms.to_be_bytes());
        hasher.finalize().into()
    }

    /// Serialize to `MessagePack` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from `MessagePack` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid voucher encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| Error::Serialization(format!("failed to decode voucher: {e}")))
    }

    /// Hex-encoded `MessagePack` form.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_hex(&self) -> Result<String> {
        self.to_bytes().map(hex::encode)
    }

    /// Parse the hex-encoded `MessagePack` form.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid hex or not a voucher.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| Error::Serialization(format!("invalid voucher hex: {e}")))?;
        Self::from_bytes(&bytes)
    }
}

impl Voucher for SignedVoucher {
    type Client = ClientKey;
    type Vendor = VendorId;

    fn verify_signature(&self) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.client.0) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&self.signature) else {
            return false;
        };
        let digest = Self::signing_digest(&self.vendor, self.nonce, self.atoms);
        key.verify_strict(&digest, &signature).is_ok()
    }

    fn nonce(&self) -> u64 {
        self.nonce
    }

    fn atoms(&self) -> Atoms {
        self.atoms
    }

    fn client(&self) -> &ClientKey {
        &self.client
    }

    fn vendor(&self) -> &VendorId {
        &self.vendor
    }
}

/// Client-side signer producing [`SignedVoucher`] values.
pub struct VoucherSigner {
    key: SigningKey,
}

impl VoucherSigner {
    /// Generate a fresh random signing key.
    #[must_use]
    pub fn generate() -> Self {
        let seed: [u8; 32] = rand::random();
        Self::from_bytes(&seed)
    }

    /// Restore a signer from its 32-byte secret.
    #[must_use]
    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(secret),
        }
    }

    /// The 32-byte secret.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    /// The client identifier vouchers from this signer carry.
    #[must_use]
    pub fn client(&self) -> ClientKey {
        ClientKey(self.key.verifying_key().to_bytes())
    }

    /// Sign a voucher for `vendor` at `nonce` worth `atoms`.
    #[must_use]
    pub fn sign(&self, vendor: VendorId, nonce: u64, atoms: Atoms) -> SignedVoucher {
        let digest = SignedVoucher::signing_digest(&vendor, nonce, atoms);
        let signature = self.key.sign(&digest);
        SignedVoucher {
            client: self.client(),
            vendor,
            nonce,
            atoms,
            signature: signature.to_bytes().to_vec(),
        }
    }
}

impl fmt::Debug for VoucherSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoucherSigner")
            .field("client", &self.client())
            .finish_non_exhaustive()
    }
}
