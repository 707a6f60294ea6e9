//! Secret module adapter
//!
//! Models a PKCS-style token holding the node's long-lived secrets: the RSA
//! identity keypair, the nonce master seed and monotonic counter, per-round
//! DKG material, and the nonce audit records. The adapter owns every
//! operation that touches a secret value; the nonce scalar and the DKG share
//! never cross this boundary in either operation mode — callers get
//! commitments and partial-signature scalars, not keys.
//!
//! `production` mode additionally refuses plaintext readback of stored
//! secrets; `demo` mode permits it for the audit display and the test suite.

pub mod token;

use hmac::{Hmac, Mac};
use k256::{ProjectivePoint, Scalar};
use rand::{CryptoRng, RngCore};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};
use std::sync::Arc;
use tracing::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::math;
use crate::types::{ModulePin, OperationMode};
use crate::{Error, Result};

use token::{TokenBackend, TokenObject};

/// RSA modulus size of the identity keypair.
pub const IDENTITY_KEY_BITS: usize = 2048;

/// Label of the identity keypair.
pub const LABEL_IDENTITY_KEY: &str = "IDENTITY_KEY";
/// Label of the 32-byte nonce master seed.
pub const LABEL_NONCE_MASTER_SEED: &str = "NONCE_MASTER_SEED";
/// Label of the monotonic counter (8 big-endian bytes).
pub const LABEL_NONCE_COUNTER: &str = "NONCE_COUNTER";

const NONCE_DERIV_PREFIX: &str = "NONCE_DERIV_";
const NONCE_COMMIT_PREFIX: &str = "NONCE_COMMIT_";

/// Label of a round's ephemeral polynomial coefficients.
pub fn dkg_coeffs_label(round_id: &str) -> String {
    format!("DKG_COEFFS_{round_id}")
}

/// Label of a round's final share.
pub fn dkg_share_label(round_id: &str) -> String {
    format!("DKG_SHARE_{round_id}")
}

/// Label of a request's nonce-commitment backup record.
pub fn nonce_commit_label(request_id: &str) -> String {
    format!("{NONCE_COMMIT_PREFIX}{request_id}")
}

/// Label of a derivation audit record.
pub fn nonce_deriv_label(counter: u64) -> String {
    format!("{NONCE_DERIV_PREFIX}{counter}")
}

/// Result of a fresh nonce derivation. The nonce scalar itself stays inside
/// the module.
#[derive(Debug, Clone)]
pub struct NonceDerivation {
    /// The counter value this nonce is bound to.
    pub counter: u64,
    /// Compressed `R = k·G`.
    pub r_hex: String,
}

/// One entry of the module's derivation audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationRecord {
    pub counter: u64,
    pub request_id: String,
    pub r_hex: String,
    pub message_digest_hex: String,
}

/// Stored form of a derivation record (the counter lives in the label).
#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct StoredDerivation {
    request_id: String,
    #[serde(rename = "R_hex")]
    r_hex: String,
    message_digest_hex: String,
}

/// Handle to a node's secret module.
pub struct SecretModule {
    backend: Arc<dyn TokenBackend>,
    mode: OperationMode,
}

impl SecretModule {
    pub fn new(backend: Arc<dyn TokenBackend>, mode: OperationMode) -> Self {
        Self { backend, mode }
    }

    pub fn mode(&self) -> OperationMode {
        self.mode
    }

    /// Authenticate and open a session. A token that has never seen a PIN is
    /// personalised with this one. The session logs out when dropped.
    pub fn login(&self, pin: &ModulePin) -> Result<ModuleSession<'_>> {
        let hash = math::sha256(pin.reveal().as_bytes());
        match self.backend.pin_hash()? {
            Some(stored) if stored == hash => {}
            Some(_) => return Err(Error::BadPin),
            None => self.backend.set_pin_hash(&hash)?,
        }
        Ok(ModuleSession { module: self })
    }

    /// Encrypt a 32-byte share for another node's posted identity.
    pub fn encrypt_for_recipient<R: RngCore + CryptoRng>(
        recipient_pem: &str,
        plaintext: &[u8],
        rng: &mut R,
    ) -> Result<Vec<u8>> {
        let public_key = RsaPublicKey::from_public_key_pem(recipient_pem)
            .map_err(|e| Error::Crypto(format!("bad recipient public key: {e}")))?;
        public_key
            .encrypt(rng, Oaep::new::<Sha256>(), plaintext)
            .map_err(|e| Error::Crypto(format!("share encryption failed: {e}")))
    }
}

/// An authenticated session. All secret-touching operations live here.
pub struct ModuleSession<'m> {
    module: &'m SecretModule,
}

impl ModuleSession<'_> {
    /// Explicitly end the session. Dropping it has the same effect.
    pub fn logout(self) {}

    fn backend(&self) -> &dyn TokenBackend {
        self.module.backend.as_ref()
    }

    /// Attributes for generic secrets under the current mode.
    fn secret_object(&self, label: String, value: Vec<u8>) -> TokenObject {
        let extractable = self.module.mode.extractable();
        TokenObject::new(label, value, !extractable, extractable)
    }

    /// Internal plaintext read, bypassing the extractability gate. Only the
    /// adapter itself may call this; public readback goes through
    /// [`Self::export_secret`].
    fn read_internal(&self, label: &str) -> Result<Zeroizing<Vec<u8>>> {
        let object = self
            .backend()
            .get(label)?
            .ok_or_else(|| Error::MissingObject(label.to_string()))?;
        Ok(Zeroizing::new(object.value.clone()))
    }

    /// Plaintext readback of a stored secret. Refused for non-extractable
    /// objects, which is every generic secret in production mode.
    pub fn export_secret(&self, label: &str) -> Result<Vec<u8>> {
        let object = self
            .backend()
            .get(label)?
            .ok_or_else(|| Error::MissingObject(label.to_string()))?;
        if !object.extractable {
            return Err(Error::SecretExtractionForbidden(label.to_string()));
        }
        Ok(object.value.clone())
    }

    pub fn has_object(&self, label: &str) -> Result<bool> {
        Ok(self.backend().get(label)?.is_some())
    }

    // ------------------------------------------------------------------
    // Identity keypair
    // ------------------------------------------------------------------

    /// Create the RSA identity keypair if absent. The private half is always
    /// non-extractable, regardless of mode.
    pub fn ensure_identity<R: RngCore + CryptoRng>(&self, rng: &mut R) -> Result<bool> {
        if self.has_object(LABEL_IDENTITY_KEY)? {
            return Ok(false);
        }
        debug!(bits = IDENTITY_KEY_BITS, "generating identity keypair");
        let private_key = RsaPrivateKey::new(rng, IDENTITY_KEY_BITS)
            .map_err(|e| Error::Crypto(format!("identity key generation failed: {e}")))?;
        let der = private_key
            .to_pkcs8_der()
            .map_err(|e| Error::Crypto(format!("identity key encoding failed: {e}")))?;
        self.backend().insert(TokenObject::new(
            LABEL_IDENTITY_KEY,
            der.as_bytes().to_vec(),
            true,
            false,
        ))?;
        Ok(true)
    }

    fn identity_key(&self) -> Result<RsaPrivateKey> {
        let der = self.read_internal(LABEL_IDENTITY_KEY)?;
        RsaPrivateKey::from_pkcs8_der(&der)
            .map_err(|e| Error::Crypto(format!("corrupt identity key: {e}")))
    }

    /// PEM of the identity public key, for posting to the board.
    pub fn identity_public_key_pem(&self) -> Result<String> {
        self.identity_key()?
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::Crypto(format!("identity key encoding failed: {e}")))
    }

    /// Decrypt a share addressed to this node. The private key never leaves
    /// the module.
    pub fn decrypt_share(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.identity_key()?
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|e| Error::Crypto(format!("share decryption failed: {e}")))
    }

    // ------------------------------------------------------------------
    // Nonce derivation system
    // ------------------------------------------------------------------

    /// One-time setup of the master seed and the counter. Returns whether
    /// anything was created.
    pub fn init_nonce_derivation<R: RngCore + CryptoRng>(&self, rng: &mut R) -> Result<bool> {
        if self.has_object(LABEL_NONCE_MASTER_SEED)? {
            return Ok(false);
        }
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut seed);
        self.backend()
            .insert(self.secret_object(LABEL_NONCE_MASTER_SEED.to_string(), seed.to_vec()))?;
        seed.zeroize();
        self.backend()
            .insert(self.secret_object(LABEL_NONCE_COUNTER.to_string(), 0u64.to_be_bytes().to_vec()))?;
        Ok(true)
    }

    /// Current counter value.
    pub fn counter(&self) -> Result<u64> {
        let raw = self.read_internal(LABEL_NONCE_COUNTER)?;
        parse_counter(&raw)
    }

    /// Atomically advance the counter and return the new value. The counter
    /// never decrements and never wraps; `u64::MAX` is an explicit
    /// exhaustion error.
    pub fn counter_increment_and_get(&self) -> Result<u64> {
        let new_value = self
            .backend()
            .update_value(LABEL_NONCE_COUNTER, &mut |current| {
                let value = parse_counter(current)?;
                let next = value.checked_add(1).ok_or(Error::CounterExhausted)?;
                Ok(next.to_be_bytes().to_vec())
            })?;
        parse_counter(&new_value)
    }

    /// HMAC-SHA512 nonce scalar for a given counter value:
    /// `mac = HMAC(seed, 0x00 ‖ BE8(counter) ‖ request_id ‖ digest)`,
    /// `k = mac[0..32] mod n`.
    fn nonce_scalar(&self, counter: u64, request_id: &str, digest: &[u8; 32]) -> Result<Scalar> {
        let seed = self.read_internal(LABEL_NONCE_MASTER_SEED)?;
        let mut mac = Hmac::<Sha512>::new_from_slice(&seed)
            .map_err(|e| Error::Crypto(format!("bad master seed: {e}")))?;
        mac.update(&[0x00]);
        mac.update(&counter.to_be_bytes());
        mac.update(request_id.as_bytes());
        mac.update(digest);
        let output = mac.finalize().into_bytes();
        let mut head = [0u8; 32];
        head.copy_from_slice(&output[..32]);
        let k = math::scalar_reduce(&head);
        head.zeroize();
        Ok(k)
    }

    /// Derive a fresh nonce for a signing request.
    ///
    /// Advances the counter first; even if the caller crashes immediately
    /// after, the same `(request_id, digest)` pair can never map to this
    /// counter value again. A zero candidate (cryptographically negligible)
    /// burns the counter value and retries.
    pub fn derive_nonce(&self, request_id: &str, digest: &[u8; 32]) -> Result<NonceDerivation> {
        if !self.has_object(LABEL_NONCE_MASTER_SEED)? {
            return Err(Error::Module(
                "nonce derivation not initialised".to_string(),
            ));
        }
        loop {
            let counter = self.counter_increment_and_get()?;
            let k = self.nonce_scalar(counter, request_id, digest)?;
            if bool::from(k.is_zero()) {
                warn!(counter, "derived zero nonce candidate, advancing counter");
                continue;
            }
            let r_hex = math::point_to_hex(&(ProjectivePoint::GENERATOR * k))?;
            let record = StoredDerivation {
                request_id: request_id.to_string(),
                r_hex: r_hex.clone(),
                message_digest_hex: hex::encode(digest),
            };
            self.backend().insert(
                self.secret_object(nonce_deriv_label(counter), serde_json::to_vec(&record)?),
            )?;
            debug!(counter, request_id, "nonce derived");
            return Ok(NonceDerivation { counter, r_hex });
        }
    }

    /// Recompute the commitment for an already-derived nonce without
    /// touching the counter. Used by finalise to cross-check the recorded
    /// `R` before computing a partial signature.
    pub fn nonce_commitment(
        &self,
        counter: u64,
        request_id: &str,
        digest: &[u8; 32],
    ) -> Result<String> {
        let k = self.nonce_scalar(counter, request_id, digest)?;
        math::point_to_hex(&(ProjectivePoint::GENERATOR * k))
    }

    /// Compute this node's partial signature
    /// `s = k + e · λ · share mod n` entirely inside the module. The nonce
    /// is re-derived from the counter and discarded before returning.
    pub fn partial_signature(
        &self,
        round_id: &str,
        counter: u64,
        request_id: &str,
        digest: &[u8; 32],
        challenge: &Scalar,
        lambda: &Scalar,
    ) -> Result<Scalar> {
        let k = self.nonce_scalar(counter, request_id, digest)?;
        let share_bytes = self.read_internal(dkg_share_label(round_id).as_str())?;
        let share_array: [u8; 32] = share_bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::Module("corrupt DKG share".to_string()))?;
        let share = math::scalar_reduce(&share_array);
        Ok(k + *challenge * *lambda * share)
    }

    /// Record the commitment backup for a request. Refuses to overwrite: an
    /// existing record is the module-layer reuse signal.
    pub fn store_nonce_commit(&self, request_id: &str, r_hex: &str) -> Result<()> {
        let label = nonce_commit_label(request_id);
        if self.has_object(&label)? {
            return Err(Error::NonceReuseAttempted {
                request_id: request_id.to_string(),
                layer: crate::ReuseLayer::SecretModule,
            });
        }
        self.backend()
            .insert(self.secret_object(label, r_hex.as_bytes().to_vec()))
    }

    pub fn has_nonce_commit(&self, request_id: &str) -> Result<bool> {
        self.has_object(&nonce_commit_label(request_id))
    }

    /// Request ids with a commitment backup record, sorted.
    pub fn committed_requests(&self) -> Result<Vec<String>> {
        Ok(self
            .backend()
            .labels()?
            .into_iter()
            .filter_map(|label| label.strip_prefix(NONCE_COMMIT_PREFIX).map(str::to_string))
            .collect())
    }

    /// Counters with a derivation record, sorted.
    pub fn derivation_counters(&self) -> Result<Vec<u64>> {
        let mut counters: Vec<u64> = self
            .backend()
            .labels()?
            .into_iter()
            .filter_map(|label| {
                label
                    .strip_prefix(NONCE_DERIV_PREFIX)
                    .and_then(|c| c.parse().ok())
            })
            .collect();
        counters.sort_unstable();
        Ok(counters)
    }

    /// Full derivation audit trail. Requires value readback, so demo mode
    /// only; production callers compare counters via
    /// [`Self::derivation_counters`].
    pub fn derivation_records(&self) -> Result<Vec<DerivationRecord>> {
        let mut records = Vec::new();
        for counter in self.derivation_counters()? {
            let raw = self.export_secret(&nonce_deriv_label(counter))?;
            let stored: StoredDerivation =
                serde_json::from_slice(&raw).map_err(|e| Error::Module(format!(
                    "corrupt derivation record {counter}: {e}"
                )))?;
            records.push(DerivationRecord {
                counter,
                request_id: stored.request_id,
                r_hex: stored.r_hex,
                message_digest_hex: stored.message_digest_hex,
            });
        }
        Ok(records)
    }

    // ------------------------------------------------------------------
    // DKG material
    // ------------------------------------------------------------------

    /// Sample (or, after a crash, reload) this round's polynomial and return
    /// the Feldman commitments. The coefficients stay in the module until
    /// [`Self::wipe_polynomial`].
    pub fn create_polynomial<R: RngCore + CryptoRng>(
        &self,
        round_id: &str,
        threshold: usize,
        rng: &mut R,
    ) -> Result<Vec<ProjectivePoint>> {
        let label = dkg_coeffs_label(round_id);
        if !self.has_object(&label)? {
            let coefficients = math::random_polynomial(threshold, rng);
            let mut encoded = Vec::with_capacity(threshold * 32);
            for coefficient in &coefficients {
                encoded.extend_from_slice(&coefficient.to_bytes());
            }
            self.backend().insert(self.secret_object(label, encoded))?;
        }
        self.polynomial_commitments(round_id)
    }

    fn polynomial(&self, round_id: &str) -> Result<Vec<Scalar>> {
        let raw = self.read_internal(&dkg_coeffs_label(round_id))?;
        if raw.len() % 32 != 0 || raw.is_empty() {
            return Err(Error::Module(format!(
                "corrupt polynomial for round {round_id}"
            )));
        }
        Ok(raw
            .chunks_exact(32)
            .map(|chunk| {
                let mut array = [0u8; 32];
                array.copy_from_slice(chunk);
                math::scalar_reduce(&array)
            })
            .collect())
    }

    /// Commitments `C_k = a_k · G` of the stored polynomial.
    pub fn polynomial_commitments(&self, round_id: &str) -> Result<Vec<ProjectivePoint>> {
        Ok(math::commit_polynomial(&self.polynomial(round_id)?))
    }

    /// `f(index)` of the stored polynomial: the share for one recipient.
    pub fn polynomial_share(&self, round_id: &str, index: u64) -> Result<Scalar> {
        Ok(math::eval_polynomial(&self.polynomial(round_id)?, index))
    }

    /// Wipe a round's coefficients after finalise.
    pub fn wipe_polynomial(&self, round_id: &str) -> Result<()> {
        self.backend().remove(&dkg_coeffs_label(round_id))?;
        Ok(())
    }

    /// Persist this node's final share for a round.
    pub fn store_dkg_share(&self, round_id: &str, share: &Scalar) -> Result<()> {
        self.backend()
            .replace(self.secret_object(dkg_share_label(round_id), share.to_bytes().to_vec()))
    }

    pub fn has_dkg_share(&self, round_id: &str) -> Result<bool> {
        self.has_object(&dkg_share_label(round_id))
    }
}

fn parse_counter(raw: &[u8]) -> Result<u64> {
    let array: [u8; 8] = raw
        .try_into()
        .map_err(|_| Error::Module("corrupt counter object".to_string()))?;
    Ok(u64::from_be_bytes(array))
}
