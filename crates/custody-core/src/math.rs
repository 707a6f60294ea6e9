//! secp256k1 field and group helpers
//!
//! Everything the ceremonies need from the curve: nonzero random scalars,
//! polynomial and commitment evaluation for Feldman VSS, Lagrange
//! coefficients at zero, the SEC1 compressed codec, and the Schnorr
//! challenge hash.

use k256::{
    elliptic_curve::{
        bigint::U256,
        ops::Reduce,
        sec1::{FromEncodedPoint, ToEncodedPoint},
        Field,
    },
    AffinePoint, EncodedPoint, ProjectivePoint, Scalar,
};
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Length of a SEC1 compressed point.
pub const COMPRESSED_POINT_LEN: usize = 33;

/// Length of a big-endian scalar.
pub const SCALAR_LEN: usize = 32;

/// Sample a scalar uniformly from `[1, n)`.
pub fn random_nonzero_scalar<R: RngCore + CryptoRng>(rng: &mut R) -> Scalar {
    loop {
        let candidate = Scalar::random(&mut *rng);
        if !bool::from(candidate.is_zero()) {
            return candidate;
        }
    }
}

/// Sample the `t` coefficients of a random polynomial of degree `t - 1`,
/// all in `[1, n)`.
pub fn random_polynomial<R: RngCore + CryptoRng>(threshold: usize, rng: &mut R) -> Vec<Scalar> {
    (0..threshold).map(|_| random_nonzero_scalar(rng)).collect()
}

/// Evaluate `f(x) = a_0 + a_1 x + … + a_{t-1} x^{t-1}` at an integer point.
pub fn eval_polynomial(coefficients: &[Scalar], x: u64) -> Scalar {
    let x_scalar = Scalar::from(x);
    let mut result = Scalar::ZERO;
    let mut x_power = Scalar::ONE;
    for coefficient in coefficients {
        result += *coefficient * x_power;
        x_power *= x_scalar;
    }
    result
}

/// Feldman commitments `C_k = a_k · G` for each coefficient.
pub fn commit_polynomial(coefficients: &[Scalar]) -> Vec<ProjectivePoint> {
    coefficients
        .iter()
        .map(|a| ProjectivePoint::GENERATOR * a)
        .collect()
}

/// Evaluate a commitment vector at an integer point:
/// `Σ_k x^k · C_k`, the public image of `f(x)`.
pub fn eval_commitments(commitments: &[ProjectivePoint], x: u64) -> ProjectivePoint {
    let x_scalar = Scalar::from(x);
    let mut result = ProjectivePoint::IDENTITY;
    let mut x_power = Scalar::ONE;
    for commitment in commitments {
        result += *commitment * x_power;
        x_power *= x_scalar;
    }
    result
}

/// Lagrange coefficient at `x = 0` for index `i` over the index set:
/// `λ_i = Π_{j ≠ i} j · (j − i)^{-1} mod n`.
///
/// The empty product (a single participant) is one.
pub fn lagrange_at_zero(i: u64, indices: &[u64]) -> Result<Scalar> {
    if !indices.contains(&i) {
        return Err(Error::ParticipantMismatch(format!(
            "index {i} not in interpolation set {indices:?}"
        )));
    }
    let i_scalar = Scalar::from(i);
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;
    for &j in indices {
        if j == i {
            continue;
        }
        let j_scalar = Scalar::from(j);
        numerator *= j_scalar;
        denominator *= j_scalar - i_scalar;
    }
    let inverse = Option::<Scalar>::from(denominator.invert()).ok_or_else(|| {
        Error::InvalidEncoding("duplicate index in interpolation set".to_string())
    })?;
    Ok(numerator * inverse)
}

/// Serialise a point to its 33-byte compressed form.
///
/// The identity is a legitimate intermediate in commitment sums but never
/// appears on the wire; serialising it is an internal error.
pub fn point_to_bytes(point: &ProjectivePoint) -> Result<[u8; COMPRESSED_POINT_LEN]> {
    if *point == ProjectivePoint::IDENTITY {
        return Err(Error::InvalidEncoding(
            "attempted to serialise the identity point".to_string(),
        ));
    }
    let encoded = point.to_affine().to_encoded_point(true);
    encoded
        .as_bytes()
        .try_into()
        .map_err(|_| Error::InvalidEncoding("unexpected compressed point length".to_string()))
}

/// Compressed point as 66 lowercase hex characters.
pub fn point_to_hex(point: &ProjectivePoint) -> Result<String> {
    Ok(hex::encode(point_to_bytes(point)?))
}

/// Parse a 33-byte compressed point.
pub fn point_from_bytes(bytes: &[u8]) -> Result<ProjectivePoint> {
    if bytes.len() != COMPRESSED_POINT_LEN {
        return Err(Error::InvalidEncoding(format!(
            "compressed point must be {COMPRESSED_POINT_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    let encoded = EncodedPoint::from_bytes(bytes)
        .map_err(|e| Error::InvalidEncoding(format!("bad point encoding: {e}")))?;
    let affine = Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
        .ok_or_else(|| Error::InvalidEncoding("point not on curve".to_string()))?;
    Ok(ProjectivePoint::from(affine))
}

/// Parse a compressed point from hex.
pub fn point_from_hex(s: &str) -> Result<ProjectivePoint> {
    let bytes =
        hex::decode(s).map_err(|e| Error::InvalidEncoding(format!("bad point hex: {e}")))?;
    point_from_bytes(&bytes)
}

/// Scalar as 64 zero-padded lowercase hex characters.
pub fn scalar_to_hex(scalar: &Scalar) -> String {
    hex::encode(scalar.to_bytes())
}

/// Parse a big-endian scalar from hex. Missing leading zeros are accepted;
/// the value is reduced mod `n`.
pub fn scalar_from_hex(s: &str) -> Result<Scalar> {
    if s.len() > 2 * SCALAR_LEN {
        return Err(Error::InvalidEncoding(format!(
            "scalar hex longer than {} characters",
            2 * SCALAR_LEN
        )));
    }
    let padded = format!("{s:0>64}");
    let bytes = hex::decode(padded)
        .map_err(|e| Error::InvalidEncoding(format!("bad scalar hex: {e}")))?;
    let array: [u8; SCALAR_LEN] = bytes
        .try_into()
        .map_err(|_| Error::InvalidEncoding("bad scalar length".to_string()))?;
    Ok(scalar_reduce(&array))
}

/// Interpret 32 big-endian bytes as a scalar mod `n`.
pub fn scalar_reduce(bytes: &[u8; SCALAR_LEN]) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(&(*bytes).into())
}

/// SHA-256 of arbitrary bytes.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Schnorr challenge `e = SHA-256(R_compressed ‖ Y_compressed ‖ message) mod n`.
///
/// The hash input is exactly 33 + 33 + |message| bytes.
pub fn challenge(
    aggregate_nonce: &ProjectivePoint,
    group_key: &ProjectivePoint,
    message: &[u8],
) -> Result<Scalar> {
    let mut hasher = Sha256::new();
    hasher.update(point_to_bytes(aggregate_nonce)?);
    hasher.update(point_to_bytes(group_key)?);
    hasher.update(message);
    let digest: [u8; 32] = hasher.finalize().into();
    Ok(scalar_reduce(&digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn compressed_codec_round_trip() {
        let mut rng = OsRng;
        for _ in 0..16 {
            let scalar = random_nonzero_scalar(&mut rng);
            let point = ProjectivePoint::GENERATOR * scalar;
            let hex = point_to_hex(&point).unwrap();
            assert_eq!(hex.len(), 66);
            assert!(hex.starts_with("02") || hex.starts_with("03"));
            assert_eq!(point_from_hex(&hex).unwrap(), point);
        }
    }

    #[test]
    fn negation_flips_parity() {
        let mut rng = OsRng;
        let scalar = random_nonzero_scalar(&mut rng);
        let point = ProjectivePoint::GENERATOR * scalar;
        let hex = point_to_hex(&point).unwrap();
        let neg_hex = point_to_hex(&(-point)).unwrap();
        assert_ne!(hex, neg_hex);
        // Same x coordinate, opposite parity prefix.
        assert_eq!(hex[2..], neg_hex[2..]);
    }

    #[test]
    fn identity_refuses_serialisation() {
        assert!(point_to_bytes(&ProjectivePoint::IDENTITY).is_err());
    }

    #[test]
    fn scalar_hex_pads_and_parses_unpadded() {
        let one = Scalar::ONE;
        let hex = scalar_to_hex(&one);
        assert_eq!(hex.len(), 64);
        assert_eq!(scalar_from_hex("1").unwrap(), one);
        assert_eq!(scalar_from_hex(&hex).unwrap(), one);
    }

    #[test]
    fn polynomial_reconstructs_at_zero() {
        let mut rng = OsRng;
        let coefficients = random_polynomial(3, &mut rng);
        let secret = coefficients[0];

        // Any 3 of the 5 shares recover f(0) by Lagrange interpolation.
        let indices = [2u64, 4, 5];
        let mut recovered = Scalar::ZERO;
        for &i in &indices {
            let share = eval_polynomial(&coefficients, i);
            let lambda = lagrange_at_zero(i, &indices).unwrap();
            recovered += lambda * share;
        }
        assert_eq!(recovered, secret);
    }

    #[test]
    fn commitment_eval_matches_share_image() {
        let mut rng = OsRng;
        let coefficients = random_polynomial(2, &mut rng);
        let commitments = commit_polynomial(&coefficients);
        for x in 1..=3u64 {
            let share = eval_polynomial(&coefficients, x);
            assert_eq!(
                ProjectivePoint::GENERATOR * share,
                eval_commitments(&commitments, x)
            );
        }
    }

    #[test]
    fn lagrange_single_participant_is_one() {
        assert_eq!(lagrange_at_zero(1, &[1]).unwrap(), Scalar::ONE);
    }

    #[test]
    fn lagrange_rejects_foreign_index() {
        assert!(lagrange_at_zero(4, &[1, 2]).is_err());
    }

    #[test]
    fn challenge_is_deterministic_and_order_sensitive() {
        let mut rng = OsRng;
        let r = ProjectivePoint::GENERATOR * random_nonzero_scalar(&mut rng);
        let y = ProjectivePoint::GENERATOR * random_nonzero_scalar(&mut rng);
        let e1 = challenge(&r, &y, b"msg").unwrap();
        let e2 = challenge(&r, &y, b"msg").unwrap();
        let e3 = challenge(&y, &r, b"msg").unwrap();
        assert_eq!(e1, e2);
        assert_ne!(e1, e3);
    }
}
