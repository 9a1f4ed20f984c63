//! IP reservation tokens (§4.7, invariant 5).
//!
//! An opaque token `HMAC_k(runner || ip || expiry)` grants a Runner a
//! time-bounded claim on an IP address in its overlay subnet. Verification
//! checks the signature, the embedded Runner claim, and the clock — §8
//! Open Questions notes replay within expiry is not cryptographically
//! prevented, and this implementation does not add that enforcement.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::IpReservationError;
use crate::overlay::OverlayManager;

type HmacSha256 = Hmac<Sha256>;

/// A verified or about-to-be-issued IP reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpReservation {
    pub runner_hostname: String,
    pub ip: String,
    pub expiry: DateTime<Utc>,
}

/// Signs and verifies IP reservation tokens with an HMAC-SHA256 key held
/// only in Host process memory.
pub struct IpReservationSigner {
    key: Vec<u8>,
}

impl IpReservationSigner {
    #[must_use]
    pub fn new(key: Vec<u8>) -> Self {
        Self { key }
    }

    fn message(runner: &str, ip: &str, expiry: DateTime<Utc>) -> Vec<u8> {
        format!("{runner}|{ip}|{}", expiry.timestamp()).into_bytes()
    }

    #[allow(clippy::expect_used)]
    fn mac(&self) -> HmacSha256 {
        <HmacSha256 as Mac>::new_from_slice(&self.key).expect("HMAC accepts a key of any length")
    }

    fn sign(&self, runner: &str, ip: &str, expiry: DateTime<Utc>) -> Vec<u8> {
        let mut mac = self.mac();
        mac.update(&Self::message(runner, ip, expiry));
        mac.finalize().into_bytes().to_vec()
    }

    /// Issue a signed token for `runner`/`ip`, valid until `expiry`.
    ///
    /// The returned string is `<runner>|<ip>|<expiry_unix>|<hex_signature>`;
    /// it is opaque to callers outside this module.
    #[must_use]
    pub fn issue(&self, runner: &str, ip: &str, expiry: DateTime<Utc>) -> String {
        let sig = self.sign(runner, ip, expiry);
        format!("{runner}|{ip}|{}|{}", expiry.timestamp(), hex::encode(sig))
    }

    /// Verify a token, checking signature, target Runner, and expiry
    /// (invariant 5: all three must hold).
    ///
    /// # Errors
    ///
    /// - [`IpReservationError::Malformed`] if the token doesn't parse.
    /// - [`IpReservationError::BadSignature`] if the signature doesn't match.
    /// - [`IpReservationError::RunnerMismatch`] if `expected_runner` differs.
    /// - [`IpReservationError::Expired`] if `expiry` is in the past.
    pub fn verify(
        &self,
        token: &str,
        expected_runner: &str,
    ) -> Result<IpReservation, IpReservationError> {
        let parts: Vec<&str> = token.split('|').collect();
        let [runner, ip, expiry_raw, sig_hex] = parts[..] else {
            return Err(IpReservationError::Malformed {
                reason: "expected 4 pipe-separated fields".to_owned(),
            });
        };

        let expiry_unix: i64 = expiry_raw
            .parse()
            .map_err(|_| IpReservationError::Malformed {
                reason: "expiry is not a unix timestamp".to_owned(),
            })?;
        let expiry = DateTime::from_timestamp(expiry_unix, 0).ok_or(IpReservationError::Malformed {
            reason: "expiry out of range".to_owned(),
        })?;

        let given_sig = hex::decode(sig_hex).map_err(|_| IpReservationError::Malformed {
            reason: "signature is not valid hex".to_owned(),
        })?;
        let mut mac = self.mac();
        mac.update(&Self::message(runner, ip, expiry));
        mac.verify_slice(&given_sig)
            .map_err(|_| IpReservationError::BadSignature)?;

        if runner != expected_runner {
            return Err(IpReservationError::RunnerMismatch);
        }

        if expiry < Utc::now() {
            return Err(IpReservationError::Expired);
        }

        Ok(IpReservation {
            runner_hostname: runner.to_owned(),
            ip: ip.to_owned(),
            expiry,
        })
    }
}

/// Reserve the next free IP in a Runner's overlay subnet and issue a
/// signed token for it, valid for `ttl`.
///
/// This picks an IP deterministically from the subnet's host range; it does
/// not track which IPs are "in use" beyond what the overlay allocation
/// table records, matching §4.7's note that tokens are single-logical-use
/// "by convention", not by enforcement.
///
/// # Errors
///
/// Returns [`IpReservationError::Overlay`] if the Runner has no overlay
/// allocation.
pub async fn reserve_ip(
    overlay: &OverlayManager,
    signer: &IpReservationSigner,
    hostname: &str,
    host_offset: u32,
    ttl: chrono::Duration,
) -> Result<(IpReservation, String), IpReservationError> {
    let allocation = overlay.get(hostname).await?;
    let ip = offset_ip_in_cidr(&allocation.subnet_cidr, host_offset).ok_or(
        IpReservationError::AddressesExhausted {
            hostname: hostname.to_owned(),
        },
    )?;
    let expiry = Utc::now() + ttl;
    let token = signer.issue(hostname, &ip, expiry);
    Ok((
        IpReservation {
            runner_hostname: hostname.to_owned(),
            ip,
            expiry,
        },
        token,
    ))
}

fn offset_ip_in_cidr(cidr: &str, offset: u32) -> Option<String> {
    let (base, prefix_len) = cidr.split_once('/')?;
    let base: std::net::Ipv4Addr = base.parse().ok()?;
    let prefix_len: u32 = prefix_len.parse().ok()?;
    let host_bits = 32 - prefix_len;
    if offset >= (1u32 << host_bits) {
        return None;
    }
    let addr = u32::from(base) + offset;
    Some(std::net::Ipv4Addr::from(addr).to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::overlay::{OverlayManager, OverlayPlan};
    use kr_storage::MemoryBackend;
    use std::sync::Arc;

    fn signer() -> IpReservationSigner {
        IpReservationSigner::new(b"test-signing-key".to_vec())
    }

    #[test]
    fn issue_then_verify_roundtrips() {
        let s = signer();
        let expiry = Utc::now() + chrono::Duration::minutes(5);
        let token = s.issue("runner-a", "10.200.1.5", expiry);
        let reservation = s.verify(&token, "runner-a").unwrap();
        assert_eq!(reservation.ip, "10.200.1.5");
        assert_eq!(reservation.runner_hostname, "runner-a");
    }

    #[test]
    fn verify_rejects_wrong_runner() {
        let s = signer();
        let expiry = Utc::now() + chrono::Duration::minutes(5);
        let token = s.issue("runner-a", "10.200.1.5", expiry);
        let err = s.verify(&token, "runner-b").unwrap_err();
        assert!(matches!(err, IpReservationError::RunnerMismatch));
    }

    #[test]
    fn verify_rejects_expired_token() {
        let s = signer();
        let expiry = Utc::now() - chrono::Duration::minutes(1);
        let token = s.issue("runner-a", "10.200.1.5", expiry);
        let err = s.verify(&token, "runner-a").unwrap_err();
        assert!(matches!(err, IpReservationError::Expired));
    }

    #[test]
    fn verify_rejects_tampered_signature() {
        let s = signer();
        let expiry = Utc::now() + chrono::Duration::minutes(5);
        let mut token = s.issue("runner-a", "10.200.1.5", expiry);
        token.push('0'); // corrupt the trailing hex signature
        let err = s.verify(&token, "runner-a").unwrap_err();
        assert!(matches!(
            err,
            IpReservationError::BadSignature | IpReservationError::Malformed { .. }
        ));
    }

    #[test]
    fn verify_rejects_different_key() {
        let s1 = signer();
        let s2 = IpReservationSigner::new(b"a-different-key".to_vec());
        let expiry = Utc::now() + chrono::Duration::minutes(5);
        let token = s1.issue("runner-a", "10.200.1.5", expiry);
        let err = s2.verify(&token, "runner-a").unwrap_err();
        assert!(matches!(err, IpReservationError::BadSignature));
    }

    fn make_store() -> crate::store::Store {
        crate::store::Store::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn reserve_then_release_leaves_available_ips_unchanged() {
        let overlay = OverlayManager::load(
            make_store(),
            OverlayPlan {
                base_network: "10.200.0.0".parse().unwrap(),
                base_prefix_len: 16,
                runner_prefix_len: 24,
                vxlan_base_id: 1000,
            },
        )
        .await
        .unwrap();
        overlay.allocate("runner-a").await.unwrap();
        let signer = signer();

        let (reservation, _token) = reserve_ip(
            &overlay,
            &signer,
            "runner-a",
            5,
            chrono::Duration::minutes(5),
        )
        .await
        .unwrap();
        assert!(reservation.ip.starts_with("10.200."));

        // The reservation is ephemeral and not recorded in the overlay
        // table itself, so "release" here is simply letting the token
        // expire — the available-IP space (defined purely by the subnet
        // CIDR) is unchanged by reserve or by expiry.
        let allocation_after = overlay.get("runner-a").await.unwrap();
        assert_eq!(allocation_after.subnet_cidr, "10.200.0.0/24");
    }
}
