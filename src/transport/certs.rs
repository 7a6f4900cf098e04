//! Certificate credentials
//!
//! Nodes identify themselves with X.509 certificates carrying Ed25519 keys. The
//! Ed25519 key signs handshake messages; the same key, mapped to its Montgomery
//! form, is the node's X25519 key for session agreement.
use ed25519_dalek::pkcs8::DecodePrivateKey;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use x25519_dalek::{PublicKey, StaticSecret};
use x509_parser::prelude::*;

use crate::certificate_error;
use crate::error::Result;

const MAX_CHAIN_DEPTH: usize = 8;

/// Trust roots plus any intermediates needed to reach them
#[derive(Clone, Debug, Default)]
pub struct TrustStore {
    roots: Vec<Vec<u8>>,
    intermediates: Vec<Vec<u8>>,
}

/// What a verified certificate tells us about its holder
#[derive(Clone, Debug)]
pub struct PeerIdentity {
    pub verifying_key: VerifyingKey,
    pub units: Vec<String>,
}

impl PeerIdentity {
    /// The holder's X25519 public key
    pub fn dh_public(&self) -> PublicKey {
        PublicKey::from(self.verifying_key.to_montgomery().to_bytes())
    }
}

impl TrustStore {
    pub fn new(roots: Vec<Vec<u8>>) -> Self {
        Self {
            roots,
            intermediates: Vec::new(),
        }
    }

    pub fn with_intermediates(mut self, intermediates: Vec<Vec<u8>>) -> Self {
        self.intermediates = intermediates;
        self
    }

    /// Verify `leaf_der` up to one of our roots.
    pub fn verify(&self, leaf_der: &[u8]) -> Result<PeerIdentity> {
        let (_, leaf) = parse_x509_certificate(leaf_der)
            .map_err(|e| certificate_error!("unparseable certificate: {}", e))?;
        if !leaf.validity().is_valid() {
            return Err(certificate_error!("certificate outside its validity period"));
        }
        let identity = identity_of(&leaf)?;

        let mut current = leaf;
        for _ in 0..MAX_CHAIN_DEPTH {
            if let Some(root) = find_issuer(&self.roots, &current) {
                current
                    .verify_signature(Some(root.public_key()))
                    .map_err(|e| certificate_error!("bad signature from root: {}", e))?;
                return Ok(identity);
            }
            let issuer = find_issuer(&self.intermediates, &current)
                .ok_or_else(|| certificate_error!("no issuer for {}", current.issuer()))?;
            current
                .verify_signature(Some(issuer.public_key()))
                .map_err(|e| certificate_error!("bad signature from intermediate: {}", e))?;
            current = issuer;
        }
        Err(certificate_error!("certificate chain too long"))
    }
}

fn find_issuer<'a>(
    candidates: &'a [Vec<u8>],
    cert: &X509Certificate<'_>,
) -> Option<X509Certificate<'a>> {
    candidates.iter().find_map(|der| {
        let (_, candidate) = parse_x509_certificate(der).ok()?;
        let issues = candidate.subject().as_raw() == cert.issuer().as_raw()
            && candidate.is_ca()
            && candidate.validity().is_valid();
        issues.then_some(candidate)
    })
}

fn identity_of(cert: &X509Certificate<'_>) -> Result<PeerIdentity> {
    let spki = cert.public_key();
    let key: &[u8] = spki.subject_public_key.data.as_ref();
    let key: [u8; 32] = key
        .try_into()
        .map_err(|_| certificate_error!("certificate key is not Ed25519"))?;
    let verifying_key = VerifyingKey::from_bytes(&key)
        .map_err(|e| certificate_error!("certificate key: {}", e))?;
    let units = cert
        .subject()
        .iter_organizational_unit()
        .filter_map(|attr| attr.as_str().ok().map(str::to_string))
        .collect();
    Ok(PeerIdentity {
        verifying_key,
        units,
    })
}

/// Our certificate, its private key, and the roots we accept peers from
pub struct Credentials {
    cert_der: Vec<u8>,
    signing_key: SigningKey,
    dh_secret: StaticSecret,
    units: Vec<String>,
    trust: TrustStore,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("units", &self.units)
            .field("cert_len", &self.cert_der.len())
            .finish()
    }
}

impl Credentials {
    /// Our certificate must verify against `trust` and hold the public half of
    /// `signing_key`.
    pub fn new(cert_der: Vec<u8>, signing_key: SigningKey, trust: TrustStore) -> Result<Self> {
        let identity = trust.verify(&cert_der)?;
        if identity.verifying_key != signing_key.verifying_key() {
            return Err(certificate_error!(
                "certificate does not match the private key"
            ));
        }
        let dh_secret = StaticSecret::from(signing_key.to_scalar_bytes());
        if PublicKey::from(&dh_secret) != identity.dh_public() {
            return Err(certificate_error!("X25519 key does not match the certificate"));
        }
        Ok(Self {
            cert_der,
            signing_key,
            dh_secret,
            units: identity.units,
            trust,
        })
    }

    /// Like [`Credentials::new`] with the private key in PKCS#8 DER form.
    pub fn from_pkcs8(cert_der: Vec<u8>, key_der: &[u8], trust: TrustStore) -> Result<Self> {
        let signing_key = SigningKey::from_pkcs8_der(key_der)
            .map_err(|e| certificate_error!("private key: {}", e))?;
        Self::new(cert_der, signing_key, trust)
    }

    pub fn certificate(&self) -> &[u8] {
        &self.cert_der
    }

    pub fn units(&self) -> &[String] {
        &self.units
    }

    pub fn sign(&self, header: &[u8], body: &[u8]) -> Signature {
        let mut signed = Vec::with_capacity(header.len() + body.len());
        signed.extend_from_slice(header);
        signed.extend_from_slice(body);
        self.signing_key.sign(&signed)
    }

    /// Verify a peer certificate and check it belongs to our organizational units.
    pub fn verify_peer(&self, cert_der: &[u8]) -> Result<PeerIdentity> {
        let identity = self.trust.verify(cert_der)?;
        if identity.units != self.units {
            return Err(certificate_error!(
                "OU mismatch: expected {:?}, got {:?}",
                self.units,
                identity.units
            ));
        }
        Ok(identity)
    }

    /// X25519 agreement with a peer's public key
    pub fn agree(&self, peer: &PublicKey) -> [u8; 32] {
        *self.dh_secret.diffie_hellman(peer).as_bytes()
    }
}

/// Check `signature` over `header || body` with the peer's key.
pub fn verify_signature(
    identity: &PeerIdentity,
    header: &[u8],
    body: &[u8],
    signature: &Signature,
) -> Result<()> {
    let mut signed = Vec::with_capacity(header.len() + body.len());
    signed.extend_from_slice(header);
    signed.extend_from_slice(body);
    identity.verifying_key.verify_strict(&signed, signature)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::CertAuthority;

    #[test]
    fn test_credentials_verify_against_root() {
        let ca = CertAuthority::new(&["flock"]);
        let creds = ca.credentials("alpha");
        assert_eq!(creds.units(), &["flock".to_string()]);
        let identity = creds.verify_peer(ca.credentials("beta").certificate()).unwrap();
        assert_eq!(identity.units, vec!["flock".to_string()]);
    }

    #[test]
    fn test_foreign_root_rejected() {
        let ours = CertAuthority::new(&["flock"]);
        let theirs = CertAuthority::new(&["flock"]);
        let creds = ours.credentials("alpha");
        assert!(creds
            .verify_peer(theirs.credentials("mallory").certificate())
            .is_err());
    }

    #[test]
    fn test_ou_mismatch_rejected() {
        let ca = CertAuthority::new(&["flock"]);
        let creds = ca.credentials("alpha");
        let other = ca.credentials_with_units("beta", &["herd"]);
        assert!(creds.verify_peer(other.certificate()).is_err());
    }

    #[test]
    fn test_mismatched_key_rejected() {
        let ca = CertAuthority::new(&["flock"]);
        let (cert_der, _) = ca.issue("alpha", &["flock"]);
        let (_, other_key) = ca.issue("beta", &["flock"]);
        assert!(Credentials::from_pkcs8(cert_der, &other_key, ca.trust()).is_err());
    }

    #[test]
    fn test_signature_and_agreement() {
        let ca = CertAuthority::new(&["flock"]);
        let alpha = ca.credentials("alpha");
        let beta = ca.credentials("beta");

        let sig = alpha.sign(b"hdr", b"body");
        let alpha_id = beta.verify_peer(alpha.certificate()).unwrap();
        assert!(verify_signature(&alpha_id, b"hdr", b"body", &sig).is_ok());
        assert!(verify_signature(&alpha_id, b"hdr", b"other", &sig).is_err());

        let beta_id = alpha.verify_peer(beta.certificate()).unwrap();
        assert_eq!(alpha.agree(&beta_id.dh_public()), beta.agree(&alpha_id.dh_public()));
    }

    #[test]
    fn test_intermediate_chain() {
        let ca = CertAuthority::new(&["flock"]);
        let sub = ca.intermediate("sub");
        let leaf = sub.credentials("gamma");
        let alpha = ca.credentials("alpha");
        // alpha only knows the root, so the intermediate is unknown to it
        assert!(alpha.verify_peer(leaf.certificate()).is_err());
        assert!(sub.trust().verify(leaf.certificate()).is_ok());
    }
}
