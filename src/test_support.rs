//! Fixtures shared by the unit and integration tests
use std::time::Duration;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    PKCS_ED25519,
};

use crate::node::Timing;
use crate::transport::{Credentials, TrustStore};

/// A throwaway Ed25519 certificate authority
pub struct CertAuthority {
    cert: Certificate,
    key: KeyPair,
    root_der: Vec<u8>,
    chain: Vec<Vec<u8>>,
    units: Vec<String>,
}

fn params(name: &str, units: &[&str], ca: bool) -> CertificateParams {
    let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, name);
    for unit in units {
        dn.push(DnType::OrganizationalUnitName, *unit);
    }
    params.distinguished_name = dn;
    if ca {
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    }
    params
}

impl CertAuthority {
    pub fn new(units: &[&str]) -> Self {
        let key = KeyPair::generate_for(&PKCS_ED25519).unwrap();
        let cert = params("flock-root", units, true).self_signed(&key).unwrap();
        let root_der = cert.der().to_vec();
        Self {
            cert,
            key,
            root_der,
            chain: Vec::new(),
            units: units.iter().map(|u| u.to_string()).collect(),
        }
    }

    /// A subordinate authority whose certificates chain through this one
    pub fn intermediate(&self, name: &str) -> Self {
        let units: Vec<&str> = self.units.iter().map(String::as_str).collect();
        let key = KeyPair::generate_for(&PKCS_ED25519).unwrap();
        let cert = params(name, &units, true)
            .signed_by(&key, &self.cert, &self.key)
            .unwrap();
        let mut chain = self.chain.clone();
        chain.push(cert.der().to_vec());
        Self {
            cert,
            key,
            root_der: self.root_der.clone(),
            chain,
            units: self.units.clone(),
        }
    }

    pub fn root_der(&self) -> &[u8] {
        &self.root_der
    }

    pub fn trust(&self) -> TrustStore {
        TrustStore::new(vec![self.root_der.clone()]).with_intermediates(self.chain.clone())
    }

    /// Issue a leaf, returning its DER certificate and PKCS#8 private key.
    pub fn issue(&self, name: &str, units: &[&str]) -> (Vec<u8>, Vec<u8>) {
        let key = KeyPair::generate_for(&PKCS_ED25519).unwrap();
        let cert = params(name, units, false)
            .signed_by(&key, &self.cert, &self.key)
            .unwrap();
        (cert.der().to_vec(), key.serialize_der())
    }

    pub fn credentials(&self, name: &str) -> Credentials {
        let units: Vec<&str> = self.units.iter().map(String::as_str).collect();
        self.credentials_with_units(name, &units)
    }

    pub fn credentials_with_units(&self, name: &str, units: &[&str]) -> Credentials {
        let (cert, key) = self.issue(name, units);
        Credentials::from_pkcs8(cert, &key, self.trust()).unwrap()
    }
}

/// Fixed periods and a scripted probe list
pub struct TestTiming {
    pub heartbeat: Duration,
    pub probes: Vec<String>,
}

impl TestTiming {
    pub fn new(heartbeat: Duration, probes: Vec<String>) -> Self {
        Self { heartbeat, probes }
    }
}

impl Timing for TestTiming {
    fn heartbeat(&self) -> Duration {
        self.heartbeat
    }
    fn key_period(&self) -> Duration {
        self.heartbeat * 100
    }
    fn node_prune(&self) -> Duration {
        self.heartbeat * 3
    }
    fn history_prune(&self) -> Duration {
        self.heartbeat * 2
    }
    fn checkpoint(&self) -> Duration {
        self.heartbeat * 10
    }
    fn probebeat(&self) -> Duration {
        self.heartbeat * 3
    }
    fn probe_n(&self) -> usize {
        self.probes.len().max(1)
    }
    fn probe(&self) -> Option<String> {
        use rand::seq::SliceRandom;
        self.probes.choose(&mut rand::thread_rng()).cloned()
    }
}
