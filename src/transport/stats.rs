//! Packet disposition counters
//!
//! Every inbound packet and every handshake step ends in exactly one disposition.
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Offer accepted and answered
    Offer,
    /// Offer dropped because our own concurrent offer wins
    OfferGlare,
    /// Response accepted, session established
    Resp,
    /// Response did not decrypt under the derived key
    RespFail,
    /// Data opened with the active session key
    Data,
    /// Data opened with the pending responder key, which is now active
    DataResp,
    /// Data opened with the key retired by the last epoch change
    DataPrev,
    /// Data arrived for a session with no keys
    DataNoKey,
    /// Data failed to open under every key
    DataFail,
    /// Undecodable envelope or field
    Malformed,
    BadSignature,
    BadCertificate,
    /// Handshake needed but we hold no credentials
    NoCertificate,
}

impl Disposition {
    pub const ALL: [Disposition; 13] = [
        Disposition::Offer,
        Disposition::OfferGlare,
        Disposition::Resp,
        Disposition::RespFail,
        Disposition::Data,
        Disposition::DataResp,
        Disposition::DataPrev,
        Disposition::DataNoKey,
        Disposition::DataFail,
        Disposition::Malformed,
        Disposition::BadSignature,
        Disposition::BadCertificate,
        Disposition::NoCertificate,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Disposition::Offer => "offer",
            Disposition::OfferGlare => "offer_glare",
            Disposition::Resp => "resp",
            Disposition::RespFail => "resp_fail",
            Disposition::Data => "data",
            Disposition::DataResp => "data_resp",
            Disposition::DataPrev => "data_prev",
            Disposition::DataNoKey => "data_no_key",
            Disposition::DataFail => "data_fail",
            Disposition::Malformed => "malformed",
            Disposition::BadSignature => "bad_signature",
            Disposition::BadCertificate => "bad_certificate",
            Disposition::NoCertificate => "no_certificate",
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Default)]
pub struct DispositionCounters {
    counts: [AtomicU64; 13],
}

/// Point-in-time copy of the counters
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct FrozenDispositionCounters {
    pub counts: Vec<(&'static str, u64)>,
}

impl DispositionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, disposition: Disposition) {
        self.counts[disposition as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, disposition: Disposition) -> u64 {
        self.counts[disposition as usize].load(Ordering::Relaxed)
    }

    pub fn freeze(&self) -> FrozenDispositionCounters {
        FrozenDispositionCounters {
            counts: Disposition::ALL
                .iter()
                .map(|d| (d.name(), self.get(*d)))
                .collect(),
        }
    }
}
