use crate::crypto::{Key, Nonce};

/// Per-peer key state. Sessions are created on first contact and live as long as
/// the transport.
#[derive(Debug, Default)]
pub struct Session {
    /// Established key
    pub sess_key: Option<Key>,
    /// Key retired by the last epoch change, still accepted on receive
    pub prev_key: Option<Key>,
    /// Key derived while answering an offer, waiting for the peer's first data
    pub resp_key: Option<Key>,
    /// Sends we may still make under `resp_key`
    pub resp_count: u32,
    /// Single-use key sealing the payload of our outstanding offer
    pub offer_key: Option<Key>,
    pub offer_nonce: Option<Nonce>,
}

impl Session {
    /// The key to send under, if any: the established key, else a pending responder
    /// key that still has sends left.
    pub fn send_key(&mut self) -> Option<Key> {
        if let Some(key) = self.sess_key {
            return Some(key);
        }
        match self.resp_key {
            Some(key) if self.resp_count > 0 => {
                self.resp_count -= 1;
                Some(key)
            }
            _ => None,
        }
    }

    /// The established key becomes the previous key.
    pub fn retire(&mut self) {
        if let Some(key) = self.sess_key.take() {
            self.prev_key = Some(key);
        }
    }

    pub fn clear_offer(&mut self) {
        self.offer_key = None;
        self.offer_nonce = None;
    }

    /// Stop accepting the key retired by the last rotation.
    pub fn forget_previous(&mut self) {
        self.prev_key = None;
    }
}
