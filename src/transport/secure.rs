//! Authenticated session transport
//!
//! A node with no session key for a peer sends its packet inside a signed Offer,
//! sealed under a single-use key. The peer answers with a signed Response carrying
//! its own nonce and the offer payload resealed under the agreed session key,
//! proving it derived the same key. The initiator then unseals its original packet
//! and sends it as the first Data message. Data messages are sealed with the
//! pseudo-header as associated data and are not signed.
//!
//! When both sides offer at once (glare) the offer with the larger nonce wins and
//! its receiver answers using its own offer nonce as the responder nonce.
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, error, warn};
use x25519_dalek::PublicKey;

use super::certs::{self, Credentials};
use super::session::Session;
use super::stats::{Disposition, DispositionCounters};
use super::traits::{resolve, Link, Transport};
use super::wire::{self, Msg, MsgType};
use crate::concurrency_error;
use crate::context::AppContext;
use crate::crypto::{self, Key, Nonce, NONCE_SIZE};
use crate::error::Result;
use crate::node::{Info, NodeId};

/// The flock-wide keys last installed by the election engine
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct EpochKeys {
    pub epoch: Option<Nonce>,
    pub sec0: Key,
    pub sec1: Option<Key>,
}

/// Outcome of processing one inbound packet
#[derive(Debug, Default)]
struct Inbound {
    info: Option<Info>,
    reply: Option<(SocketAddr, Vec<u8>)>,
}

pub struct SecureTransport<L: Link> {
    link: L,
    // the address peers send to, "ip:port"
    src_addr: String,
    host: String,
    port: u16,
    moniker: String,
    creds: Option<Credentials>,
    sessions: Mutex<HashMap<String, Session>>,
    keys: Mutex<EpochKeys>,
    counters: Arc<DispositionCounters>,
}

impl<L: Link> fmt::Debug for SecureTransport<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureTransport")
            .field("src_addr", &self.src_addr)
            .field("moniker", &self.moniker)
            .field("has_credentials", &self.creds.is_some())
            .finish()
    }
}

impl<L: Link> SecureTransport<L> {
    /// `moniker` names this node; an empty moniker defaults to the link's IP.
    pub fn new(
        link: L,
        moniker: impl Into<String>,
        creds: Option<Credentials>,
        ctx: &AppContext,
    ) -> Self {
        let local = link.local_addr();
        let host = local.ip().to_string();
        let moniker = moniker.into();
        Self {
            src_addr: local.to_string(),
            moniker: if moniker.is_empty() {
                host.clone()
            } else {
                moniker
            },
            host,
            port: local.port(),
            link,
            creds,
            sessions: Mutex::new(HashMap::new()),
            keys: Mutex::new(EpochKeys::default()),
            counters: ctx.counters(),
        }
    }

    pub fn src_addr(&self) -> &str {
        &self.src_addr
    }

    pub fn counters(&self) -> &DispositionCounters {
        &self.counters
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// The established session key for `peer` ("ip:port"), if any
    pub fn established_key(&self, peer: &str) -> Option<Key> {
        self.sessions()
            .ok()
            .and_then(|s| s.get(peer).and_then(|sess| sess.sess_key))
    }

    fn sessions(&self) -> Result<MutexGuard<'_, HashMap<String, Session>>> {
        self.sessions
            .lock()
            .map_err(|e| concurrency_error!("session lock poisoned: {}", e))
    }

    async fn transmit(&self, dest: SocketAddr, pkt: &[u8]) {
        if let Err(e) = self.link.send_to(dest, pkt).await {
            debug!("[{}] {}", self.src_addr, e);
        }
    }

    /// Build the packet that carries `info` to `dest`, opening a handshake if we
    /// have no key for it.
    fn outbound(&self, dest: &str, info: &Info) -> Result<Option<Vec<u8>>> {
        let plain = wire::encode(info)?;
        let mut sessions = self.sessions()?;
        let sess = sessions.entry(dest.to_string()).or_default();

        let key = match sess.send_key() {
            Some(key) => Some(key),
            None if dest == self.src_addr => {
                let key = Key::random();
                sess.sess_key = Some(key);
                debug!("[{}] self session", self.src_addr);
                Some(key)
            }
            None => None,
        };
        if let Some(key) = key {
            return self.data_packet(dest, &plain, &key).map(Some);
        }

        let Some(creds) = &self.creds else {
            self.counters.incr(Disposition::NoCertificate);
            debug!("[{}] no certificate to offer {}", self.src_addr, dest);
            return Ok(None);
        };
        let offer_key = Key::random();
        let mut offer = Msg::new(MsgType::Offer, self.src_addr.as_str());
        offer.cert_der = creds.certificate().to_vec();
        offer.payload = crypto::seal(&plain, &offer_key)?;
        sess.offer_nonce = Some(Nonce::from_slice(&offer.payload[..NONCE_SIZE])?);
        sess.offer_key = Some(offer_key);
        debug!("[{}] offer sent to {}", self.src_addr, dest);
        self.signed_packet(creds, &offer, dest).map(Some)
    }

    fn data_packet(&self, dest: &str, plain: &[u8], key: &Key) -> Result<Vec<u8>> {
        let header = wire::pseudo_header(MsgType::Data as u8, &self.src_addr, dest)?;
        let mut msg = Msg::new(MsgType::Data, self.src_addr.as_str());
        msg.payload = crypto::seal_with_aad(plain, &header, key)?;
        wire::encode(&msg)
    }

    fn signed_packet(&self, creds: &Credentials, msg: &Msg, dest: &str) -> Result<Vec<u8>> {
        let header = wire::pseudo_header(msg.msg_type, &self.src_addr, dest)?;
        let mut pkt = wire::encode(msg)?;
        let signature = creds.sign(&header, &pkt);
        pkt.extend_from_slice(&signature.to_bytes());
        Ok(pkt)
    }

    fn dropped(&self, disposition: Disposition, reason: &dyn fmt::Display) -> Inbound {
        self.counters.incr(disposition);
        debug!("[{}] dropped ({}): {}", self.src_addr, disposition, reason);
        Inbound::default()
    }

    fn inbound(&self, pkt: &[u8]) -> Inbound {
        let packet = match wire::split_packet(pkt) {
            Ok(packet) => packet,
            Err(e) => return self.dropped(Disposition::Malformed, &e),
        };
        let msg = &packet.msg;
        let msg_type = match MsgType::try_from(msg.msg_type) {
            Ok(t) => t,
            Err(e) => return self.dropped(Disposition::Malformed, &e),
        };
        let peer: SocketAddr = match msg.src_addr.parse() {
            Ok(addr) => addr,
            Err(e) => return self.dropped(Disposition::Malformed, &e),
        };
        let header = match wire::pseudo_header(msg.msg_type, &msg.src_addr, &self.src_addr) {
            Ok(header) => header,
            Err(e) => return self.dropped(Disposition::Malformed, &e),
        };

        let peer_key = match (&packet.signature, msg.cert_der.is_empty()) {
            (Some(signature), false) => {
                let Some(creds) = &self.creds else {
                    return self.dropped(Disposition::NoCertificate, &"no certificate chain");
                };
                let identity = match creds.verify_peer(&msg.cert_der) {
                    Ok(identity) => identity,
                    Err(e) => {
                        warn!("[{}] rejected certificate from {}: {}", self.src_addr, peer, e);
                        return self.dropped(Disposition::BadCertificate, &e);
                    }
                };
                if let Err(e) = certs::verify_signature(&identity, &header, packet.body, signature) {
                    return self.dropped(Disposition::BadSignature, &e);
                }
                Some(identity.dh_public())
            }
            (Some(_), true) => {
                return self.dropped(Disposition::BadSignature, &"signature without certificate")
            }
            (None, false) => {
                return self.dropped(Disposition::Malformed, &"certificate without signature")
            }
            (None, true) => None,
        };

        let mut sessions = match self.sessions() {
            Ok(sessions) => sessions,
            Err(e) => {
                error!("[{}] {}", self.src_addr, e);
                return Inbound::default();
            }
        };
        let sess = sessions.entry(msg.src_addr.clone()).or_default();
        debug!("[{}] recv {:?} ({}) from {}", self.src_addr, msg_type, pkt.len(), peer);

        match (msg_type, peer_key, &self.creds) {
            (MsgType::Data, _, _) => self.on_data(sess, msg, &header),
            (MsgType::Offer, Some(peer_key), Some(creds)) => {
                self.on_offer(sess, msg, peer, peer_key, creds)
            }
            (MsgType::Response, Some(peer_key), Some(creds)) => {
                self.on_response(sess, msg, peer, peer_key, creds)
            }
            (t, _, _) => self.dropped(Disposition::Malformed, &format!("unsigned {:?}", t)),
        }
    }

    fn on_offer(
        &self,
        sess: &mut Session,
        msg: &Msg,
        peer: SocketAddr,
        peer_key: PublicKey,
        creds: &Credentials,
    ) -> Inbound {
        if msg.payload.len() < NONCE_SIZE {
            return self.dropped(Disposition::Malformed, &"offer payload too short");
        }
        let nonce_a = match Nonce::from_slice(&msg.payload[..NONCE_SIZE]) {
            Ok(nonce) => nonce,
            Err(e) => return self.dropped(Disposition::Malformed, &e),
        };
        let nonce_b = match sess.offer_nonce {
            Some(ours) if nonce_a <= ours => {
                return self.dropped(Disposition::OfferGlare, &"offer glare, ours wins");
            }
            Some(ours) => {
                debug!("[{}] offer glare with {}, accepting", self.src_addr, peer);
                ours
            }
            None => Nonce::random(),
        };

        let key = crypto::session_key(&creds.agree(&peer_key), &nonce_a, &nonce_b);
        let mut resp = Msg::new(MsgType::Response, self.src_addr.as_str());
        resp.cert_der = creds.certificate().to_vec();
        resp.nonce = nonce_b.as_bytes().to_vec();
        let pkt = crypto::seal(&msg.payload, &key)
            .and_then(|payload| {
                resp.payload = payload;
                self.signed_packet(creds, &resp, &msg.src_addr)
            });
        let pkt = match pkt {
            Ok(pkt) => pkt,
            Err(e) => {
                error!("[{}] building response failed: {}", self.src_addr, e);
                return Inbound::default();
            }
        };

        sess.resp_key = Some(key);
        sess.resp_count = 1;
        sess.clear_offer();
        self.counters.incr(Disposition::Offer);
        debug!("[{}] response sent to {} key {}", self.src_addr, peer, key);
        Inbound {
            info: None,
            reply: Some((peer, pkt)),
        }
    }

    fn on_response(
        &self,
        sess: &mut Session,
        msg: &Msg,
        peer: SocketAddr,
        peer_key: PublicKey,
        creds: &Credentials,
    ) -> Inbound {
        let (Some(nonce_a), Some(offer_key)) = (sess.offer_nonce, sess.offer_key) else {
            return self.dropped(Disposition::RespFail, &"response without an offer");
        };
        let nonce_b = match Nonce::from_slice(&msg.nonce) {
            Ok(nonce) => nonce,
            Err(e) => return self.dropped(Disposition::Malformed, &e),
        };
        let key = crypto::session_key(&creds.agree(&peer_key), &nonce_a, &nonce_b);
        let offer_bits = match crypto::open(&msg.payload, &key) {
            Ok(bits) => bits,
            Err(e) => return self.dropped(Disposition::RespFail, &e),
        };
        // a response to an older offer of ours fails here
        let plain = match crypto::open(&offer_bits, &offer_key) {
            Ok(plain) => plain,
            Err(e) => return self.dropped(Disposition::RespFail, &e),
        };
        let pkt = match self.data_packet(&msg.src_addr, &plain, &key) {
            Ok(pkt) => pkt,
            Err(e) => {
                error!("[{}] first data packet failed: {}", self.src_addr, e);
                return Inbound::default();
            }
        };

        sess.sess_key = Some(key);
        sess.resp_key = None;
        sess.clear_offer();
        self.counters.incr(Disposition::Resp);
        debug!("[{}] session with {} key {}", self.src_addr, peer, key);
        Inbound {
            info: None,
            reply: Some((peer, pkt)),
        }
    }

    fn on_data(&self, sess: &mut Session, msg: &Msg, header: &[u8]) -> Inbound {
        let open = |key: &Key| -> Result<Info> {
            let plain = crypto::open_with_aad(&msg.payload, header, key)?;
            Ok(wire::decode::<Info>(&plain)?.0)
        };
        let mut failure = None;

        if let Some(key) = sess.resp_key {
            match open(&key) {
                Ok(info) => {
                    sess.sess_key = Some(key);
                    sess.resp_key = None;
                    return self.delivered(Disposition::DataResp, info);
                }
                Err(e) => failure = Some(e),
            }
        }
        if let Some(key) = sess.sess_key {
            match open(&key) {
                Ok(info) => return self.delivered(Disposition::Data, info),
                Err(e) => failure = Some(e),
            }
        }
        if let Some(key) = sess.prev_key {
            match open(&key) {
                Ok(info) => return self.delivered(Disposition::DataPrev, info),
                Err(e) => failure = Some(e),
            }
        }
        match failure {
            None => self.dropped(Disposition::DataNoKey, &"no keys"),
            Some(e) => self.dropped(Disposition::DataFail, &e),
        }
    }

    fn delivered(&self, disposition: Disposition, info: Info) -> Inbound {
        self.counters.incr(disposition);
        Inbound {
            info: Some(info),
            reply: None,
        }
    }
}

#[async_trait]
impl<L: Link> Transport for SecureTransport<L> {
    async fn recv(&self) -> Option<Info> {
        loop {
            let pkt = self.link.recv().await?;
            let inbound = self.inbound(&pkt);
            if let Some((peer, reply)) = inbound.reply {
                self.transmit(peer, &reply).await;
            }
            if inbound.info.is_some() {
                return inbound.info;
            }
        }
    }

    async fn send(&self, info: &Info) {
        let dest = match resolve(&info.dest.addr, self.port).await {
            Ok(dest) => dest,
            Err(e) => {
                debug!("[{}] can't resolve {}: {}", self.src_addr, info.dest.addr, e);
                return;
            }
        };
        match self.outbound(&dest.to_string(), info) {
            Ok(Some(pkt)) => self.transmit(dest, &pkt).await,
            Ok(None) => {}
            Err(e) => error!("[{}] send to {} failed: {}", self.src_addr, dest, e),
        }
    }

    fn set_me(&self, me: &mut NodeId) {
        if me.moniker.is_empty() {
            me.moniker = self.moniker.clone();
        }
        me.addr = self.host.clone();
    }

    /// A new epoch or a new secondary key retires every established session; the
    /// retired keys are still accepted on receive. Once the old secondary key is
    /// dropped, so are the retired session keys.
    fn set_keys(&self, epoch: &Nonce, sec0: &Key, sec1: Option<&Key>) {
        let mut keys = match self.keys.lock() {
            Ok(keys) => keys,
            Err(e) => {
                error!("[{}] key lock poisoned: {}", self.src_addr, e);
                return;
            }
        };
        let new_epoch = keys.epoch != Some(*epoch);
        let new_secondary = !keys.sec0.is_zero() && keys.sec0 != *sec0;
        let secondary_retired = keys.sec1.is_some() && sec1.is_none();
        keys.epoch = Some(*epoch);
        keys.sec0 = *sec0;
        keys.sec1 = sec1.copied();
        drop(keys);

        if !(new_epoch || new_secondary || secondary_retired) {
            return;
        }
        let mut sessions = match self.sessions() {
            Ok(sessions) => sessions,
            Err(e) => {
                error!("[{}] {}", self.src_addr, e);
                return;
            }
        };
        if new_epoch || new_secondary {
            sessions.values_mut().for_each(Session::retire);
            debug!(
                "[{}] new session keys (epoch {}, new secondary {})",
                self.src_addr, epoch, new_secondary
            );
        }
        if secondary_retired {
            sessions.values_mut().for_each(Session::forget_previous);
            debug!("[{}] old secondary retired", self.src_addr);
        }
    }

    fn quit(&self) {
        self.link.close();
    }
}
