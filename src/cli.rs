//! CLI for this application
//!
use std::path::PathBuf;

use crate::settings;

#[derive(Clone, Debug, clap::Parser)]
#[clap(name = settings::APP_NAME, version = settings::APP_VERSION)]
pub struct Cli {
    // Listen address
    #[clap(
        long,
        env("FLOCK_LISTEN_ADDRESS"),
        help = "Routable IP address to listen on; peers send here"
    )]
    pub listen_address: String,

    // UDP listen port
    #[clap(
        long,
        default_value = settings::DEFAULT_PORT,
        env("FLOCK_LISTEN_PORT"),
        help = "UDP port shared by every node of the flock"
    )]
    pub listen_port: u16,

    // Node moniker
    #[clap(long, env("FLOCK_NODE_NAME"), help = "Node name (defaults to the listen address)")]
    pub node_name: Option<String>,

    // Horde label
    #[clap(long, default_value = "", env("FLOCK_HORDE"), help = "Horde this node belongs to")]
    pub horde: String,

    // Beacon address
    #[clap(long, default_value = "", env("FLOCK_BEACON"), help = "Rendezvous beacon address")]
    pub beacon: String,

    // Secondary key
    #[clap(
        long,
        env("FLOCK_SECONDARY_KEY"),
        help = "Initial secondary key as hex (up to 64 digits)"
    )]
    pub secondary_key: String,

    // Probe configuration
    #[clap(
        long,
        env("FLOCK_NETWORKS"),
        help = "CIDR networks to probe (e.g., 10.0.0.0/24,10.0.1.0/28)"
    )]
    pub networks: Option<String>,

    #[clap(
        long,
        env("FLOCK_ADDRESS_LIST"),
        help = "File of addresses to probe; a line 'nil <p>' sets the miss probability"
    )]
    pub address_list: Option<PathBuf>,

    #[clap(
        long,
        default_value = settings::DEFAULT_CIDR_BITS,
        env("FLOCK_CIDR_BITS"),
        help = "Prefix length of our own subnet, probed when no networks or list are given"
    )]
    pub cidr_bits: u8,

    // Certificates
    #[clap(
        long,
        default_value = "certs",
        env("FLOCK_CERT_DIR"),
        help = "Directory holding node.der, node.key, ca.der and optionally intermediate.der"
    )]
    pub cert_dir: PathBuf,

    #[clap(long, env("FLOCK_VISITOR"), help = "Join as a visitor that never leads")]
    pub visitor: bool,

    // Timing
    #[clap(
        long,
        default_value = settings::DEFAULT_HEARTBEAT_MS,
        env("FLOCK_HEARTBEAT_MS"),
        help = "Heartbeat period in milliseconds"
    )]
    pub heartbeat_ms: u64,

    #[clap(
        long,
        default_value = settings::DEFAULT_STABLE_SECS,
        env("FLOCK_STABLE_SECS"),
        help = "Seconds a flock must stay unchanged before it is reported stable"
    )]
    pub stable_window_secs: u64,
}

impl Cli {
    pub fn into_settings(self) -> settings::Settings {
        settings::Settings {
            listen_address: self.listen_address,
            listen_port: self.listen_port,
            node_name: self.node_name,
            horde: self.horde,
            beacon: self.beacon,
            secondary_key: self.secondary_key,
            networks: self.networks,
            address_list: self.address_list,
            cidr_bits: self.cidr_bits,
            cert_dir: self.cert_dir,
            visitor: self.visitor,
            heartbeat_ms: self.heartbeat_ms,
            stable_window_secs: self.stable_window_secs,
        }
    }
}
