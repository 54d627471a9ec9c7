use config::{Config, ConfigError, Environment, File};
use pouch_core::{GatewayLimits, PeerAddr, ATT_OVERHEAD};
use pouch_gateway::GatewayConfig;
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    pub spool_dir: PathBuf,
    /// Builtin server certificate (DER). Without it the certificate is
    /// fetched from the spool.
    pub server_cert_path: Option<PathBuf>,
    /// Hex serial of the builtin certificate.
    pub server_cert_serial: Option<String>,
    pub downlink_block_size: usize,
    #[serde(deserialize_with = "deserialize_list")]
    pub allowlist: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub scan_restart_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub default_mtu: usize,
    pub max_connections: usize,
    pub max_blocks: usize,
    pub max_block_size: usize,
    pub server_cert_max_len: usize,
    pub device_cert_max_len: usize,
    #[serde(with = "humantime_serde")]
    pub block_alloc_timeout: Duration,
}

fn deserialize_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ListVisitor;

    impl<'de> Visitor<'de> for ListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or a sequence of strings")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(split_list(value))
        }

        fn visit_seq<S>(self, mut seq: S) -> Result<Self::Value, S::Error>
        where
            S: de::SeqAccess<'de>,
        {
            let mut vec = Vec::new();
            while let Some(element) = seq.next_element()? {
                vec.push(element);
            }
            Ok(vec)
        }
    }

    deserializer.deserialize_any(ListVisitor)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split([',', ';'])
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl NodeConfig {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let limits = GatewayLimits::default();
        let mut builder = Config::builder()
            .set_default("spool_dir", "data/spool")?
            .set_default("server_cert_path", None::<String>)?
            .set_default("server_cert_serial", None::<String>)?
            .set_default("downlink_block_size", 512)?
            .set_default("allowlist", Vec::<String>::new())?
            .set_default("scan_restart_interval", "2s")?
            .set_default("connect_timeout", "6s")?
            .set_default("default_mtu", limits.default_mtu as u64)?
            .set_default("max_connections", limits.max_connections as u64)?
            .set_default("max_blocks", limits.max_blocks as u64)?
            .set_default("max_block_size", limits.max_block_size as u64)?
            .set_default("server_cert_max_len", limits.server_cert_max_len as u64)?
            .set_default("device_cert_max_len", limits.device_cert_max_len as u64)?
            .set_default("block_alloc_timeout", "5s")?;

        if let Some(path) = config_path {
            if path.extension().and_then(|ext| ext.to_str()) == Some("env") {
                // Loaded into the process environment so the prefixed
                // environment source below picks the values up.
                match dotenvy::from_path(&path) {
                    Ok(_) => tracing::info!("loaded environment from {}", path.display()),
                    Err(err) => {
                        tracing::warn!("failed to load .env from {}: {}", path.display(), err)
                    }
                }
            } else {
                builder = builder.add_source(File::from(path));
            }
        }

        // Values stay strings: serials are hex and must keep leading zeros.
        builder = builder.add_source(Environment::with_prefix("POUCH_GW"));

        builder.build()?.try_deserialize()
    }

    pub fn limits(&self) -> GatewayLimits {
        GatewayLimits {
            max_connections: self.max_connections,
            max_blocks: self.max_blocks,
            max_block_size: self.max_block_size,
            server_cert_max_len: self.server_cert_max_len,
            device_cert_max_len: self.device_cert_max_len,
            block_alloc_timeout: self.block_alloc_timeout,
            att_overhead: ATT_OVERHEAD,
            default_mtu: self.default_mtu,
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            limits: self.limits(),
            allowlist: self.allowlist.iter().map(PeerAddr::new).collect(),
            ..GatewayConfig::default()
        }
    }

    /// Decoded builtin certificate serial; empty when unset.
    pub fn server_cert_serial(&self) -> Result<Vec<u8>, hex::FromHexError> {
        match self.server_cert_serial.as_deref().map(str::trim) {
            Some(serial) if !serial.is_empty() => hex::decode(serial),
            _ => Ok(Vec::new()),
        }
    }

    #[cfg(feature = "btleplug")]
    pub fn radio_config(&self) -> pouch_transport_ble::btleplug_backend::BtleplugRadioConfig {
        pouch_transport_ble::btleplug_backend::BtleplugRadioConfig {
            scan_interval: self.scan_restart_interval,
            connect_timeout: self.connect_timeout,
            mtu: self.default_mtu,
            ..Default::default()
        }
    }
}
