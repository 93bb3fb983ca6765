//! Shared types for the wallet engine.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Dust threshold in satoshis. Outputs below this are not relayed.
pub const DUST_THRESHOLD: u64 = 546;

/// Serde module for serializing `[u8; 32]` as hex strings.
pub mod hex_bytes32 {
    use super::*;

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

/// Serde module for serializing arbitrary byte vectors as hex strings.
pub mod hex_bytes {
    use super::*;

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Like [`hex_bytes`], for optional fields. Missing and `null` both map to `None`.
pub mod hex_bytes_opt {
    use super::*;

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        match s {
            Some(s) if !s.is_empty() => hex::decode(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            _ => Ok(None),
        }
    }
}

/// Bitcoin network type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Bitcoin mainnet.
    Bitcoin,
    /// Bitcoin testnet.
    Testnet,
    /// Bitcoin regtest (local development).
    Regtest,
    /// Signet.
    Signet,
}

impl Network {
    /// Convert to bitcoin crate's Network type.
    pub fn to_bitcoin_network(self) -> bitcoin::Network {
        match self {
            Network::Bitcoin => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Regtest => bitcoin::Network::Regtest,
            Network::Signet => bitcoin::Network::Signet,
        }
    }

    /// Whether extended keys of `other` can be used on this network.
    ///
    /// BIP32 serialization only distinguishes mainnet from the test networks.
    pub fn is_compatible_with(self, other: bitcoin::NetworkKind) -> bool {
        bitcoin::NetworkKind::from(self.to_bitcoin_network()) == other
    }
}

impl std::str::FromStr for Network {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bitcoin" | "mainnet" => Ok(Network::Bitcoin),
            "testnet" | "testnet3" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            "signet" => Ok(Network::Signet),
            _ => Err(crate::error::Error::Parse(format!(
                "Unknown network: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Bitcoin => write!(f, "bitcoin"),
            Network::Testnet => write!(f, "testnet"),
            Network::Regtest => write!(f, "regtest"),
            Network::Signet => write!(f, "signet"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[derive(Serialize, Deserialize)]
    struct Holder {
        #[serde(with = "hex_bytes32")]
        hash: [u8; 32],
        #[serde(with = "hex_bytes_opt", default)]
        nonce: Option<Vec<u8>>,
    }

    #[test]
    fn test_network_parse() {
        assert_eq!(Network::from_str("mainnet").unwrap(), Network::Bitcoin);
        assert_eq!(Network::from_str("Regtest").unwrap(), Network::Regtest);
        assert!(Network::from_str("liquid").is_err());
        assert_eq!(Network::Signet.to_string(), "signet");
    }

    #[test]
    fn test_hex_helpers() {
        let json = format!(r#"{{"hash":"{}"}}"#, "ab".repeat(32));
        let holder: Holder = serde_json::from_str(&json).unwrap();
        assert_eq!(holder.hash, [0xab; 32]);
        assert!(holder.nonce.is_none());

        let short = r#"{"hash":"abab"}"#;
        assert!(serde_json::from_str::<Holder>(short).is_err());
    }
}
