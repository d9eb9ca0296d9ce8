pub mod vda5050_common;
pub mod vda_1_1_0;
pub mod vda_2_0_0;

use serde::{Deserialize, Serialize};

use crate::header::Header;

/// Selects which VDA 5050 wire version a `Client` speaks (§6: "Protocol
/// versions supported: VDA 5050 1.1 and 2.0").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolVersion {
    V1_1_0,
    V2_0_0,
}

impl ProtocolVersion {
    pub fn version_string(self) -> &'static str {
        match self {
            ProtocolVersion::V1_1_0 => vda_1_1_0::VERSION,
            ProtocolVersion::V2_0_0 => vda_2_0_0::VERSION,
        }
    }

    pub fn major_version(self) -> &'static str {
        match self {
            ProtocolVersion::V1_1_0 => vda_1_1_0::MAJOR_VERSION,
            ProtocolVersion::V2_0_0 => vda_2_0_0::MAJOR_VERSION,
        }
    }
}

/// A headerless domain object together with its stamped envelope (§3 C8,
/// §GLOSSARY "Headerless object").
///
/// `body` is exactly the headerless input the caller published, preserved
/// by value: the round-trip invariant in spec.md §8 ("A header-stamped
/// object, when stripped of header fields, equals the input headerless
/// object") holds by construction, since `Stamped::body` never mutates
/// what it wraps.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Stamped<T> {
    #[serde(flatten)]
    pub header: Header,
    #[serde(flatten)]
    pub body: T,
}

impl<T> Stamped<T> {
    pub fn new(header: Header, body: T) -> Self {
        Self { header, body }
    }
}
