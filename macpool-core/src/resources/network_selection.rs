use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::skip_serializing_none;
use thiserror::Error;

use crate::mac::{MacAddress, MacError};

#[derive(Debug, Error)]
pub enum NetworkSelectionError {
    #[error("Network selection list couldn't be parsed as JSON! {}", .0)]
    InvalidJson(serde_json::Error),
    #[error("'{}' is not a valid network selection!", .0)]
    InvalidShorthand(String),
}

/// One entry of the Multus `k8s.v1.cni.cncf.io/networks` annotation. Fields the
/// allocator doesn't care about are carried over untouched.
#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct NetworkSelectionElement {
    pub name: String,
    pub namespace: Option<String>,
    #[serde(rename = "interface")]
    pub interface_request: Option<String>,
    pub mac: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NetworkSelectionElement {
    /// Identifies this attachment among the pod's networks.
    pub fn interface_id(&self) -> String {
        match (&self.interface_request, &self.namespace) {
            (Some(interface), _) => interface.to_owned(),
            (None, Some(namespace)) => format!("{namespace}/{}", self.name),
            (None, None) => self.name.to_owned(),
        }
    }

    pub fn parsed_mac(&self) -> Option<Result<MacAddress, MacError>> {
        self.mac
            .as_deref()
            .filter(|raw| !raw.is_empty())
            .map(str::parse)
    }
}

fn shorthand_regex() -> &'static Regex {
    static SHORTHAND: OnceLock<Regex> = OnceLock::new();

    SHORTHAND.get_or_init(|| {
        Regex::new(r"^(?:(?P<namespace>[^/@\s]+)/)?(?P<name>[^/@\s]+)(?:@(?P<interface>[^/@\s]+))?$")
            .unwrap()
    })
}

/// Accepts both the JSON list and the `[namespace/]name[@interface]`
/// comma-separated forms.
pub fn parse_network_selection(
    raw: &str,
) -> Result<Vec<NetworkSelectionElement>, NetworkSelectionError> {
    let raw = raw.trim();

    if raw.is_empty() {
        return Ok(Vec::new());
    }

    if raw.starts_with('[') {
        return serde_json::from_str(raw).map_err(NetworkSelectionError::InvalidJson);
    }

    raw.split(',')
        .map(str::trim)
        .map(|selection| {
            let captures = shorthand_regex()
                .captures(selection)
                .ok_or_else(|| NetworkSelectionError::InvalidShorthand(selection.to_owned()))?;

            Ok(NetworkSelectionElement {
                name: captures["name"].to_owned(),
                namespace: captures.name("namespace").map(|m| m.as_str().to_owned()),
                interface_request: captures.name("interface").map(|m| m.as_str().to_owned()),
                ..Default::default()
            })
        })
        .collect()
}
