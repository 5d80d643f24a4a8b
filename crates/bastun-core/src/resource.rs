//! Resource identifiers and tunnel targets.
//!
//! A resource id has the shape
//! `/subscriptions/{sub}/resourceGroups/{rg}/providers/{namespace}/{type}/{name}`
//! optionally followed by `/{child_type}/{child_name}` pairs. Segment keys are
//! matched case-insensitively; every value must be non-empty.

use std::fmt;
use std::str::FromStr;

use crate::error::{TunnelError, TunnelResult};

/// Default target port for SSH sessions.
pub const DEFAULT_SSH_PORT: u16 = 22;
/// Default target port for RDP sessions.
pub const DEFAULT_RDP_PORT: u16 = 3389;

const INVALID_RESOURCE_ID_HINT: &str = "Please enter a valid resource ID. If this is not working, \
     try opening the JSON view of your resource (in the Overview tab), and copying the full resource ID.";

/// A parsed, well-formed resource id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceId {
    raw: String,
    subscription: String,
    resource_group: String,
    namespace: String,
    resource_type: String,
    name: String,
    children: Vec<(String, String)>,
}

impl ResourceId {
    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn resource_group(&self) -> &str {
        &self.resource_group
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nested `(type, name)` pairs after the top-level resource.
    pub fn children(&self) -> &[(String, String)] {
        &self.children
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for ResourceId {
    type Err = TunnelError;

    fn from_str(s: &str) -> TunnelResult<Self> {
        let invalid = || TunnelError::Configuration(INVALID_RESOURCE_ID_HINT.to_string());

        let rest = s.trim().strip_prefix('/').ok_or_else(invalid)?;
        let segments: Vec<&str> = rest.split('/').collect();
        if segments.len() < 8 || segments.iter().any(|seg| seg.is_empty()) {
            return Err(invalid());
        }

        let expect_key = |idx: usize, key: &str| segments[idx].eq_ignore_ascii_case(key);
        if !expect_key(0, "subscriptions")
            || !expect_key(2, "resourceGroups")
            || !expect_key(4, "providers")
        {
            return Err(invalid());
        }

        // Anything after the top-level name must be (type, name) pairs.
        let tail = &segments[8..];
        if tail.len() % 2 != 0 {
            return Err(invalid());
        }
        let children = tail
            .chunks(2)
            .map(|pair| (pair[0].to_string(), pair[1].to_string()))
            .collect();

        Ok(Self {
            raw: s.trim().to_string(),
            subscription: segments[1].to_string(),
            resource_group: segments[3].to_string(),
            namespace: segments[5].to_string(),
            resource_type: segments[6].to_string(),
            name: segments[7].to_string(),
            children,
        })
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Whether `s` is a well-formed resource id.
pub fn is_valid_resource_id(s: &str) -> bool {
    s.parse::<ResourceId>().is_ok()
}

/// The private resource and port a tunnel reaches through the gateway.
///
/// Only constructible through validating constructors, so a `TargetSpec`
/// in hand always holds a well-formed id and a port in `1..=65535`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    resource_id: ResourceId,
    port: u16,
}

impl TargetSpec {
    pub fn new(resource_id: &str, port: u16) -> TunnelResult<Self> {
        let resource_id = resource_id.parse::<ResourceId>()?;
        if port == 0 {
            return Err(TunnelError::Configuration(
                "target port must be between 1 and 65535".into(),
            ));
        }
        Ok(Self { resource_id, port })
    }

    /// Build a target from an unparsed port string, as handed over by an
    /// argument parser or a config file.
    pub fn parse(resource_id: &str, port: &str) -> TunnelResult<Self> {
        let port = parse_port(port)?;
        Self::new(resource_id, port)
    }

    pub fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Parse a TCP port, rejecting non-numeric input, zero and anything above
/// 65535.
pub fn parse_port(s: &str) -> TunnelResult<u16> {
    let value: u64 = s
        .trim()
        .parse()
        .map_err(|_| TunnelError::Configuration(format!("invalid port '{s}': not a number")))?;
    match u16::try_from(value) {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(TunnelError::Configuration(format!(
            "invalid port '{s}': must be between 1 and 65535"
        ))),
    }
}
