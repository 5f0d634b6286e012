//! Request descriptors and their text form.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::WardenError;

/// One of the three attributes a descriptor or rule can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Account,
    ClientIp,
    RequestType,
}

impl Dimension {
    /// Name used in the descriptor text form and in counter keys.
    pub fn tag(&self) -> &'static str {
        match self {
            Dimension::Account => "account",
            Dimension::ClientIp => "ip",
            Dimension::RequestType => "type",
        }
    }
}

/// The identifying attributes of one inbound request.
///
/// A blank attribute is treated exactly like an absent one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct RequestDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_type: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl RequestDescriptor {
    /// Create a descriptor. Blank values are dropped.
    pub fn new(
        account_id: Option<String>,
        client_ip: Option<String>,
        request_type: Option<String>,
    ) -> Self {
        Self {
            account_id: non_blank(account_id),
            client_ip: non_blank(client_ip),
            request_type: non_blank(request_type),
        }
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = non_blank(Some(account_id.into()));
        self
    }

    pub fn with_client_ip(mut self, client_ip: impl Into<String>) -> Self {
        self.client_ip = non_blank(Some(client_ip.into()));
        self
    }

    pub fn with_request_type(mut self, request_type: impl Into<String>) -> Self {
        self.request_type = non_blank(Some(request_type.into()));
        self
    }

    pub fn account_id(&self) -> Option<&str> {
        self.account_id.as_deref()
    }

    pub fn client_ip(&self) -> Option<&str> {
        self.client_ip.as_deref()
    }

    pub fn request_type(&self) -> Option<&str> {
        self.request_type.as_deref()
    }

    /// Value carried for `dimension`, if any.
    pub fn get(&self, dimension: Dimension) -> Option<&str> {
        match dimension {
            Dimension::Account => self.account_id(),
            Dimension::ClientIp => self.client_ip(),
            Dimension::RequestType => self.request_type(),
        }
    }
}

impl fmt::Display for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = [Dimension::Account, Dimension::ClientIp, Dimension::RequestType]
            .into_iter()
            .filter_map(|d| self.get(d).map(|v| format!("{}={}", d.tag(), v)))
            .collect();

        if parts.is_empty() {
            write!(f, "*")
        } else {
            write!(f, "{}", parts.join(","))
        }
    }
}

impl FromStr for RequestDescriptor {
    type Err = WardenError;

    /// Parse `account=u1,ip=10.0.0.1,type=login`. Any subset of the keys may
    /// appear, in any order; `*` or an empty string is the empty descriptor.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut descriptor = RequestDescriptor::default();
        if s.is_empty() || s == "*" {
            return Ok(descriptor);
        }

        for pair in s.split(',') {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                WardenError::Config(format!("descriptor entry '{}' is not key=value", pair))
            })?;

            let slot = match key.trim() {
                "account" | "account_id" => &mut descriptor.account_id,
                "ip" | "client_ip" => &mut descriptor.client_ip,
                "type" | "request_type" => &mut descriptor.request_type,
                other => {
                    return Err(WardenError::Config(format!(
                        "unknown descriptor key '{}'",
                        other
                    )))
                }
            };

            if slot.is_some() {
                return Err(WardenError::Config(format!(
                    "descriptor key '{}' given twice",
                    key.trim()
                )));
            }
            *slot = non_blank(Some(value.trim().to_string()));
        }

        Ok(descriptor)
    }
}
