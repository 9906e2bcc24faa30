//! Discovery queries and per-session de-duplication.

use std::collections::HashSet;

use uuid::Uuid;

use crate::connectivity::Endpoint;
use crate::error::{Error, Result};
use crate::protocol::DISCOVERY_URI;
use crate::resource::{ResourceDescriptor, ResourceKey, ResourceRecord};

/// Parsed discovery filter: `rt=<type>` and/or `if=<interface>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryQuery {
    pub resource_type: Option<String>,
    pub interface: Option<String>,
}

impl DiscoveryQuery {
    /// Accepts `""`, `/oic/res`, `rt=core.light`, `/oic/res?rt=core.light&if=oic.if.baseline`.
    pub fn parse(query: &str) -> Result<Self> {
        let query = query.trim();
        let filters = match query.split_once('?') {
            Some((path, rest)) => {
                if !path.is_empty() && path != DISCOVERY_URI {
                    return Err(Error::InvalidQuery(format!("unexpected path {path:?}")));
                }
                rest
            }
            None if query == DISCOVERY_URI => "",
            None => query,
        };
        let mut out = DiscoveryQuery::default();
        for pair in filters.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::InvalidQuery(format!("expected key=value, got {pair:?}")))?;
            if value.is_empty() {
                return Err(Error::InvalidQuery(format!("empty value for {key:?}")));
            }
            match key {
                "rt" => out.resource_type = Some(value.to_string()),
                "if" => out.interface = Some(value.to_string()),
                other => {
                    return Err(Error::InvalidQuery(format!("unknown filter {other:?}")));
                }
            }
        }
        Ok(out)
    }

    /// Whether a hosted resource satisfies this filter.
    pub fn matches(&self, record: &ResourceRecord) -> bool {
        let type_ok = self
            .resource_type
            .as_ref()
            .map_or(true, |rt| record.types.iter().any(|t| t == rt));
        let if_ok = self.interface.as_ref().map_or(true, |i| {
            record.interfaces.iter().any(|x| x == i)
                || (record.interfaces.is_empty() && i == crate::resource::BASELINE_INTERFACE)
        });
        type_ok && if_ok
    }

    /// Canonical query string sent on the wire.
    pub fn to_query_string(&self) -> String {
        let mut parts = Vec::new();
        if let Some(rt) = &self.resource_type {
            parts.push(format!("rt={rt}"));
        }
        if let Some(i) = &self.interface {
            parts.push(format!("if={i}"));
        }
        if parts.is_empty() {
            DISCOVERY_URI.to_string()
        } else {
            format!("{}?{}", DISCOVERY_URI, parts.join("&"))
        }
    }
}

/// State of one discovery session: the (URI, host) pairs already delivered.
#[derive(Debug, Default)]
pub struct DiscoverySession {
    query: DiscoveryQuery,
    seen: HashSet<ResourceKey>,
}

impl DiscoverySession {
    pub fn new(query: DiscoveryQuery) -> Self {
        Self {
            query,
            seen: HashSet::new(),
        }
    }

    pub fn query(&self) -> &DiscoveryQuery {
        &self.query
    }

    /// Turn one record of a response into a descriptor.
    /// `Ok(None)` means the record does not match the query, or the (URI, host)
    /// pair was already delivered in this session.
    pub fn accept(
        &mut self,
        record: ResourceRecord,
        source: &Endpoint,
        device_id: Uuid,
    ) -> Result<Option<ResourceDescriptor>> {
        if !self.query.matches(&record) {
            return Ok(None);
        }
        let descriptor = ResourceDescriptor::from_record(record, source, device_id)?;
        if self.seen.insert(descriptor.key()) {
            Ok(Some(descriptor))
        } else {
            Ok(None)
        }
    }

    /// Number of distinct resources delivered so far.
    pub fn delivered(&self) -> usize {
        self.seen.len()
    }
}
