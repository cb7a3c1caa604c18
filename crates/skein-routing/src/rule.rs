//! Routing rules.
//!
//! A rule is an owned byte string with fixed-offset accessors, so the wire
//! form, the persisted form and the in-memory form are the same bytes.
//!
//! Layout, big-endian:
//!
//! ```text
//! keep-alive ms: u64 | type: u8 | key-route-id: u32 | body
//! ```
//!
//! Bodies by type:
//!
//! - `Consume`               — route descriptor (68 B)
//! - `Forward`               — route descriptor + next-route-id + next-transport-id
//! - `IntermediaryForward`   — next-route-id + next-transport-id
//!
//! Anything shorter than the 13-byte header is invalid and must be
//! discarded wherever rules are loaded.

use crate::address::{RouteDescriptor, DESCRIPTOR_SIZE};
use crate::error::RoutingError;
use crate::table::RouteId;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Minimum rule length: keep-alive + type + key route id.
pub const RULE_HEADER_SIZE: usize = 8 + 1 + 4;

const OFF_TYPE: usize = 8;
const OFF_KEY: usize = 9;
const OFF_BODY: usize = RULE_HEADER_SIZE;

const NEXT_FIELDS_SIZE: usize = 4 + 16;

/// Rule variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RuleType {
    /// Endpoint rule delivering payloads to a local route group
    Consume = 0x00,
    /// Endpoint rule forwarding onto the first hop, descriptor attached
    Forward = 0x01,
    /// Mid-route rule rewriting the route id and forwarding
    IntermediaryForward = 0x02,
}

impl RuleType {
    /// Whether this rule sits at a circuit endpoint.
    #[must_use]
    pub fn is_endpoint(&self) -> bool {
        matches!(self, Self::Consume | Self::Forward)
    }
}

impl TryFrom<u8> for RuleType {
    type Error = RoutingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Consume),
            0x01 => Ok(Self::Forward),
            0x02 => Ok(Self::IntermediaryForward),
            other => Err(RoutingError::InvalidRuleType(other)),
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Consume => write!(f, "Consume"),
            Self::Forward => write!(f, "Forward"),
            Self::IntermediaryForward => write!(f, "IntermediaryForward"),
        }
    }
}

/// One hop's instruction for packets matching a route id.
#[derive(Clone, PartialEq, Eq)]
pub struct Rule(Vec<u8>);

impl Rule {
    /// Build a Consume rule.
    #[must_use]
    pub fn consume(keep_alive: Duration, key: RouteId, desc: RouteDescriptor) -> Self {
        let mut raw = Self::header(keep_alive, RuleType::Consume, key);
        raw.extend_from_slice(&desc.to_bytes());
        Self(raw)
    }

    /// Build an endpoint Forward rule.
    #[must_use]
    pub fn forward(
        keep_alive: Duration,
        key: RouteId,
        next_route_id: RouteId,
        next_transport_id: Uuid,
        desc: RouteDescriptor,
    ) -> Self {
        let mut raw = Self::header(keep_alive, RuleType::Forward, key);
        raw.extend_from_slice(&desc.to_bytes());
        raw.extend_from_slice(&next_route_id.0.to_be_bytes());
        raw.extend_from_slice(next_transport_id.as_bytes());
        Self(raw)
    }

    /// Build an IntermediaryForward rule.
    #[must_use]
    pub fn intermediary_forward(
        keep_alive: Duration,
        key: RouteId,
        next_route_id: RouteId,
        next_transport_id: Uuid,
    ) -> Self {
        let mut raw = Self::header(keep_alive, RuleType::IntermediaryForward, key);
        raw.extend_from_slice(&next_route_id.0.to_be_bytes());
        raw.extend_from_slice(next_transport_id.as_bytes());
        Self(raw)
    }

    fn header(keep_alive: Duration, ty: RuleType, key: RouteId) -> Vec<u8> {
        let mut raw = Vec::with_capacity(RULE_HEADER_SIZE + DESCRIPTOR_SIZE + NEXT_FIELDS_SIZE);
        raw.extend_from_slice(&(keep_alive.as_millis() as u64).to_be_bytes());
        raw.push(ty as u8);
        raw.extend_from_slice(&key.0.to_be_bytes());
        raw
    }

    /// Parse and validate rule bytes.
    ///
    /// # Errors
    ///
    /// `CorruptedRule` when shorter than the header or when the body does
    /// not match the declared type; `InvalidRuleType` on an unknown type
    /// byte.
    pub fn from_bytes(raw: Vec<u8>) -> Result<Self, RoutingError> {
        if raw.len() < RULE_HEADER_SIZE {
            return Err(RoutingError::CorruptedRule(format!(
                "{} bytes, header is {RULE_HEADER_SIZE}",
                raw.len()
            )));
        }
        let ty = RuleType::try_from(raw[OFF_TYPE])?;
        let body = raw.len() - RULE_HEADER_SIZE;
        let expected = match ty {
            RuleType::Consume => DESCRIPTOR_SIZE,
            RuleType::Forward => DESCRIPTOR_SIZE + NEXT_FIELDS_SIZE,
            RuleType::IntermediaryForward => NEXT_FIELDS_SIZE,
        };
        if body != expected {
            return Err(RoutingError::CorruptedRule(format!(
                "{ty} body is {body} bytes, expected {expected}"
            )));
        }
        Ok(Self(raw))
    }

    /// Raw byte view.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The rule's variant.
    ///
    /// # Panics
    ///
    /// Panics on a type byte the validated constructors could not have
    /// produced; a rule must come from a constructor, `from_bytes` or
    /// deserialization.
    #[must_use]
    pub fn rule_type(&self) -> RuleType {
        RuleType::try_from(self.0[OFF_TYPE]).expect("type byte validated at construction")
    }

    /// The route id this rule is stored under.
    #[must_use]
    pub fn key_route_id(&self) -> RouteId {
        RouteId(u32::from_be_bytes([
            self.0[OFF_KEY],
            self.0[OFF_KEY + 1],
            self.0[OFF_KEY + 2],
            self.0[OFF_KEY + 3],
        ]))
    }

    /// Inactivity interval after which the rule expires.
    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        let mut ms = [0u8; 8];
        ms.copy_from_slice(&self.0[..8]);
        Duration::from_millis(u64::from_be_bytes(ms))
    }

    /// Route descriptor of an endpoint rule.
    ///
    /// # Errors
    ///
    /// `FieldUnavailable` for `IntermediaryForward` rules.
    pub fn route_descriptor(&self) -> Result<RouteDescriptor, RoutingError> {
        match self.rule_type() {
            RuleType::Consume | RuleType::Forward => RouteDescriptor::from_bytes(
                &self.0[OFF_BODY..],
            )
            .ok_or_else(|| RoutingError::CorruptedRule("descriptor truncated".into())),
            RuleType::IntermediaryForward => {
                Err(RoutingError::FieldUnavailable("IntermediaryForward", "descriptor"))
            }
        }
    }

    /// Route id to rewrite onto forwarded packets.
    ///
    /// # Errors
    ///
    /// `FieldUnavailable` for `Consume` rules.
    pub fn next_route_id(&self) -> Result<RouteId, RoutingError> {
        let off = self.next_fields_offset()?;
        Ok(RouteId(u32::from_be_bytes([
            self.0[off],
            self.0[off + 1],
            self.0[off + 2],
            self.0[off + 3],
        ])))
    }

    /// Transport to forward matching packets on.
    ///
    /// # Errors
    ///
    /// `FieldUnavailable` for `Consume` rules.
    pub fn next_transport_id(&self) -> Result<Uuid, RoutingError> {
        let off = self.next_fields_offset()? + 4;
        let mut id = [0u8; 16];
        id.copy_from_slice(&self.0[off..off + 16]);
        Ok(Uuid::from_bytes(id))
    }

    fn next_fields_offset(&self) -> Result<usize, RoutingError> {
        match self.rule_type() {
            RuleType::Forward => Ok(OFF_BODY + DESCRIPTOR_SIZE),
            RuleType::IntermediaryForward => Ok(OFF_BODY),
            RuleType::Consume => Err(RoutingError::FieldUnavailable("Consume", "next_route_id")),
        }
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Rule");
        d.field("type", &self.rule_type())
            .field("key", &self.key_route_id())
            .field("keep_alive", &self.keep_alive());
        if let Ok(desc) = self.route_descriptor() {
            d.field("desc", &format_args!("{desc}"));
        }
        if let Ok(next) = self.next_route_id() {
            d.field("next", &next);
        }
        d.finish()
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(key={})", self.rule_type(), self.key_route_id())
    }
}

impl Serialize for Rule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Rule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let raw = hex::decode(&s).map_err(serde::de::Error::custom)?;
        Rule::from_bytes(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_crypto::Keypair;

    fn desc() -> RouteDescriptor {
        RouteDescriptor::new(
            Keypair::generate().public,
            Keypair::generate().public,
            7000,
            8000,
        )
    }

    #[test]
    fn test_consume_fields() {
        let d = desc();
        let rule = Rule::consume(Duration::from_secs(120), RouteId(4), d);
        assert_eq!(rule.rule_type(), RuleType::Consume);
        assert_eq!(rule.key_route_id(), RouteId(4));
        assert_eq!(rule.keep_alive(), Duration::from_secs(120));
        assert_eq!(rule.route_descriptor().unwrap(), d);
        assert!(rule.next_route_id().is_err());
        assert!(rule.next_transport_id().is_err());
    }

    #[test]
    fn test_forward_fields() {
        let d = desc();
        let tp = Uuid::new_v4();
        let rule = Rule::forward(Duration::from_secs(1), RouteId(1), RouteId(2), tp, d);
        assert_eq!(rule.rule_type(), RuleType::Forward);
        assert_eq!(rule.route_descriptor().unwrap(), d);
        assert_eq!(rule.next_route_id().unwrap(), RouteId(2));
        assert_eq!(rule.next_transport_id().unwrap(), tp);
    }

    #[test]
    fn test_intermediary_fields() {
        let tp = Uuid::new_v4();
        let rule = Rule::intermediary_forward(Duration::from_secs(1), RouteId(5), RouteId(6), tp);
        assert_eq!(rule.rule_type(), RuleType::IntermediaryForward);
        assert_eq!(rule.next_route_id().unwrap(), RouteId(6));
        assert_eq!(rule.next_transport_id().unwrap(), tp);
        assert!(rule.route_descriptor().is_err());
    }

    #[test]
    fn test_bytes_roundtrip() {
        let rule = Rule::consume(Duration::from_millis(1500), RouteId(9), desc());
        let parsed = Rule::from_bytes(rule.as_bytes().to_vec()).unwrap();
        assert_eq!(parsed, rule);
    }

    #[test]
    fn test_short_rule_rejected() {
        let err = Rule::from_bytes(vec![0u8; RULE_HEADER_SIZE - 1]).unwrap_err();
        assert!(matches!(err, RoutingError::CorruptedRule(_)));
    }

    #[test]
    fn test_body_size_mismatch_rejected() {
        let mut raw = Rule::keep_alive_header_for_tests();
        raw.extend_from_slice(&[0u8; 3]); // too short for a Consume body
        assert!(Rule::from_bytes(raw).is_err());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut raw = Rule::consume(Duration::ZERO, RouteId(1), desc())
            .as_bytes()
            .to_vec();
        raw[OFF_TYPE] = 0x7F;
        assert_eq!(
            Rule::from_bytes(raw).unwrap_err(),
            RoutingError::InvalidRuleType(0x7F)
        );
    }

    impl Rule {
        fn keep_alive_header_for_tests() -> Vec<u8> {
            Self::header(Duration::from_secs(1), RuleType::Consume, RouteId(1))
        }
    }
}
