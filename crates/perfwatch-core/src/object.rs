//! Managed-object keys and entity kinds.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PerfError;

/// Kind of compute resource a counter can apply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    #[serde(rename = "vm")]
    VirtualMachine,
    #[serde(rename = "host")]
    Host,
}

impl EntityKind {
    /// Type tag the endpoint uses for objects of this kind.
    pub fn type_tag(self) -> &'static str {
        match self {
            EntityKind::VirtualMachine => "VirtualMachine",
            EntityKind::Host => "HostSystem",
        }
    }

    /// Maps an endpoint type tag back to an entity kind.
    pub fn from_type_tag(tag: &str) -> Option<Self> {
        match tag {
            "VirtualMachine" => Some(EntityKind::VirtualMachine),
            "HostSystem" => Some(EntityKind::Host),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::VirtualMachine => write!(f, "vm"),
            EntityKind::Host => write!(f, "host"),
        }
    }
}

/// Handle to a remote managed object: a type tag plus an opaque identifier.
///
/// Equality compares both fields. Ordering is by identifier first, then by
/// type tag, which gives deterministic iteration over keyed containers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawObjectKey")]
pub struct ObjectKey {
    #[serde(rename = "type")]
    kind: String,
    id: String,
}

#[derive(Deserialize)]
struct RawObjectKey {
    #[serde(rename = "type")]
    kind: String,
    id: String,
}

impl TryFrom<RawObjectKey> for ObjectKey {
    type Error = PerfError;

    fn try_from(raw: RawObjectKey) -> Result<Self, Self::Error> {
        ObjectKey::new(raw.kind, raw.id)
    }
}

impl ObjectKey {
    /// Creates a key. Both the type tag and the identifier must be non-empty.
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Result<Self, PerfError> {
        let kind = kind.into();
        let id = id.into();
        if kind.trim().is_empty() {
            return Err(PerfError::InvalidArgument(
                "managed object type is empty".to_string(),
            ));
        }
        if id.trim().is_empty() {
            return Err(PerfError::InvalidArgument(format!(
                "managed object id is empty (type {})",
                kind
            )));
        }
        Ok(Self { kind, id })
    }

    /// Key from literals known to be non-empty.
    pub(crate) fn from_static(kind: &'static str, id: &'static str) -> Self {
        debug_assert!(!kind.is_empty() && !id.is_empty());
        Self {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    /// Key for a virtual machine.
    pub fn vm(id: impl Into<String>) -> Result<Self, PerfError> {
        Self::new(EntityKind::VirtualMachine.type_tag(), id)
    }

    /// Key for a physical host.
    pub fn host(id: impl Into<String>) -> Result<Self, PerfError> {
        Self::new(EntityKind::Host.type_tag(), id)
    }

    pub fn type_tag(&self) -> &str {
        &self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Entity kind implied by the type tag, if it is one we query.
    pub fn entity_kind(&self) -> Option<EntityKind> {
        EntityKind::from_type_tag(&self.kind)
    }
}

impl Ord for ObjectKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id
            .cmp(&other.id)
            .then_with(|| self.kind.cmp(&other.kind))
    }
}

impl PartialOrd for ObjectKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_fields_are_rejected() {
        assert!(matches!(
            ObjectKey::new("", "vm-1"),
            Err(PerfError::InvalidArgument(_))
        ));
        assert!(matches!(
            ObjectKey::new("VirtualMachine", "  "),
            Err(PerfError::InvalidArgument(_))
        ));
    }

    #[test]
    fn equality_is_by_value() {
        let a = ObjectKey::new("VirtualMachine", "vm-49").unwrap();
        let b = ObjectKey::new(String::from("VirtualMachine"), String::from("vm-49")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, ObjectKey::new("HostSystem", "vm-49").unwrap());
    }

    #[test]
    fn ordering_is_id_then_type() {
        let mut keys = vec![
            ObjectKey::new("VirtualMachine", "b").unwrap(),
            ObjectKey::new("VirtualMachine", "a").unwrap(),
            ObjectKey::new("HostSystem", "b").unwrap(),
        ];
        keys.sort();
        let ordered: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        assert_eq!(
            ordered,
            vec!["VirtualMachine:a", "HostSystem:b", "VirtualMachine:b"]
        );
    }

    #[test]
    fn type_tags_round_trip_to_kinds() {
        assert_eq!(
            ObjectKey::vm("vm-1").unwrap().entity_kind(),
            Some(EntityKind::VirtualMachine)
        );
        assert_eq!(
            ObjectKey::host("host-9").unwrap().entity_kind(),
            Some(EntityKind::Host)
        );
        assert_eq!(ObjectKey::new("Datastore", "ds-1").unwrap().entity_kind(), None);
    }

    #[test]
    fn deserialize_validates_fields() {
        let key: ObjectKey =
            serde_json::from_str(r#"{"type":"HostSystem","id":"host-12"}"#).unwrap();
        assert_eq!(key, ObjectKey::host("host-12").unwrap());

        let bad = serde_json::from_str::<ObjectKey>(r#"{"type":"HostSystem","id":""}"#);
        assert!(bad.is_err());
    }
}
