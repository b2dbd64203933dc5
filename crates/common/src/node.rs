use serde::{Deserialize, Serialize};

/// Identifier of a metadata or storage node.
///
/// The id composes host identity with a session epoch so that a restarted
/// process never reuses the vector-clock slot of its previous incarnation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Build a node id from an explicit override, or derive one as
    /// `<hostname>-<session-epoch>`.
    pub fn acquire(explicit: Option<String>, session_epoch: u64) -> Self {
        match explicit {
            Some(id) if !id.is_empty() => Self(id),
            _ => {
                let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "node".to_string());
                Self(format!("{host}-{session_epoch}"))
            }
        }
    }

    pub fn from_string(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthStatus {
    pub node_id: NodeId,
    pub role: String,
    pub online: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_id_wins_over_derivation() {
        let id = NodeId::acquire(Some("mn-custom".to_string()), 1);
        assert_eq!(id.as_str(), "mn-custom");
    }

    #[test]
    fn derived_id_carries_session_epoch() {
        let a = NodeId::acquire(None, 1111);
        let b = NodeId::acquire(None, 2222);
        assert_ne!(a, b);
        assert!(a.as_str().ends_with("-1111"));
    }
}
