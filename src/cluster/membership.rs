//! Cluster membership from health reports
//!
//! Reports look like `host1:port1(UP);host2:port2(DOWN)`. Only `UP` nodes
//! count, the local node always counts, and nodes are indexed in sorted
//! order so every node computes the same assignment.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

use super::ClusterError;

/// Reported status of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeStatus {
    Up,
    Down,
}

/// Parse a health report into `(address, status)` pairs
pub fn parse_report(report: &str) -> Result<Vec<(String, NodeStatus)>, ClusterError> {
    report
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let open = entry.rfind('(');
            let close = entry.rfind(')');
            match (open, close) {
                (Some(open), Some(close)) if open > 0 && close > open => {
                    let address = entry[..open].trim().to_string();
                    let status = if entry[open + 1..close].trim().eq_ignore_ascii_case("UP") {
                        NodeStatus::Up
                    } else {
                        NodeStatus::Down
                    };
                    Ok((address, status))
                }
                _ => Err(ClusterError::MalformedEntry(entry.to_string())),
            }
        })
        .collect()
}

/// Sorted set of active nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Membership {
    nodes: Vec<String>,
}

impl Membership {
    /// Membership from a list of active nodes plus the local node
    pub fn new<I, S>(nodes: I, local_node: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set: BTreeSet<String> = nodes.into_iter().map(Into::into).collect();
        set.insert(local_node.to_string());
        Self {
            nodes: set.into_iter().collect(),
        }
    }

    /// Membership from a health report
    pub fn from_report(report: &str, local_node: &str) -> Result<Self, ClusterError> {
        let up = parse_report(report)?
            .into_iter()
            .filter(|(_, status)| *status == NodeStatus::Up)
            .map(|(address, _)| address);
        Ok(Self::new(up, local_node))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn index_of(&self, node: &str) -> Option<usize> {
        self.nodes.binary_search_by(|n| n.as_str().cmp(node)).ok()
    }
}

impl fmt::Display for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.nodes.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_report() {
        let parsed = parse_report("a:1(UP); b:2(DOWN);c:3(up);").unwrap();
        assert_eq!(
            parsed,
            vec![
                ("a:1".to_string(), NodeStatus::Up),
                ("b:2".to_string(), NodeStatus::Down),
                ("c:3".to_string(), NodeStatus::Up),
            ]
        );
        assert!(parse_report("").unwrap().is_empty());
    }

    #[test]
    fn test_malformed_entry() {
        assert!(matches!(parse_report("a:1(UP);garbage"), Err(ClusterError::MalformedEntry(e)) if e == "garbage"));
        assert!(parse_report("(UP)").is_err());
    }

    #[test]
    fn test_local_node_always_counts() {
        let membership = Membership::from_report("b:1(UP);a:1(DOWN)", "a:1").unwrap();
        assert_eq!(membership.nodes(), ["a:1".to_string(), "b:1".to_string()]);
        assert_eq!(membership.index_of("a:1"), Some(0));
        assert_eq!(membership.index_of("c:1"), None);
    }

    #[test]
    fn test_order_does_not_matter() {
        let first = Membership::from_report("c:1(UP);b:1(UP)", "a:1").unwrap();
        let second = Membership::from_report("b:1(UP);c:1(UP)", "a:1").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }
}
