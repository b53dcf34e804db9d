//! Cluster topology
//!
//! The ordered instance set is read once per run from the coordinator's instance listing.
//! Each instance's fragment paths are derived from the [`RunContext`] at that point and
//! never change afterwards.

use crate::context::RunContext;
use crate::error::{LoadError, Result};
use crate::exec::{ExecutionTarget, SshOptions};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::net::ToSocketAddrs;
use std::path::PathBuf;
use tracing::debug;

/// One participating node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: u64,
    /// Host name or address as listed by the coordinator
    pub name: String,
    /// Storage root on the instance's node
    pub storage_root: PathBuf,
    /// CSV fragment, on the coordinator
    pub csv_fragment: PathBuf,
    /// Store-native fragment, on the instance's node
    pub dlf_fragment: PathBuf,
    /// Where commands for this instance run
    pub target: ExecutionTarget,
}

impl Instance {
    pub fn is_local(&self) -> bool {
        self.target.is_local()
    }
}

/// Ordered, immutable instance set of a run
#[derive(Debug, Clone, Default)]
pub struct Topology {
    instances: Vec<Instance>,
}

impl Topology {
    pub fn new(instances: Vec<Instance>) -> Self {
        Self { instances }
    }

    /// Build the topology from the coordinator's CSV instance listing.
    pub fn from_listing(
        listing: &str,
        context: &RunContext,
        hosts: &HostAddresses,
        ssh: &SshOptions,
    ) -> Result<Self> {
        let instances = parse_listing(listing)?
            .into_iter()
            .map(|record| {
                let target = if hosts.contains(&record.name) {
                    ExecutionTarget::Local
                } else {
                    ExecutionTarget::remote(record.name.clone(), ssh.clone())
                };
                Instance {
                    id: record.id,
                    csv_fragment: context.csv_fragment(record.id),
                    dlf_fragment: context.dlf_fragment(&record.storage_root),
                    name: record.name,
                    storage_root: record.storage_root,
                    target,
                }
            })
            .collect::<Vec<_>>();

        if instances.is_empty() {
            return Err(LoadError::resolution(
                "SciDB configuration information lists no instances.",
                "",
            ));
        }
        Ok(Self::new(instances))
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Instance> {
        self.instances.iter()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl<'a> IntoIterator for &'a Topology {
    type Item = &'a Instance;
    type IntoIter = std::slice::Iter<'a, Instance>;

    fn into_iter(self) -> Self::IntoIter {
        self.instances.iter()
    }
}

/// One row of the instance listing, quotes stripped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub id: u64,
    pub name: String,
    pub storage_root: PathBuf,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    name: String,
    instance_id: String,
    instance_path: String,
}

fn unquote(value: &str) -> String {
    value.replace('\'', "")
}

/// Parse the `-o csv` output of `list('instances')`.
///
/// String columns arrive wrapped in single quotes; columns other than `name`,
/// `instance_id` and `instance_path` are ignored.
pub fn parse_listing(listing: &str) -> Result<Vec<InstanceRecord>> {
    let invalid = |detail: String| {
        LoadError::resolution("Failed to parse SciDB configuration information.", detail)
    };

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(listing.as_bytes());

    let mut records = Vec::new();
    for row in reader.deserialize::<RawRecord>() {
        let raw = row.map_err(|e| invalid(e.to_string()))?;
        let id_text = unquote(&raw.instance_id);
        let id = id_text
            .trim()
            .parse()
            .map_err(|_| invalid(format!("invalid instance id '{id_text}'")))?;
        records.push(InstanceRecord {
            id,
            name: unquote(&raw.name),
            storage_root: PathBuf::from(unquote(&raw.instance_path)),
        });
    }
    Ok(records)
}

/// Names and addresses under which this host may appear in the instance listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostAddresses(BTreeSet<String>);

impl HostAddresses {
    /// Loopback names, the host name, and every address the host name resolves to.
    pub fn detect() -> Self {
        let mut names: BTreeSet<String> = ["localhost", "127.0.0.1", "::1"]
            .into_iter()
            .map(String::from)
            .collect();

        match hostname::get() {
            Ok(host) => {
                let host = host.to_string_lossy().into_owned();
                match (host.as_str(), 0).to_socket_addrs() {
                    Ok(addrs) => names.extend(addrs.map(|addr| addr.ip().to_string())),
                    Err(e) => debug!(host = %host, error = %e, "Host name does not resolve"),
                }
                names.insert(host);
            },
            Err(e) => debug!(error = %e, "Failed to read host name"),
        }

        debug!(addresses = ?names, "Local host addresses");
        Self(names)
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::LoadConfig;
    use std::path::Path;

    const LISTING: &str = "\
name,port,instance_id,online_since,instance_path
'localhost',1239,0,'2024-03-01 10:00:00','/data/000/0'
'node2',1240,1,'2024-03-01 10:00:01','/data/000/1'
";

    #[test]
    fn test_parse_listing_strips_quotes() {
        let records = parse_listing(LISTING).unwrap();
        assert_eq!(
            records,
            vec![
                InstanceRecord {
                    id: 0,
                    name: "localhost".into(),
                    storage_root: PathBuf::from("/data/000/0"),
                },
                InstanceRecord {
                    id: 1,
                    name: "node2".into(),
                    storage_root: PathBuf::from("/data/000/1"),
                },
            ]
        );
    }

    #[test]
    fn test_parse_listing_rejects_missing_columns() {
        let err = parse_listing("name,port\n'localhost',1239\n").unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Resolution);
        assert!(parse_listing("name,instance_id,instance_path\n'a',x,'/d'\n").is_err());
    }

    #[test]
    fn test_topology_classifies_and_names_instances() {
        let context = RunContext::plan(
            &LoadConfig {
                temp_dir: PathBuf::from("/tmp"),
                ..Default::default()
            },
            "r7",
        );
        let hosts = HostAddresses::from_names(["localhost"]);
        let topology =
            Topology::from_listing(LISTING, &context, &hosts, &SshOptions::default()).unwrap();

        assert_eq!(topology.len(), 2);
        let local = &topology.instances()[0];
        let remote = &topology.instances()[1];
        assert!(local.is_local());
        assert!(!remote.is_local());
        assert_eq!(remote.target.to_string(), "ssh:node2");
        assert_eq!(
            remote.csv_fragment,
            Path::new("/tmp/loadcsv.r7.d/stdin.csv_0001")
        );
        assert_eq!(
            remote.dlf_fragment,
            Path::new("/data/000/1/stdin.csv.r7.dlf")
        );
    }

    #[test]
    fn test_empty_listing_is_resolution_error() {
        let context = RunContext::plan(&LoadConfig::default(), "r");
        let err = Topology::from_listing(
            "name,port,instance_id,online_since,instance_path\n",
            &context,
            &HostAddresses::default(),
            &SshOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Resolution);
    }

    #[test]
    fn test_detect_includes_loopback() {
        let hosts = HostAddresses::detect();
        assert!(hosts.contains("localhost"));
        assert!(hosts.contains("127.0.0.1"));
        assert!(!hosts.contains("definitely-not-this-host.invalid"));
    }
}
