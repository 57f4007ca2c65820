//! `DB{n}_*` environment variables, the way the docker-compose deployments declare sources.

use super::{SourceConf, Topology, TopologyError};

impl Topology {
    pub fn from_env() -> Result<Self, TopologyError> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Scan `DB1_*`, `DB2_*`, ... until the first index without a hostname.
    /// Entries missing a required field are skipped with a warning.
    pub fn from_env_with<F>(lookup: F) -> Result<Self, TopologyError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut confs = Vec::new();
        let mut index = 1;
        loop {
            let prefix = format!("DB{index}");
            let get = |suffix: &str| {
                lookup(&format!("{prefix}_{suffix}"))
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
            };
            let Some(hostname) = get("HOSTNAME") else {
                break;
            };
            index += 1;

            let required = [
                ("USER", get("USER")),
                ("PASSWORD", get("PASSWORD")),
                ("NAME", get("NAME")),
                ("SERVER_NAME", get("SERVER_NAME")),
            ];
            let missing: Vec<&str> = required
                .iter()
                .filter(|(_, v)| v.is_none())
                .map(|(k, _)| *k)
                .collect();
            if !missing.is_empty() {
                log::warn!(
                    target: "cdc::topology",
                    "skipping {} due to missing fields: {:?}",
                    prefix,
                    missing
                );
                continue;
            }
            let [user, password, database, server_name] = required.map(|(_, v)| v.unwrap_or_default());

            let port = match get("PORT") {
                Some(raw) => match raw.parse::<u16>() {
                    Ok(port) => port,
                    Err(_) => {
                        log::warn!(target: "cdc::topology", "skipping {}: invalid port '{}'", prefix, raw);
                        continue;
                    }
                },
                None => 1433,
            };
            let tables = get("TABLE_INCLUDE_LIST")
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();

            log::info!(target: "cdc::topology", "found configuration for {}: {}.{}", prefix, server_name, database);
            confs.push(SourceConf {
                server_name,
                hostname,
                port,
                user,
                password,
                database,
                tables,
                history_topic: get("HISTORY_TOPIC"),
                ..SourceConf::default()
            });
        }
        Topology::new(&confs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn reads_sources_until_first_gap() {
        let lookup = env(&[
            ("DB1_HOSTNAME", "10.0.0.1"),
            ("DB1_USER", "sa"),
            ("DB1_PASSWORD", "pw"),
            ("DB1_NAME", "TestCDC"),
            ("DB1_SERVER_NAME", "AXLAP240"),
            ("DB1_TABLE_INCLUDE_LIST", "dbo.Customers, dbo.Orders,"),
            ("DB2_HOSTNAME", "10.0.0.2"),
            ("DB2_PORT", "14330"),
            ("DB2_USER", "sa"),
            ("DB2_PASSWORD", "pw"),
            ("DB2_NAME", "Sales"),
            ("DB2_SERVER_NAME", "TURING"),
            ("DB2_TABLE_INCLUDE_LIST", "dbo.Products"),
            ("DB2_HISTORY_TOPIC", "history.turing"),
            // DB3 missing -> DB4 never read
            ("DB4_HOSTNAME", "10.0.0.4"),
        ]);
        let topology = Topology::from_env_with(lookup).unwrap();
        let sources = topology.sources();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].server_name, "AXLAP240");
        assert_eq!(sources[0].port, 1433);
        assert_eq!(sources[0].tables.len(), 2);
        assert_eq!(sources[0].history_topic, "dbhistory.AXLAP240");
        assert_eq!(sources[1].port, 14330);
        assert_eq!(sources[1].history_topic, "history.turing");
        assert_eq!(topology.bindings().len(), 3);
    }

    #[test]
    fn skips_incomplete_entries() {
        let lookup = env(&[
            ("DB1_HOSTNAME", "10.0.0.1"),
            ("DB1_USER", "sa"),
            ("DB1_NAME", "TestCDC"),
            ("DB1_SERVER_NAME", "NOPASS"),
            ("DB2_HOSTNAME", "10.0.0.2"),
            ("DB2_USER", "sa"),
            ("DB2_PASSWORD", "pw"),
            ("DB2_NAME", "Sales"),
            ("DB2_SERVER_NAME", "OK"),
            ("DB2_TABLE_INCLUDE_LIST", "dbo.T"),
        ]);
        let topology = Topology::from_env_with(lookup).unwrap();
        assert_eq!(topology.sources().len(), 1);
        assert_eq!(topology.sources()[0].server_name, "OK");
    }
}
