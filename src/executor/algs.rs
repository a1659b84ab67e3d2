use std::collections::BTreeMap;

use regex::Regex;

use super::Error;
use crate::azure::CloudResource;
use crate::types::policy::AzureResourceFilter;

fn compile(pattern: &str) -> Result<Regex, Error> {
    // `regex` syntax, no lookaround; uncompilable sub-patterns are rejected
    Regex::new(pattern).map_err(|source| Error::InvalidFilter {
        pattern: pattern.to_string(),
        source,
    })
}

/// Expands the `|`-separated filter into the ordered list of matching
/// namespaces. Sub-patterns are consumed in filter order, giving the deployer
/// control over stop/start sequencing; `reverse` flips that order for
/// startup.
pub fn sort_namespaces(
    namespaces: &[String],
    filter: &str,
    reverse: bool,
) -> Result<Vec<String>, Error> {
    let mut patterns: Vec<&str> = filter.split('|').collect();
    if reverse {
        patterns.reverse();
    }

    let mut result = Vec::new();
    for pattern in patterns {
        let regex = compile(pattern)?;
        for namespace in namespaces {
            if regex.is_match(namespace) {
                result.push(namespace.clone());
            }
        }
    }
    Ok(result)
}

/// Buckets listed resources by filter priority, keeping only names the filter
/// regex matches.
pub(super) fn merge_cloud_resources(
    buckets: &mut BTreeMap<i64, Vec<CloudResource>>,
    listed: Vec<CloudResource>,
    filter: &AzureResourceFilter,
) -> Result<(), Error> {
    let regex = compile(&filter.resource_name_filter)?;
    for resource in listed {
        if regex.is_match(resource.name()) {
            buckets.entry(filter.priority).or_default().push(resource);
        }
    }
    Ok(())
}
