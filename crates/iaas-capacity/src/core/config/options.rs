//! Parsing of compact override strings such as `cluster:3[cpu.overprovisioning.factor=2.0]`.

use indexmap::IndexMap;

use crate::core::error::{CapacityError, CapacityResult};

/// Splits a config value string into the scope part and the options part.
///
/// `cluster:3[cpu.overprovisioning.factor=2.0]` is split into `cluster:3` and `cpu.overprovisioning.factor=2.0`,
/// a string without brackets has no options part. Unbalanced brackets are rejected.
pub fn parse_config_value(config_str: &str) -> CapacityResult<(&str, Option<&str>)> {
    let config_str = config_str.trim();
    match config_str.split_once('[') {
        Some((scope, rest)) => {
            let options = rest
                .strip_suffix(']')
                .filter(|options| !options.contains(['[', ']']))
                .ok_or_else(|| CapacityError::InvalidConfig(format!("unbalanced brackets in '{}'", config_str)))?;
            Ok((scope.trim(), Some(options)))
        }
        None if config_str.contains(']') => Err(CapacityError::InvalidConfig(format!(
            "unbalanced brackets in '{}'",
            config_str
        ))),
        None => Ok((config_str, None)),
    }
}

/// Parses a comma-separated list of `name=value` options, keeping their order.
///
/// Empty entries are skipped. Entries without a name or a `=`, and names given twice, are rejected.
///
/// # Examples
///
/// ```rust
/// use iaas_capacity::core::config::options::parse_options;
///
/// let options = parse_options("cpu.overprovisioning.factor=2.0, mem.overprovisioning.factor=1.5").unwrap();
/// assert_eq!(options["cpu.overprovisioning.factor"], "2.0");
/// assert_eq!(options["mem.overprovisioning.factor"], "1.5");
/// assert!(parse_options("cpu.overprovisioning.factor").is_err());
/// ```
pub fn parse_options(options_str: &str) -> CapacityResult<IndexMap<String, String>> {
    let mut options = IndexMap::new();
    for option_str in options_str.split(',').map(str::trim).filter(|option| !option.is_empty()) {
        let (name, value) = option_str
            .split_once('=')
            .map(|(name, value)| (name.trim(), value.trim()))
            .filter(|(name, _)| !name.is_empty())
            .ok_or_else(|| {
                CapacityError::InvalidConfig(format!("option '{}' is not of the form name=value", option_str))
            })?;
        if options.insert(name.to_string(), value.to_string()).is_some() {
            return Err(CapacityError::InvalidConfig(format!("option {} is given twice", name)));
        }
    }
    Ok(options)
}
