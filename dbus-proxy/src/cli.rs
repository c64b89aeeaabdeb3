//! `clap`-derived command-line surface (§10.3), covering exactly the configuration in §6.

use clap::Parser;

use crate::error::ConfigError;
use crate::policy::{FilterRule, Filters, PolicyLevel, RuleType};

#[derive(Debug, Parser)]
#[command(name = "dbus-proxy", about = "A filtering D-Bus proxy")]
pub struct Args {
    /// Path of the local socket clients connect to.
    #[arg(long)]
    pub socket: String,

    /// Upstream bus address, opaque to this process.
    #[arg(long)]
    pub bus: String,

    /// Enable policy filtering. Disabled lets everything through unmodified.
    #[arg(long, default_value_t = true, overrides_with = "no_filter")]
    pub filter: bool,
    #[arg(long)]
    no_filter: bool,

    /// Emit debug-level tracing for denied/rewritten calls (§7, §10.1).
    #[arg(long)]
    pub log: bool,

    /// Treat unique names appearing in `NameOwnerChanged` as visible even without an
    /// explicit rule (§4.6 step 4).
    #[arg(long)]
    pub sloppy_names: bool,

    /// Grant SEE to NAME (or NAME.* when it ends in `.*`).
    #[arg(long = "see", value_name = "NAME")]
    pub see: Vec<String>,

    /// Grant TALK to NAME (or NAME.* when it ends in `.*`).
    #[arg(long = "talk", value_name = "NAME")]
    pub talk: Vec<String>,

    /// Grant OWN to NAME (or NAME.* when it ends in `.*`).
    #[arg(long = "own", value_name = "NAME")]
    pub own: Vec<String>,

    /// Additionally allow a specific call, e.g. `--call=org.example.Foo=Iface.Method@/org/example`.
    #[arg(long = "call", value_name = "NAME=RULE")]
    pub call: Vec<String>,

    /// Additionally allow a specific broadcast signal, same grammar as `--call`.
    #[arg(long = "broadcast", value_name = "NAME=RULE")]
    pub broadcast: Vec<String>,

    /// A file descriptor number the proxy writes one byte to on startup and watches for
    /// hangup/error (§6 "Liveness descriptor").
    #[arg(long = "fd")]
    pub liveness_fd: Option<i32>,
}

/// Fully resolved proxy configuration, built from [`Args`] (§6 "Configuration").
pub struct ProxyConfig {
    pub socket_path: String,
    pub bus_address: String,
    pub filter: bool,
    pub log: bool,
    pub sloppy_names: bool,
    pub filters: Filters,
    pub liveness_fd: Option<i32>,
}

impl Args {
    pub fn into_config(self) -> Result<ProxyConfig, ConfigError> {
        if self.bus.is_empty() {
            return Err(ConfigError::EmptyBusAddress);
        }

        let mut filters = Filters::new();
        for name in &self.see {
            add_name_rule(&mut filters, name, PolicyLevel::See)?;
        }
        for name in &self.talk {
            add_name_rule(&mut filters, name, PolicyLevel::Talk)?;
        }
        for name in &self.own {
            add_name_rule(&mut filters, name, PolicyLevel::Own)?;
        }
        for rule in &self.call {
            add_call_rule(&mut filters, rule, RuleType::Call.into())?;
        }
        for rule in &self.broadcast {
            add_call_rule(&mut filters, rule, RuleType::Broadcast.into())?;
        }

        Ok(ProxyConfig {
            socket_path: self.socket,
            bus_address: self.bus,
            filter: self.filter && !self.no_filter,
            log: self.log,
            sloppy_names: self.sloppy_names,
            filters,
            liveness_fd: self.liveness_fd,
        })
    }
}

fn split_subtree(name: &str) -> Result<(&str, bool), ConfigError> {
    if name.starts_with(':') {
        return Err(ConfigError::UniqueNameAsFilterName(name.to_owned()));
    }
    Ok(match name.strip_suffix(".*") {
        Some(base) => (base, true),
        None => (name, false),
    })
}

fn add_name_rule(filters: &mut Filters, raw: &str, level: PolicyLevel) -> Result<(), ConfigError> {
    let (name, subtree) = split_subtree(raw)?;
    filters.add(name, FilterRule::name_policy_with_subtree(level, subtree));
    Ok(())
}

fn add_call_rule(
    filters: &mut Filters,
    raw: &str,
    types: enumflags2::BitFlags<RuleType>,
) -> Result<(), ConfigError> {
    let (name_part, rule_part) = raw
        .split_once('=')
        .ok_or_else(|| ConfigError::MalformedRule(raw.to_owned()))?;
    let (name, _subtree) = split_subtree(name_part)?;
    let rule = FilterRule::parse_call_rule(PolicyLevel::Talk, types, rule_part)?;
    filters.add(name, rule);
    Ok(())
}
