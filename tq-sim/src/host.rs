//! Wiring of the emulator interface pair on the host.

use std::{ffi::OsString, io, path::Path};

use tq_common::{command, Command, EventSink, Runner};

use crate::config::Config;

/// Bridge joining both interfaces in bridged operation.
pub const EMULATOR_BRIDGE: &str = "br-emu";
/// Namespace holding the public uplink in extended operation.
pub const PUBLIC_NETNS: &str = "public";
/// Bridge joining the right VLAN and the host end of the veth pair.
pub const RIGHT_BRIDGE: &str = "br-right";
pub const VETH_HOST: &str = "veth-host";
pub const VETH_PUBLIC: &str = "veth-public";

const SYS_CLASS_NET: &str = "/sys/class/net";

/// Whether every interface in `names` exists on the host.
pub fn interfaces_present<I, S>(names: I) -> io::Result<bool>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    interfaces_present_in(SYS_CLASS_NET, names)
}

/// Like [`interfaces_present`], with the interfaces listed in `root` instead of `/sys/class/net`.
pub fn interfaces_present_in<I, S>(root: impl AsRef<Path>, names: I) -> io::Result<bool>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let existing: Vec<OsString> = std::fs::read_dir(root)?
        .map(|entry| entry.map(|e| e.file_name()))
        .collect::<io::Result<_>>()?;

    Ok(names
        .into_iter()
        .all(|name| existing.iter().any(|e| e == name.as_ref())))
}

/// Checks that both interfaces of `config` exist, reporting a critical event otherwise.
pub fn require_interfaces(config: &Config, events: &dyn EventSink) -> bool {
    require_interfaces_in(SYS_CLASS_NET, config, events)
}

pub fn require_interfaces_in(
    root: impl AsRef<Path>,
    config: &Config,
    events: &dyn EventSink,
) -> bool {
    match interfaces_present_in(root, [config.left_interface(), config.right_interface()]) {
        Ok(true) => true,
        Ok(false) => {
            events.critical("Required interfaces are not up.");
            false
        }
        Err(e) => {
            events.critical(&format!("Unable to list interfaces: {e}"));
            false
        }
    }
}

/// Whether a rule is appended or deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Append,
    Delete,
}

impl RuleAction {
    pub const fn flag(self) -> &'static str {
        match self {
            Self::Append => "-A",
            Self::Delete => "-D",
        }
    }
}

/// Forwards traffic for the public address, arriving on the left VLAN, to the right endpoint.
pub fn public_dnat(config: &Config, action: RuleAction) -> Command {
    Command::sudo(format!(
        "iptables -t nat {} PREROUTING -i {} -d {} -j DNAT --to-destination {}",
        action.flag(),
        config.left_vlan_interface(),
        config.extended.public_interface.public_ip(),
        config.general.right_endpoint_ip
    ))
}

pub fn flush_conntrack() -> Command {
    Command::sudo("conntrack -F")
}

/// Installs [`public_dnat`] and drops the tracked connections, so existing flows pick it up.
pub async fn add_public_dnat(runner: &Runner, config: &Config) -> command::Result<()> {
    runner.checked(public_dnat(config, RuleAction::Append)).await?;
    runner.checked(flush_conntrack()).await?;
    Ok(())
}

pub async fn remove_public_dnat(runner: &Runner, config: &Config) -> command::Result<()> {
    runner
        .checked(public_dnat(config, RuleAction::Delete))
        .await
        .map(drop)
}

/// Addresses both interfaces, or joins them in [`EMULATOR_BRIDGE`] if `bridged`, and sets them
/// up. Every step is required.
pub async fn config_interfaces(
    runner: &Runner,
    config: &Config,
    bridged: bool,
) -> command::Result<()> {
    let (left, right) = (config.left_interface(), config.right_interface());
    let left_address = &config.general.left_interface_address;
    let right_address = &config.general.right_interface_address;

    let mut commands = if bridged {
        vec![
            format!("brctl addbr {EMULATOR_BRIDGE}"),
            format!("brctl addif {EMULATOR_BRIDGE} {left}"),
            format!("brctl addif {EMULATOR_BRIDGE} {right}"),
            format!("ip link set up dev {EMULATOR_BRIDGE}"),
        ]
    } else {
        vec![
            format!("ip addr add {right_address} dev {right}"),
            format!("ip addr add {left_address} dev {left}"),
        ]
    };
    commands.push(format!("ip link set up dev {right}"));
    commands.push(format!("ip link set up dev {left}"));

    for cmd in commands {
        runner.checked(Command::sudo(cmd)).await?;
    }

    tracing::debug!(left, right, bridged, "interfaces configured");
    Ok(())
}

/// Removes what [`config_interfaces`] and the public DNAT rule may have left behind.
pub async fn cleanup_old_config(runner: &Runner, config: &Config) {
    let (left, right) = (config.left_interface(), config.right_interface());
    let left_address = &config.general.left_interface_address;
    let right_address = &config.general.right_interface_address;

    runner
        .tolerant(public_dnat(config, RuleAction::Delete).quiet())
        .await;

    let commands = [
        format!("ip addr del {right_address} dev {right}"),
        format!("ip addr del {left_address} dev {left}"),
        format!("ip link set down dev {right}"),
        format!("ip link set down dev {left}"),
        format!("ip link set down dev {EMULATOR_BRIDGE}"),
        format!("brctl delbr {EMULATOR_BRIDGE}"),
    ];
    for cmd in commands {
        runner.tolerant(Command::sudo(cmd).quiet()).await;
    }
}
