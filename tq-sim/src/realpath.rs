//! Real upstream paths.
//!
//! Every uplink is a VLAN on the right interface. Traffic arriving on the left VLAN is marked with
//! the fwmark of the selected uplink and routed through a table holding only that uplink's
//! default route. Gateways are either configured or discovered concurrently once the VLANs are up.
//!
//! The public namespace provides a fixed uplink for the right endpoint. It is reached through a
//! veth pair bridged with the right VLAN.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};

use async_trait::async_trait;
use tq_common::{command, Command, EventSink, JoinMap, Runner};

use crate::{
    config::{Config, UplinkConfig},
    host::{RuleAction, PUBLIC_NETNS, RIGHT_BRIDGE, VETH_HOST, VETH_PUBLIC},
    mode::{Mode, ModeHost},
};

/// State of one uplink, shared between the orchestrator and its [`RealPathEntry`] mode.
#[derive(Debug)]
pub struct UplinkEntry {
    name: String,
    vlan: u16,
    interface: String,
    address: Option<String>,
    static_gateway: Option<String>,
    gateway: OnceLock<String>,
    ready: AtomicBool,
}

impl UplinkEntry {
    pub fn new(config: &UplinkConfig) -> Self {
        Self {
            name: config.name.clone(),
            vlan: config.vlan,
            interface: config.interface_name(),
            address: config.address.clone(),
            static_gateway: config.gateway.clone(),
            gateway: OnceLock::new(),
            ready: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vlan(&self) -> u16 {
        self.vlan
    }

    /// The VLAN device, `vlan{vlan}-d`.
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Packet mark and routing table of this uplink.
    pub fn fwmark(&self) -> u32 {
        u32::from(self.vlan)
    }

    /// Gateway of the uplink, once configured or discovered.
    pub fn gateway(&self) -> Option<&str> {
        self.gateway.get().map(String::as_str)
    }

    /// Whether the routing table of this uplink is installed.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn set_gateway(&self, gateway: String) {
        if let Err(gateway) = self.gateway.set(gateway) {
            tracing::warn!(name = %self.name, %gateway, "gateway already set, ignoring");
        }
    }
}

/// Outcome of a gateway lookup.
#[derive(Debug)]
pub enum Discovery {
    Found(String),
    TimedOut,
    /// The lookup command could not be run.
    Failed(command::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Delay between two lookups.
    pub interval: Duration,
    /// Time after which an uplink without gateway is given up.
    pub timeout: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Extracts the gateway of the default route from `ip route show` output.
pub fn parse_default_gateway(routes: &str) -> Option<String> {
    let line = routes.lines().find(|line| line.starts_with("default"))?;
    let mut parts = line.split_whitespace();
    parts.find(|part| *part == "via")?;
    parts.next().map(str::to_string)
}

/// Polls the routes of `interface` until a default route shows up. A lookup that exits with a
/// non-zero status means there is no route yet.
pub async fn discover_gateway(
    runner: Runner,
    interface: String,
    options: DiscoveryOptions,
) -> Discovery {
    let lookup = Command::new("ip")
        .args(["route", "show", "dev", interface.as_str()])
        .quiet();

    let poll = async {
        loop {
            match runner.run(&lookup).await {
                Ok(output) if output.success() => {
                    if let Some(gateway) = parse_default_gateway(&output.stdout) {
                        return Discovery::Found(gateway);
                    }
                }
                Ok(output) => tracing::trace!(%interface, ?output.code, "no route yet"),
                Err(e) => return Discovery::Failed(e),
            }
            tokio::time::sleep(options.interval).await;
        }
    };

    tokio::time::timeout(options.timeout, poll)
        .await
        .unwrap_or(Discovery::TimedOut)
}

fn masquerade(action: RuleAction, interface: &str) -> String {
    format!("iptables -t nat {} POSTROUTING -o {interface} -j MASQUERADE", action.flag())
}

/// Orchestrates the VLANs, the public namespace and the uplinks.
#[derive(Debug)]
pub struct RealPath {
    config: Arc<Config>,
    runner: Runner,
    entries: Vec<Arc<UplinkEntry>>,
    discovery: DiscoveryOptions,
}

impl RealPath {
    pub fn new(config: Arc<Config>, runner: Runner) -> Self {
        let entries = config
            .extended
            .configs
            .iter()
            .map(|c| Arc::new(UplinkEntry::new(c)))
            .collect();

        Self {
            config,
            runner,
            entries,
            discovery: DiscoveryOptions::default(),
        }
    }

    pub fn with_discovery(mut self, discovery: DiscoveryOptions) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn entries(&self) -> &[Arc<UplinkEntry>] {
        &self.entries
    }

    /// One mode per uplink.
    pub fn modes(&self) -> Vec<RealPathEntry> {
        let left_vlan = self.config.left_vlan_interface();
        self.entries
            .iter()
            .map(|entry| {
                RealPathEntry::new(Arc::clone(entry), left_vlan.clone(), self.runner.clone())
            })
            .collect()
    }

    fn events(&self) -> &Arc<dyn EventSink> {
        self.runner.events()
    }

    async fn exec(&self, cmd: impl AsRef<str>) -> command::Result<()> {
        self.runner.checked(Command::sudo(cmd)).await.map(drop)
    }

    async fn exec_all<I>(&self, commands: I) -> command::Result<()>
    where
        I: IntoIterator<Item = String>,
    {
        for cmd in commands {
            self.exec(cmd).await?;
        }
        Ok(())
    }

    async fn exec_in_netns(&self, cmd: impl fmt::Display) -> command::Result<()> {
        self.exec(format!("ip netns exec {PUBLIC_NETNS} {cmd}")).await
    }

    /// Sets up the left VLAN, the public namespace and every uplink, then waits for the uplink
    /// gateways. Returns the number of uplinks ready for use.
    ///
    /// Failures of the shared wiring are returned. Failures of a single uplink are logged and only
    /// exclude that uplink.
    pub async fn config_interfaces(&self) -> command::Result<usize> {
        let config = &self.config;
        let (left, right) = (config.left_interface(), config.right_interface());
        let (left_id, right_id) = (config.extended.left_vlan, config.extended.right_vlan);
        let left_vlan = config.left_vlan_interface();
        let right_vlan = config.right_vlan_interface();
        let left_address = &config.general.left_interface_address;
        let right_address = &config.general.right_interface_address;
        let netns_address = &config.extended.right_netns_address;
        let endpoint = &config.general.right_endpoint_ip;
        let public = &config.extended.public_interface;
        let public_id = public.vlan;
        let public_if = public.interface_name();

        // Left side
        self.exec_all([
            format!("ip link set up {left}"),
            format!("ip link add link {left} name {left_vlan} type vlan id {left_id}"),
            format!("ip addr add {left_address} dev {left_vlan}"),
            format!("ip link set up dev {left_vlan}"),
        ])
        .await?;

        // Public namespace, bridged with the right VLAN
        self.exec_all([
            format!("ip netns add {PUBLIC_NETNS}"),
            format!("ip link set up {right}"),
            format!("ip link add link {right} name {public_if} type vlan id {public_id}"),
            format!("ip link set up dev {public_if}"),
            format!("ip link set dev {public_if} netns {PUBLIC_NETNS}"),
        ])
        .await?;
        self.attach_public_interface().await?;

        self.exec_all([
            format!("ip link add {VETH_HOST} type veth peer name {VETH_PUBLIC}"),
            format!("ip link set {VETH_PUBLIC} netns {PUBLIC_NETNS}"),
            format!("ip link add link {right} name {right_vlan} type vlan id {right_id}"),
            format!("brctl addbr {RIGHT_BRIDGE}"),
            format!("brctl addif {RIGHT_BRIDGE} {VETH_HOST}"),
            format!("brctl addif {RIGHT_BRIDGE} {right_vlan}"),
            format!("ip link set up dev {RIGHT_BRIDGE}"),
            format!("ip addr add {right_address} dev {RIGHT_BRIDGE}"),
            format!("ip link set up dev {right_vlan}"),
            format!("ip link set up dev {VETH_HOST}"),
        ])
        .await?;
        self.exec_in_netns(format!("ip addr add {netns_address} dev {VETH_PUBLIC}"))
            .await?;
        self.exec_in_netns(format!("ip link set up dev {VETH_PUBLIC}"))
            .await?;

        self.exec_in_netns(masquerade(RuleAction::Append, VETH_PUBLIC))
            .await?;
        self.exec(masquerade(RuleAction::Append, RIGHT_BRIDGE)).await?;

        // Uplinks
        let mut configured = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            match self.setup_entry(entry).await {
                Ok(()) => configured.push(Arc::clone(entry)),
                Err(e) => {
                    let message = format!("Unable to set up {}: {e}", entry.name());
                    self.events().error(&message);
                }
            }
        }

        self.resolve_gateways(&configured).await;

        let mut ready = 0;
        for entry in &configured {
            if self.activate(entry).await {
                ready += 1;
            } else if entry.gateway().is_none() {
                let name = entry.name();
                self.events()
                    .info(&format!("Unable to set up {name}: No default gateway was found."));
            }
        }

        // The VLAN loses its link in the namespace once the uplinks are set up on the right
        // interface. Create it again, on the left interface.
        self.exec_in_netns(format!("ip link del {public_if}")).await?;
        self.exec_all([
            format!("ip link add link {left} name {public_if} type vlan id {public_id}"),
            format!("ip link set dev {public_if} netns {PUBLIC_NETNS}"),
        ])
        .await?;
        self.attach_public_interface().await?;
        for protocol in ["tcp", "udp"] {
            self.exec_in_netns(format!(
                "iptables -t nat -A PREROUTING -i {public_if} -p {protocol} \
                 -j DNAT --to-destination {endpoint}"
            ))
            .await?;
        }

        tracing::info!(ready, total = self.entries.len(), "real paths configured");
        Ok(ready)
    }

    /// Brings the public VLAN up inside the namespace, addressed and routed.
    async fn attach_public_interface(&self) -> command::Result<()> {
        let public = &self.config.extended.public_interface;
        let public_if = public.interface_name();
        let (address, gateway) = (&public.address, &public.gateway);

        for cmd in [
            format!("ip link set up dev {public_if}"),
            format!("ip addr add {address} dev {public_if}"),
            format!("ip route add default via {gateway} dev {public_if}"),
        ] {
            self.exec_in_netns(cmd).await?;
        }
        Ok(())
    }

    async fn setup_entry(&self, entry: &UplinkEntry) -> command::Result<()> {
        let (iface, right) = (entry.interface(), self.config.right_interface());
        let vlan = entry.vlan;

        self.exec_all([
            format!("ip link add link {right} name {iface} type vlan id {vlan}"),
            format!("ip link set up dev {iface}"),
        ])
        .await?;

        if let Some(address) = &entry.address {
            self.exec(format!("ip address add {address} dev {iface}")).await?;
            if let Some(gateway) = &entry.static_gateway {
                self.exec(format!("ip route add default via {gateway} dev {iface}"))
                    .await?;
            }
        }

        self.exec(masquerade(RuleAction::Append, iface)).await
    }

    /// Sets the gateway of every entry, from the configuration or by discovery. Returns once
    /// every discovery finished.
    async fn resolve_gateways(&self, entries: &[Arc<UplinkEntry>]) {
        let mut tasks = JoinMap::new();

        for (index, entry) in entries.iter().enumerate() {
            if let Some(gateway) = &entry.static_gateway {
                entry.set_gateway(gateway.clone());
                continue;
            }

            let interface = entry.interface().to_string();
            let task = discover_gateway(self.runner.clone(), interface, self.discovery);
            tasks.spawn(index, task);
        }

        while let Some((index, result)) = tasks.join_next().await {
            let entry = &entries[index];
            match result {
                Ok(Discovery::Found(gateway)) => {
                    tracing::debug!(name = %entry.name(), %gateway, "gateway discovered");
                    entry.set_gateway(gateway);
                }
                Ok(Discovery::TimedOut) => self.events().info(&format!(
                    "{}: Interface {}: no gateway found within timeout",
                    entry.name(),
                    entry.interface()
                )),
                Ok(Discovery::Failed(e)) => self.events().error(&format!(
                    "{}: Interface {}: Unable to get gateway: {e}",
                    entry.name(),
                    entry.interface()
                )),
                Err(e) => {
                    let message = format!("{}: gateway discovery failed: {e}", entry.name());
                    self.events().error(&message);
                }
            }
        }
    }

    /// Installs the routing table of an entry with a gateway. Returns whether the entry is ready.
    async fn activate(&self, entry: &UplinkEntry) -> bool {
        let Some(gateway) = entry.gateway() else {
            return false;
        };

        let (name, iface, table) = (entry.name(), entry.interface(), entry.fwmark());
        self.events()
            .info(&format!("Got default gateway for {name}: {gateway}"));

        let route = format!("ip route add default via {gateway} dev {iface} table {table}");
        match self.exec(route).await {
            Ok(()) => {
                entry.ready.store(true, Ordering::Release);
                true
            }
            Err(e) => {
                self.events()
                    .error(&format!("Unable to install route for {name}: {e}"));
                false
            }
        }
    }

    /// Removes everything [`RealPath::config_interfaces`] may have created. Never fails.
    pub async fn cleanup_old_config(&self) {
        let left_vlan = self.config.left_vlan_interface();

        for entry in &self.entries {
            let iface = entry.interface();
            let fwmark = entry.fwmark();

            let mut commands = vec![
                masquerade(RuleAction::Delete, iface),
                format!(
                    "iptables -t mangle -D PREROUTING -i {left_vlan} -j MARK --set-mark {fwmark}"
                ),
                format!("ip rule del fwmark {fwmark} table {fwmark}"),
            ];
            if let Some(gateway) = entry.gateway() {
                commands.push(format!(
                    "ip route del default via {gateway} dev {iface} table {fwmark}"
                ));
            }
            commands.push(format!("ip link del {iface}"));

            for cmd in commands {
                self.runner.tolerant(Command::sudo(cmd).quiet()).await;
            }
        }

        let commands = [
            format!("ip link del {left_vlan}"),
            masquerade(RuleAction::Delete, RIGHT_BRIDGE),
            format!("ip netns del {PUBLIC_NETNS}"),
            format!("ip link set down dev {RIGHT_BRIDGE}"),
            format!("brctl delbr {RIGHT_BRIDGE}"),
            format!("ip link del {VETH_HOST}"),
            format!("ip link del {VETH_PUBLIC}"),
            format!("ip link del {}", self.config.extended.public_interface.interface_name()),
            format!("ip link del {}", self.config.right_vlan_interface()),
        ];
        for cmd in commands {
            self.runner.tolerant(Command::sudo(cmd).quiet()).await;
        }
    }
}

/// Routes the traffic of the left VLAN through one uplink while enabled.
#[derive(Debug)]
pub struct RealPathEntry {
    entry: Arc<UplinkEntry>,
    left_vlan_interface: String,
    runner: Runner,
}

impl RealPathEntry {
    pub fn new(entry: Arc<UplinkEntry>, left_vlan_interface: String, runner: Runner) -> Self {
        Self {
            entry,
            left_vlan_interface,
            runner,
        }
    }

    pub fn entry(&self) -> &UplinkEntry {
        &self.entry
    }

    fn mark_rule(&self, action: &str) -> Command {
        Command::sudo(format!(
            "iptables -t mangle {action} PREROUTING -i {} -j MARK --set-mark {}",
            self.left_vlan_interface,
            self.entry.fwmark()
        ))
    }

    fn ip_rule(&self, action: &str) -> Command {
        let fwmark = self.entry.fwmark();
        Command::sudo(format!("ip rule {action} fwmark {fwmark} table {fwmark}"))
    }

    async fn install(&self) -> command::Result<()> {
        self.runner.checked(self.mark_rule("-A")).await?;
        self.runner.checked(self.ip_rule("add")).await?;
        self.runner.checked(Command::sudo("conntrack -F")).await?;
        Ok(())
    }

    async fn remove(&self) -> command::Result<()> {
        self.runner.checked(self.mark_rule("-D")).await?;
        self.runner.checked(self.ip_rule("del")).await?;
        Ok(())
    }
}

#[async_trait]
impl Mode for RealPathEntry {
    fn title(&self) -> &str {
        self.entry.name()
    }

    fn attach(&self, host: &mut dyn ModeHost) {
        host.add_tab(self.title(), &format!("Real path via {}", self.entry.name()));
    }

    async fn enable(&mut self) {
        let (events, name) = (self.runner.events(), self.entry.name());
        if self.entry.gateway().is_none() {
            events.error(&format!("Cannot enable {name} without default gateway!"));
            return;
        }

        if let Err(e) = self.install().await {
            events.error(&format!("Unable to install required route: {e}"));
        }
        events.info(&format!("Real path {name} enabled"));
    }

    async fn disable(&mut self) {
        let (events, name) = (self.runner.events(), self.entry.name());
        if self.entry.gateway().is_none() {
            events.error(&format!("Cannot disable {name} without default gateway!"));
            return;
        }

        if let Err(e) = self.remove().await {
            events.error(&format!("Unable to remove route: {e}"));
        }
        events.info(&format!("Real path {name} disabled"));
    }
}
