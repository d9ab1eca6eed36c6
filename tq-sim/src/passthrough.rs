use std::sync::Arc;

use async_trait::async_trait;
use tq_common::Runner;

use crate::{
    config::Config,
    host,
    mode::{Mode, ModeHost},
};

/// Forwards traffic between the interfaces without shaping it.
#[derive(Debug)]
pub struct PassthroughMode {
    config: Arc<Config>,
    runner: Runner,
    masquerade: bool,
}

impl PassthroughMode {
    pub fn new(config: Arc<Config>, runner: Runner) -> Self {
        Self {
            config,
            runner,
            masquerade: false,
        }
    }

    /// Forward the public address to the right endpoint while enabled.
    pub fn masquerade(mut self, masquerade: bool) -> Self {
        self.masquerade = masquerade;
        self
    }
}

#[async_trait]
impl Mode for PassthroughMode {
    fn title(&self) -> &str {
        "Passthrough"
    }

    fn attach(&self, host: &mut dyn ModeHost) {
        host.add_tab(self.title(), "Traffic is forwarded without emulation.");
    }

    async fn enable(&mut self) {
        let events = self.runner.events();
        if self.masquerade {
            if let Err(e) = host::add_public_dnat(&self.runner, &self.config).await {
                events.error(&format!("Unable to install iptables rule: {e}"));
            }
        }
        events.info("Passthrough enabled");
    }

    async fn disable(&mut self) {
        let events = self.runner.events();
        if self.masquerade {
            if let Err(e) = host::remove_public_dnat(&self.runner, &self.config).await {
                events.error(&format!("Unable to remove iptables rule: {e}"));
            }
        }
        events.info("Passthrough disabled");
    }
}

#[cfg(test)]
mod tests {
    use tq_common::Level;

    use super::*;
    use crate::{config::tests::config, testing::FakeHost};

    #[tokio::test]
    async fn plain_passthrough_issues_no_commands() {
        let host = FakeHost::new();
        let mut mode = PassthroughMode::new(Arc::new(config()), host.runner());

        mode.enable().await;
        mode.disable().await;

        assert!(host.commands().is_empty());
        assert!(host.events().contains(Level::Info, "Passthrough enabled"));
    }

    #[tokio::test]
    async fn masquerade_forwards_the_public_address() {
        let host = FakeHost::new();
        let mut mode = PassthroughMode::new(Arc::new(config()), host.runner())
            .masquerade(true);

        mode.enable().await;
        assert_eq!(
            host.commands(),
            vec![
                "iptables -t nat -A PREROUTING -i eth0.100 -d 192.0.2.10 -j DNAT --to-destination 10.0.2.2",
                "conntrack -F",
            ]
        );

        host.clear_commands();
        mode.disable().await;
        assert_eq!(
            host.commands(),
            vec![
                "iptables -t nat -D PREROUTING -i eth0.100 -d 192.0.2.10 -j DNAT --to-destination 10.0.2.2"
            ]
        );
    }

    #[tokio::test]
    async fn rule_failure_is_logged() {
        let host = FakeHost::new();
        host.fail_on("iptables");
        let mut mode = PassthroughMode::new(Arc::new(config()), host.runner())
            .masquerade(true);

        mode.enable().await;

        // The flush is skipped once the rule failed.
        assert_eq!(host.commands().len(), 1);
        assert!(host
            .events()
            .contains(Level::Error, "Unable to install iptables rule"));
        assert!(host.events().contains(Level::Info, "Passthrough enabled"));
    }
}
