//! UDP port hopping via netfilter REDIRECT rules
//!
//! Clients spread traffic over a range of UDP ports; the node redirects the
//! whole range to the proxy's listen port. Rules are rebuilt from scratch on
//! every run so repeated setups never stack duplicates.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use pf_core::types::{Node, PortRange, SyncOutcome};

use crate::batch::run_batched;

use super::SyncOrchestrator;

const FAMILIES: [&str; 2] = ["iptables", "ip6tables"];

/// Delete every UDP REDIRECT rule in `nat PREROUTING`, interface-bound ones included
pub fn clear_rules_command(bin: &str) -> String {
    format!(
        "{bin} -t nat -S PREROUTING | grep -E -- '-p udp.*-j REDIRECT' | sed 's/^-A /-D /' \
         | while read -r rule; do {bin} -t nat $rule; done",
        bin = bin
    )
}

/// Redirect `range` to `listen_port`
pub fn add_rule_command(bin: &str, range: PortRange, listen_port: u16) -> String {
    format!(
        "{} -t nat -A PREROUTING -p udp --dport {} -j REDIRECT --to-ports {}",
        bin,
        range.to_dport(),
        listen_port
    )
}

/// Save the active rule set so it survives a reboot
pub fn persist_rules_command() -> &'static str {
    "netfilter-persistent save 2>/dev/null || { mkdir -p /etc/iptables \
     && iptables-save > /etc/iptables/rules.v4 \
     && ip6tables-save > /etc/iptables/rules.v6; }"
}

impl SyncOrchestrator {
    /// Install port hopping rules on one node.
    ///
    /// A node without a range is left alone. IPv6 failures are logged but do
    /// not fail the setup; hosts without an IPv6 nat table are common.
    pub async fn setup_port_hopping(&self, node: &Node) -> SyncOutcome {
        let mut outcome = SyncOutcome::new(node.id.clone());

        let range = match node.settings.port_hopping {
            Some(range) => range,
            None => {
                tracing::debug!("Node {} has no port hopping range", node.id);
                outcome.log("no port hopping range configured");
                return outcome.succeed(node.status);
            }
        };
        if !range.is_valid() {
            return outcome.fail(
                node.status,
                format!("invalid port hopping range {}", range.to_dport()),
            );
        }

        match self.apply_rules(node, range, &mut outcome).await {
            Ok(()) => {
                tracing::info!(
                    "Port hopping {} -> {} enabled on {}",
                    range.to_dport(),
                    node.settings.listen_port,
                    node.id
                );
                outcome.succeed(node.status)
            }
            Err(e) => {
                tracing::warn!("Port hopping setup on {} failed: {}", node.id, e);
                outcome.fail(node.status, e)
            }
        }
    }

    async fn apply_rules(
        &self,
        node: &Node,
        range: PortRange,
        outcome: &mut SyncOutcome,
    ) -> Result<(), String> {
        let timeout = self.command_timeout();

        for bin in FAMILIES {
            let cleared = self
                .pool()
                .exec(node, &clear_rules_command(bin), timeout)
                .await
                .map_err(|e| e.to_string())?;
            if !cleared.success() {
                outcome.log(format!("{}: clearing old rules: {}", bin, cleared.diagnostic()));
            }

            let added = self
                .pool()
                .exec(
                    node,
                    &add_rule_command(bin, range, node.settings.listen_port),
                    timeout,
                )
                .await
                .map_err(|e| e.to_string())?;
            match (added.success(), bin) {
                (true, _) => outcome.log(format!("{}: redirect {} installed", bin, range.to_dport())),
                (false, "iptables") => {
                    return Err(format!("iptables rejected rule: {}", added.diagnostic()))
                }
                (false, _) => {
                    tracing::warn!("{} on {}: {}", bin, node.id, added.diagnostic());
                    outcome.log(format!("{}: skipped: {}", bin, added.diagnostic()));
                }
            }
        }

        let saved = self
            .pool()
            .exec(node, persist_rules_command(), timeout)
            .await
            .map_err(|e| e.to_string())?;
        if !saved.success() {
            return Err(format!("rules active but not persisted: {}", saved.diagnostic()));
        }
        outcome.log("rules persisted");
        Ok(())
    }

    /// Install port hopping rules on every active node, `batch_size` at a time
    pub async fn setup_port_hopping_all(
        self: &Arc<Self>,
        nodes: Vec<Node>,
        cancel: &CancellationToken,
    ) -> Vec<SyncOutcome> {
        let active: Vec<Node> = nodes.into_iter().filter(|n| n.active).collect();
        let report = run_batched(active, self.config().batch_size, cancel, |node| {
            let this = Arc::clone(self);
            async move { this.setup_port_hopping(&node).await }
        })
        .await;
        report.completed
    }
}
