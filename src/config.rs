use clap::Parser;

/// Node configuration, parsed from CLI flags with environment-variable fallbacks
/// the same way the teacher's relay `Args` does.
#[derive(Parser, Debug, Clone)]
#[command(name = "synapsis-node", about = "Federated social-network node")]
pub struct NodeConfig {
    /// This node's public domain; used in apIds, node envelopes, and outbound URLs.
    #[arg(long, env = "NEXT_PUBLIC_NODE_DOMAIN", default_value = "localhost")]
    pub node_domain: String,

    /// Flips the TOFU remote-identity cache from reject-on-key-change to accept-and-update.
    #[arg(long, env = "ALLOW_KEY_ROTATION", default_value_t = false)]
    pub allow_key_rotation: bool,

    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://synapsis.db")]
    pub database_url: String,

    /// Comma-delimited seed node domains announced to on startup.
    #[arg(long, env = "SEED_NODES", default_value = "")]
    pub seed_nodes: String,

    #[arg(long, env = "HTTP_CLIENT_TIMEOUT_SECS", default_value_t = 5)]
    pub http_client_timeout_secs: u64,

    #[arg(long, env = "PROFILE_REFRESH_TIMEOUT_SECS", default_value_t = 3)]
    pub profile_refresh_timeout_secs: u64,
}

impl NodeConfig {
    pub fn seed_node_list(&self) -> Vec<String> {
        self.seed_nodes
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_node_list_splits_and_trims() {
        let mut cfg = NodeConfig::parse_from(["synapsis-node"]);
        cfg.seed_nodes = " a.example, b.example ,,c.example".to_string();
        assert_eq!(cfg.seed_node_list(), vec!["a.example", "b.example", "c.example"]);
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = NodeConfig::parse_from(["synapsis-node"]);
        assert_eq!(cfg.port, 8080);
        assert!(!cfg.allow_key_rotation);
        assert_eq!(cfg.node_domain, "localhost");
    }
}
