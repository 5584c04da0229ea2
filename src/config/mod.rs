pub mod schema;

#[allow(unused_imports)]
pub use schema::{
    AgentBackend, ChannelKind, Config, GatewayConfig, InstanceConfig, TracingConfig,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_constructible() {
        let config = Config::default();
        assert!(config.tracing.enabled);
        assert_eq!(config.gateway.port, 8882);
        assert!(config.instances.is_empty());
    }

    #[test]
    fn instance_configs_are_constructible() {
        let wa = InstanceConfig {
            name: "flash-v2".into(),
            channel_type: ChannelKind::Whatsapp,
            evolution_url: Some("http://localhost:8080".into()),
            evolution_key: Some("key".into()),
            whatsapp_instance: Some("flash-v2".into()),
            agent: AgentBackend::Automagik {
                api_url: "http://localhost:8000".into(),
                api_key: "agent-key".into(),
                agent_id: "default".into(),
                timeout_secs: 60,
            },
            ..InstanceConfig::default()
        };

        assert_eq!(wa.agent.timeout().as_secs(), 60);
        assert!(!wa.agent.supports_streaming());
        assert_eq!(wa.default_country_code, "55");
        assert!(wa.enable_auto_split);
    }
}
