//! Compose v3.8 manifest rendering for stack mode

use std::collections::BTreeMap;

use serde::Serialize;

use super::DeploymentSpec;

const COMPOSE_VERSION: &str = "3.8";

#[derive(Debug, Serialize)]
struct ComposeFile<'a> {
    version: &'static str,
    services: BTreeMap<&'a str, ComposeService<'a>>,
    secrets: BTreeMap<&'a str, ComposeSecret<'a>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    networks: BTreeMap<&'a str, ComposeNetwork>,
}

#[derive(Debug, Serialize)]
struct ComposeService<'a> {
    image: &'a str,
    command: &'a [String],
    secrets: Vec<SecretRef<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    networks: Vec<&'a str>,
    deploy: ComposeDeploy,
}

#[derive(Debug, Serialize)]
struct SecretRef<'a> {
    source: &'a str,
    target: &'a str,
}

#[derive(Debug, Serialize)]
struct ComposeDeploy {
    replicas: u64,
    restart_policy: RestartPolicy,
}

#[derive(Debug, Serialize)]
struct RestartPolicy {
    condition: &'static str,
}

#[derive(Debug, Serialize)]
struct ComposeSecret<'a> {
    /// Fixed name, so the secret is not prefixed with the stack name
    name: &'a str,
    driver: &'a str,
    labels: &'a BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct ComposeNetwork {
    driver: &'static str,
}

/// Render the stack manifest for `spec`
pub fn render_manifest(spec: &DeploymentSpec) -> Result<String, serde_yaml::Error> {
    let networks: Vec<&str> = spec.network.as_deref().into_iter().collect();

    let service = ComposeService {
        image: &spec.image,
        command: &spec.command,
        secrets: vec![SecretRef { source: &spec.secret_name, target: &spec.secret_name }],
        networks: networks.clone(),
        deploy: ComposeDeploy {
            replicas: spec.replicas,
            restart_policy: RestartPolicy { condition: "any" },
        },
    };

    let secret =
        ComposeSecret { name: &spec.secret_name, driver: &spec.driver, labels: &spec.labels };

    let file = ComposeFile {
        version: COMPOSE_VERSION,
        services: BTreeMap::from([(spec.service.as_str(), service)]),
        secrets: BTreeMap::from([(spec.secret_name.as_str(), secret)]),
        networks: networks
            .into_iter()
            .map(|n| (n, ComposeNetwork { driver: "overlay" }))
            .collect(),
    };

    serde_yaml::to_string(&file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, ScenarioConfig};
    use crate::deploy::DeploymentMode;
    use serde_yaml::Value;

    fn rendered(spec: &DeploymentSpec) -> Value {
        serde_yaml::from_str(&render_manifest(spec).unwrap()).unwrap()
    }

    #[test]
    fn test_manifest_declares_driver_backed_secret() {
        let config = ScenarioConfig::for_backend(BackendKind::OpenBao);
        let doc = rendered(&config.deployment);

        assert_eq!(doc["version"], Value::from("3.8"));
        let secret = &doc["secrets"]["smoke_secret_openbao"];
        assert_eq!(secret["name"], Value::from("smoke_secret_openbao"));
        assert_eq!(secret["driver"], Value::from("swarm-secrets-driver:openbao-smoke"));
        assert_eq!(secret["labels"]["vault_path"], Value::from("smoke_service/smoke"));
        assert_eq!(secret["labels"]["vault_field"], Value::from("password"));
    }

    #[test]
    fn test_manifest_service_mounts_secret() {
        let config = ScenarioConfig::for_backend(BackendKind::OpenBao);
        let doc = rendered(&config.deployment);

        let service = &doc["services"]["consumer"];
        assert_eq!(service["image"], Value::from("busybox:latest"));
        assert_eq!(service["secrets"][0]["source"], Value::from("smoke_secret_openbao"));
        assert_eq!(service["secrets"][0]["target"], Value::from("smoke_secret_openbao"));
        assert_eq!(service["deploy"]["replicas"].as_u64(), Some(1));
        assert_eq!(service["deploy"]["restart_policy"]["condition"], Value::from("any"));
        assert!(doc.get("networks").is_none());
    }

    #[test]
    fn test_manifest_with_network() {
        let mut config =
            ScenarioConfig::for_backend_with_mode(BackendKind::Vault, DeploymentMode::Stack);
        config.deployment.network = Some("smoke-net".to_string());
        let doc = rendered(&config.deployment);

        assert_eq!(doc["networks"]["smoke-net"]["driver"], Value::from("overlay"));
        assert_eq!(doc["services"]["consumer"]["networks"][0], Value::from("smoke-net"));
    }
}
