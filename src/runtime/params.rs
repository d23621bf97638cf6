//! Translation of desired container parameters into Docker create options.

use std::collections::HashMap;
use std::net::IpAddr;

use bollard::container::Config;
use bollard::models::{
    DeviceMapping, HostConfig, PortBinding, PortMap, RestartPolicy, RestartPolicyNameEnum,
};
use serde_json::Value;

use crate::models::ContainerParameters;

/// Build the container config for `params`, with an always-restart policy.
pub fn container_config(params: &ContainerParameters) -> Config<String> {
    let (port_bindings, exposed_ports) = port_bindings(params.ports.as_ref());
    let binds = binds(params.volumes.as_ref());

    let host_config = HostConfig {
        network_mode: params.network_mode.clone(),
        cpu_period: params.cpu_period,
        cpu_quota: params.cpu_quota,
        nano_cpus: params.nano_cpus,
        devices: params
            .devices
            .as_ref()
            .map(|devices| devices.iter().map(String::as_str).map(device_mapping).collect()),
        tmpfs: params.tmpfs.clone(),
        binds: (!binds.is_empty()).then_some(binds),
        port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
        privileged: params.privileged,
        cap_add: params.cap_add.clone(),
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::ALWAYS),
            maximum_retry_count: None,
        }),
        ..Default::default()
    };

    Config {
        image: Some(params.image.clone()),
        env: (!params.environment.is_empty()).then(|| params.environment.clone()),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    }
}

/// Parse `host[:container[:perms]]`.
fn device_mapping(spec: &str) -> DeviceMapping {
    let mut parts = spec.splitn(3, ':');
    let host = parts.next().unwrap_or_default().to_string();
    let container = parts
        .next()
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| host.clone());
    let perms = parts
        .next()
        .filter(|p| !p.is_empty())
        .unwrap_or("rwm")
        .to_string();

    DeviceMapping {
        path_on_host: Some(host),
        path_in_container: Some(container),
        cgroup_permissions: Some(perms),
    }
}

/// Volumes come either as bind strings or as `host -> {"bind", "mode"}`.
fn binds(volumes: Option<&Value>) -> Vec<String> {
    match volumes {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::Object(map)) => map
            .iter()
            .filter_map(|(host, target)| match target {
                Value::String(bind) => Some(format!("{host}:{bind}:rw")),
                Value::Object(opts) => {
                    let bind = opts.get("bind")?.as_str()?;
                    let mode = opts.get("mode").and_then(Value::as_str).unwrap_or("rw");
                    Some(format!("{host}:{bind}:{mode}"))
                }
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

type ExposedPorts = HashMap<String, HashMap<(), ()>>;

/// Ports map `"<port>[/<proto>]"` to null, a host port, an `[ip, port]` pair,
/// or a list of those.
fn port_bindings(ports: Option<&Value>) -> (PortMap, ExposedPorts) {
    let mut bindings = PortMap::new();
    let mut exposed = ExposedPorts::new();

    let Some(Value::Object(map)) = ports else {
        return (bindings, exposed);
    };

    for (container_port, host) in map {
        let key = if container_port.contains('/') {
            container_port.clone()
        } else {
            format!("{container_port}/tcp")
        };

        let host_bindings: Vec<PortBinding> = match host {
            Value::Null => Vec::new(),
            Value::Array(items) if is_ip_port_pair(items) => {
                port_binding(host).into_iter().collect()
            }
            Value::Array(items) => items.iter().filter_map(port_binding).collect(),
            other => port_binding(other).into_iter().collect(),
        };

        exposed.insert(key.clone(), HashMap::new());
        bindings.insert(
            key,
            (!host_bindings.is_empty()).then_some(host_bindings),
        );
    }

    (bindings, exposed)
}

fn is_ip_port_pair(items: &[Value]) -> bool {
    matches!(items, [Value::String(ip), _] if ip.parse::<IpAddr>().is_ok())
}

fn port_binding(host: &Value) -> Option<PortBinding> {
    match host {
        Value::Number(port) => Some(PortBinding {
            host_ip: None,
            host_port: Some(port.to_string()),
        }),
        Value::String(port) => Some(PortBinding {
            host_ip: None,
            host_port: Some(port.clone()),
        }),
        Value::Array(pair) => match pair.as_slice() {
            [Value::String(ip), port] => Some(PortBinding {
                host_ip: Some(ip.clone()),
                host_port: Some(match port {
                    Value::String(p) => p.clone(),
                    other => other.to_string(),
                }),
            }),
            _ => None,
        },
        _ => None,
    }
}
