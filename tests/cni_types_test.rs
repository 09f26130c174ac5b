use std::collections::HashMap;

use sknf::config::NetConf;
use sknf::error::CniError;
use sknf::types::{CmdArgs, IPConfig, Interface, Result as CniResult, Route, VersionResult};

#[test]
fn test_net_conf_parsing() -> Result<(), Box<dyn std::error::Error>> {
    let json = r#"{
        "cniVersion": "1.0.0",
        "name": "sknf-net",
        "type": "sknf",
        "subnet": "10.1.0.0/24",
        "clusterCidr": "10.0.0.0/16",
        "hostPhysicalInterface": "ens3",
        "bridge": "br0",
        "vxlan": {"name": "vx0", "vni": 42},
        "ledger": {"path": "/run/sknf/ips", "lock": true},
        "brNetfilter": true
    }"#;

    let conf = NetConf::parse(json.as_bytes())?;
    assert_eq!(conf.host_physical_interface, "ens3");
    assert_eq!(conf.bridge, "br0");
    assert_eq!(conf.vxlan.name, "vx0");
    assert_eq!(conf.vxlan.vni, 42);
    assert_eq!(conf.vxlan.port, 4789);
    assert!(conf.ledger.lock);
    assert!(conf.br_netfilter);
    assert_eq!(conf.cluster_subnet()?.to_string(), "10.0.0.0/16");

    Ok(())
}

#[test]
fn test_net_conf_missing_field() {
    let json = r#"{"cniVersion": "1.0.0", "name": "x", "type": "sknf", "subnet": "10.1.0.0/24"}"#;
    let err = NetConf::parse(json.as_bytes()).unwrap_err();
    assert!(matches!(err, CniError::InvalidConfig(_)));
    assert_eq!(err.code(), 7);
}

#[test]
fn test_net_conf_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let conf = NetConf::new_default("sknf-net", "10.1.0.0/24", "10.0.0.0/16", "eth0");
    let bytes = serde_json::to_vec(&conf)?;
    let parsed = NetConf::parse(&bytes)?;

    assert_eq!(parsed.subnet, conf.subnet);
    assert_eq!(parsed.cluster_cidr, conf.cluster_cidr);
    assert_eq!(parsed.plugin_type, "sknf");

    Ok(())
}

#[test]
fn test_cmd_args_creation() -> Result<(), Box<dyn std::error::Error>> {
    let conf = NetConf::new_default("sknf-net", "10.1.0.0/24", "10.0.0.0/16", "eth0");

    let args = CmdArgs {
        container_id: "test-container".to_string(),
        netns: "/var/run/netns/test".to_string(),
        ifname: "eth1".to_string(),
        args: HashMap::new(),
        stdin_data: serde_json::to_vec(&conf)?,
    };

    assert_eq!(NetConf::parse(&args.stdin_data)?.name, "sknf-net");
    assert!(args.args.is_empty());

    Ok(())
}

#[test]
fn test_add_result_serialization() -> Result<(), Box<dyn std::error::Error>> {
    let mut result = CniResult::new("1.0.0");
    let index = result.add_interface(Interface {
        name: "eth0".to_string(),
        mac: None,
        sandbox: Some("/var/run/netns/ctn1".to_string()),
    });
    result.add_ip(IPConfig {
        version: Some("4".to_string()),
        interface: Some(index),
        address: "10.1.0.2/16".to_string(),
        gateway: Some("10.1.0.1".to_string()),
    });
    result.add_route(Route {
        dst: "0.0.0.0/0".to_string(),
        gw: Some("10.1.0.1".to_string()),
    });

    let mut out = Vec::new();
    result.write_to(&mut out)?;
    let value: serde_json::Value = serde_json::from_slice(&out)?;

    assert_eq!(value["cniVersion"], "1.0.0");
    assert_eq!(value["interfaces"][0]["name"], "eth0");
    assert!(value["interfaces"][0].get("mac").is_none());
    assert_eq!(value["ips"][0]["address"], "10.1.0.2/16");
    assert_eq!(value["ips"][0]["interface"], 0);
    assert_eq!(value["routes"][0]["gw"], "10.1.0.1");

    Ok(())
}

#[test]
fn test_empty_result_omits_sections() -> Result<(), Box<dyn std::error::Error>> {
    let mut out = Vec::new();
    CniResult::new("1.0.0").write_to(&mut out)?;
    assert_eq!(String::from_utf8(out)?.trim_end(), r#"{"cniVersion":"1.0.0"}"#);

    Ok(())
}

#[test]
fn test_error_response_wire_format() -> Result<(), Box<dyn std::error::Error>> {
    let err = CniError::MissingEnvironment("CNI_NETNS".to_string());
    let json = serde_json::to_value(err.to_response("1.0.0"))?;

    assert_eq!(json["cniVersion"], "1.0.0");
    assert_eq!(json["code"], 4);
    assert_eq!(json["msg"], "Missing CNI environment variable");
    assert_eq!(json["details"], "CNI_NETNS");

    Ok(())
}

#[test]
fn test_version_result() -> Result<(), Box<dyn std::error::Error>> {
    let mut out = Vec::new();
    VersionResult::new("1.0.0", &["1.0.0"]).write_to(&mut out)?;
    let value: serde_json::Value = serde_json::from_slice(&out)?;
    assert_eq!(value["supportedVersions"], serde_json::json!(["1.0.0"]));

    Ok(())
}
