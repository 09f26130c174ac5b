mod common;

use std::net::Ipv4Addr;

use common::{netns_placeholder, DeviceKind, FakeKernel};
use sknf::cidr::Cidr;
use sknf::naming::DeviceNames;
use sknf::topology::{ContainerAttachment, TopologyBuilder, VxlanSpec, DEFAULT_BRIDGE_NAME};

fn attachment(netns: &std::path::Path, container_id: &str) -> ContainerAttachment {
    ContainerAttachment {
        netns: netns.display().to_string(),
        ifname: "eth0".to_string(),
        container_id: container_id.to_string(),
        container_cidr: Cidr::parse("10.1.0.2/16").unwrap(),
        bridge_cidr: Cidr::parse("10.1.0.1/16").unwrap(),
        uplink: "eth0".to_string(),
    }
}

#[tokio::test]
async fn test_ensure_bridge_twice_is_noop() -> Result<(), Box<dyn std::error::Error>> {
    let kernel = FakeKernel::with_uplink("eth0");
    let topology = TopologyBuilder::new(&kernel, DEFAULT_BRIDGE_NAME, VxlanSpec::default());
    let bridge_cidr = Cidr::parse("10.1.0.1/16")?;

    topology.ensure_bridge(&bridge_cidr).await?;
    topology.ensure_bridge(&bridge_cidr).await?;

    assert_eq!(kernel.count_kind(|k| *k == DeviceKind::Bridge), 1);
    assert_eq!(kernel.count_requests("create_bridge"), 1);

    let bridge = kernel.host_device("brsknf").unwrap();
    assert!(bridge.up);
    assert_eq!(bridge.addresses, vec![bridge_cidr]);

    Ok(())
}

#[tokio::test]
async fn test_vxlan_binds_to_uplink() -> Result<(), Box<dyn std::error::Error>> {
    let kernel = FakeKernel::with_uplink("ens3");
    let topology = TopologyBuilder::new(&kernel, DEFAULT_BRIDGE_NAME, VxlanSpec::default());

    topology.ensure_vxlan("ens3").await?;
    topology.ensure_vxlan("ens3").await?;

    let uplink = kernel.host_device("ens3").unwrap();
    let vxlan = kernel.host_device("vxsknf").unwrap();
    assert!(vxlan.up);
    match vxlan.kind {
        DeviceKind::Vxlan { spec, uplink: index } => {
            assert_eq!(spec.vni, 100);
            assert_eq!(spec.group, Ipv4Addr::new(239, 1, 1, 100));
            assert_eq!(spec.port, 4789);
            assert_eq!(index, uplink.index);
        }
        other => panic!("unexpected kind {:?}", other),
    }
    assert_eq!(kernel.count_requests("create_vxlan"), 1);

    Ok(())
}

#[tokio::test]
async fn test_vxlan_without_uplink_fails() -> Result<(), Box<dyn std::error::Error>> {
    let kernel = FakeKernel::with_uplink("eth0");
    let topology = TopologyBuilder::new(&kernel, DEFAULT_BRIDGE_NAME, VxlanSpec::default());

    let err = topology.ensure_vxlan("eth9").await.unwrap_err();
    assert!(err.is_not_found());
    assert!(err.details().contains("eth9"));

    Ok(())
}

#[tokio::test]
async fn test_attach_wires_container() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let netns = netns_placeholder(dir.path(), "ctn1");
    let kernel = FakeKernel::with_uplink("eth0");
    let topology = TopologyBuilder::new(&kernel, DEFAULT_BRIDGE_NAME, VxlanSpec::default());

    let att = attachment(&netns, "abc123");
    let names = topology.attach_container(&att).await?;
    assert_eq!(names, DeviceNames::derive(&att.netns, "eth0", "abc123"));

    let bridge = kernel.host_device("brsknf").unwrap();
    let host_veth = kernel.host_device(&names.host).unwrap();
    assert!(host_veth.up);
    assert_eq!(host_veth.master, Some(bridge.index));
    assert_eq!(kernel.host_device("vxsknf").unwrap().master, Some(bridge.index));

    // the transient name is gone from the host
    assert!(kernel.host_device(&names.transient).is_none());

    let inside = kernel.device_in(&netns, "eth0").unwrap();
    assert!(inside.up);
    assert_eq!(inside.addresses, vec![att.container_cidr]);
    assert_eq!(inside.default_gateway, Some(Ipv4Addr::new(10, 1, 0, 1)));

    Ok(())
}

#[tokio::test]
async fn test_attach_order() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let netns = netns_placeholder(dir.path(), "ctn1");
    let kernel = FakeKernel::with_uplink("eth0");
    let topology = TopologyBuilder::new(&kernel, DEFAULT_BRIDGE_NAME, VxlanSpec::default());

    topology.attach_container(&attachment(&netns, "abc123")).await?;

    let requests = kernel.requests();
    let pos = |op: &str| requests.iter().position(|r| r == op).unwrap();
    assert!(pos("create_bridge") < pos("create_vxlan"));
    assert!(pos("create_vxlan") < pos("create_veth"));
    assert!(pos("create_veth") < pos("move_into_namespace"));
    assert!(pos("move_into_namespace") < pos("configure_in_namespace"));
    assert!(pos("configure_in_namespace") < pos("set_master"));

    Ok(())
}

#[tokio::test]
async fn test_second_container_reuses_shared_devices() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let kernel = FakeKernel::with_uplink("eth0");
    let topology = TopologyBuilder::new(&kernel, DEFAULT_BRIDGE_NAME, VxlanSpec::default());

    topology
        .attach_container(&attachment(&netns_placeholder(dir.path(), "ctn1"), "abc123"))
        .await?;
    topology
        .attach_container(&attachment(&netns_placeholder(dir.path(), "ctn2"), "def456"))
        .await?;

    assert_eq!(kernel.count_kind(|k| *k == DeviceKind::Bridge), 1);
    assert_eq!(kernel.count_kind(|k| matches!(k, DeviceKind::Vxlan { .. })), 1);
    assert_eq!(kernel.count_kind(|k| matches!(k, DeviceKind::Veth { .. })), 4);
    // vxlan enslaved once, plus one host veth per container
    assert_eq!(kernel.count_requests("set_master"), 3);

    Ok(())
}

#[tokio::test]
async fn test_failed_step_leaves_residue() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let netns = netns_placeholder(dir.path(), "ctn1");
    let kernel = FakeKernel::with_uplink("eth0");
    kernel.fail_on("configure_in_namespace");
    let topology = TopologyBuilder::new(&kernel, DEFAULT_BRIDGE_NAME, VxlanSpec::default());

    let att = attachment(&netns, "abc123");
    let err = topology.attach_container(&att).await.unwrap_err();
    assert_eq!(err.code(), 100);

    // nothing is rolled back, and nothing after the failure ran
    let names = att.device_names();
    assert!(kernel.host_device("brsknf").is_some());
    assert!(kernel.host_device(&names.host).is_some());
    assert_eq!(kernel.count_requests("set_master"), 0);

    // detach cleans the half-built pair
    topology.detach_container(&att.netns, "eth0", "abc123").await?;
    assert!(kernel.host_device(&names.host).is_none());
    assert!(kernel.device_in(&netns, "eth0").is_none());

    Ok(())
}

#[tokio::test]
async fn test_detach_twice_reports_missing_device() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let netns = netns_placeholder(dir.path(), "ctn1");
    let kernel = FakeKernel::with_uplink("eth0");
    let topology = TopologyBuilder::new(&kernel, DEFAULT_BRIDGE_NAME, VxlanSpec::default());

    let att = attachment(&netns, "abc123");
    topology.attach_container(&att).await?;

    topology.detach_container(&att.netns, "eth0", "abc123").await?;
    assert!(kernel.device_in(&netns, "eth0").is_none());
    assert!(kernel.host_device("brsknf").is_some());
    assert!(kernel.host_device("vxsknf").is_some());

    let err = topology
        .detach_container(&att.netns, "eth0", "abc123")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.code(), 100);

    Ok(())
}

#[tokio::test]
async fn test_missing_namespace_fails_before_any_request() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let kernel = FakeKernel::with_uplink("eth0");
    let topology = TopologyBuilder::new(&kernel, DEFAULT_BRIDGE_NAME, VxlanSpec::default());

    let att = attachment(&dir.path().join("gone"), "abc123");
    let err = topology.attach_container(&att).await.unwrap_err();
    assert_eq!(err.code(), 5);
    assert!(kernel.requests().is_empty());

    Ok(())
}
