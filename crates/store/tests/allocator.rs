mod common;

use anyhow::Result;
use peering_coordinator_store::models::{self, PeerSelector};
use peering_coordinator_store::resolver::Event;
use peering_coordinator_store::{Store, StoreError};

/// IP assignment walks the subnet's host addresses in order and fails once
/// they are used up.
#[tokio::test]
async fn test_unused_ip() -> Result<()> {
    let store = Store::open_in_memory().await?;
    store.init_schema().await?;
    let mut conn = store.acquire().await?;

    let owner = models::create_owner(&mut conn, "owner1", "Owner 1", "").await?;
    models::create_isd(&mut conn, 1, "Region 1").await?;
    let asys = models::create_asys(&mut conn, "ff00:0:1".parse()?, 1, owner.id, false, "AS 1").await?;
    let client = models::create_peering_client(&mut conn, asys.id, "default").await?;

    // A /30 has exactly two host addresses.
    let vlan = models::create_vlan(&mut conn, "small", "Small", "10.9.0.0/30".parse()?).await?;

    let first = models::create_interface(&mut conn, &client, &vlan, None, 0, 0).await?;
    assert_eq!(first.public_ip.to_string(), "10.9.0.1");

    let second = models::create_interface(&mut conn, &client, &vlan, None, 0, 0).await?;
    assert_eq!(second.public_ip.to_string(), "10.9.0.2");

    match models::unused_ip(&mut conn, &vlan).await {
        Err(StoreError::NoUnusedIps(name)) => assert_eq!(name, "small"),
        other => panic!("expected NoUnusedIps, got {other:?}"),
    }

    Ok(())
}

#[tokio::test]
async fn test_unused_port_range_unset() -> Result<()> {
    let topology = common::topology(0, 0).await?;
    let mut conn = topology.store.acquire().await?;

    let interfaces =
        models::interfaces_of_asys_in_vlan(&mut conn, topology.asys[0].id, topology.vlan[0].id)
            .await?;

    assert!(matches!(
        models::unused_port(&mut conn, &interfaces[0]).await,
        Err(StoreError::NoUnusedPorts(_))
    ));

    Ok(())
}

/// Ports are interface-scoped: interfaces of the same AS on different VLANs
/// hand out the same numbers, links sharing one interface do not.
#[tokio::test]
async fn test_unused_port_scope() -> Result<()> {
    let topology = common::topology(50000, 51000).await?;
    let mut conn = topology.store.acquire().await?;

    let [as0, _, as2, as3, ..] = topology.asys.as_slice() else {
        unreachable!()
    };

    // Mutual core acceptance between AS 0 and AS 2 in both VLANs.
    for vlan in &topology.vlan {
        common::apply_policy(&mut conn, vlan, as0, true, PeerSelector::Asys(as2.asn)).await?;
        common::apply_policy(&mut conn, vlan, as2, true, PeerSelector::Asys(as0.asn)).await?;
    }

    // Both links get the first port of each interface's range: the two
    // interfaces of AS 0 allocate independently.
    for vlan in &topology.vlan {
        let links = models::links_between(&mut conn, vlan.id, as0.id, as2.id).await?;
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].port_a, 50000);
        assert_eq!(links[0].port_b, 50000);
    }

    // A second link on the same interface moves to the next port. AS 3 is
    // not a core AS, so AS 0 gets the A side of a provider link.
    common::apply_policy(&mut conn, &topology.vlan[0], as0, true, PeerSelector::Asys(as3.asn))
        .await?;
    common::apply_policy(&mut conn, &topology.vlan[0], as3, true, PeerSelector::Asys(as0.asn))
        .await?;

    let links = models::links_between(&mut conn, topology.vlan[0].id, as0.id, as3.id).await?;
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].port_a, 50001);
    assert_eq!(links[0].port_b, 50000);

    Ok(())
}

/// Port exhaustion skips the interface pair and reports the failure to the
/// AS owning the exhausted interface.
#[tokio::test]
async fn test_port_exhaustion() -> Result<()> {
    let store = Store::open_in_memory().await?;
    store.init_schema().await?;
    let mut conn = store.acquire().await?;

    let owner = models::create_owner(&mut conn, "owner1", "Owner 1", "").await?;
    models::create_isd(&mut conn, 1, "Region 1").await?;
    let vlan = models::create_vlan(&mut conn, "prod", "Production", "10.0.0.0/16".parse()?).await?;

    let mut ases = Vec::new();
    let mut clients = Vec::new();
    for i in 1..=3u64 {
        let asys = models::create_asys(
            &mut conn,
            peering_coordinator_store::Asn::new(0xff00_0000_0000 | i)?,
            1,
            owner.id,
            false,
            &format!("AS {i}"),
        )
        .await?;
        clients.push(models::create_peering_client(&mut conn, asys.id, "default").await?);
        ases.push(asys);
    }

    // AS 1's interface has room for exactly one port.
    models::create_interface(&mut conn, &clients[0], &vlan, None, 50000, 50001).await?;
    models::create_interface(&mut conn, &clients[1], &vlan, None, 50000, 51000).await?;
    models::create_interface(&mut conn, &clients[2], &vlan, None, 50000, 51000).await?;

    common::apply_policy(&mut conn, &vlan, &ases[1], true, PeerSelector::Asys(ases[0].asn))
        .await?;
    common::apply_policy(&mut conn, &vlan, &ases[2], true, PeerSelector::Asys(ases[0].asn))
        .await?;

    let events =
        common::apply_policy(&mut conn, &vlan, &ases[0], true, PeerSelector::Asys(ases[1].asn))
            .await?;
    assert_eq!(models::link_count(&mut conn).await?, 1);
    assert_eq!(events.len(), 2);

    // The second peer no longer fits into AS 1's port range.
    let events =
        common::apply_policy(&mut conn, &vlan, &ases[0], true, PeerSelector::Asys(ases[2].asn))
            .await?;
    assert_eq!(models::link_count(&mut conn).await?, 1);
    assert_eq!(
        events,
        vec![Event::CreationFailed {
            asn: ases[0].asn,
            message: "Allocated port range is exhausted on interface 10.0.0.1.".to_string(),
        }]
    );

    Ok(())
}
