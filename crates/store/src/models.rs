//! Entities of the peering coordinator and the queries operating on them.
//!
//! Owners, ISDs, ASes, VLANs, peering clients and interfaces are provisioned
//! administratively. Policies are written by the primary peering client of
//! their AS. The accepted-peer and link relations are derived and only ever
//! touched by the resolver.

use std::net::IpAddr;

use ahash::HashSet;
use ipnet::IpNet;
use rand::Rng;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use crate::asn::Asn;
use crate::error::{Result, StoreError};

/// An entity owning SCION ASes.
#[derive(Debug, Clone)]
pub struct Owner {
    pub id: i64,
    pub name: String,
    pub long_name: String,
    pub contact: String,
}

/// A SCION isolation domain.
#[derive(Debug, Clone)]
pub struct Isd {
    pub isd_id: u16,
    pub name: String,
}

/// A SCION AS.
#[derive(Debug, Clone)]
pub struct Asys {
    pub id: i64,
    pub asn: Asn,
    pub isd_id: u16,
    pub owner_id: i64,
    pub is_core: bool,
    pub name: String,
}

impl Asys {
    /// Short `<isd>-<asn>` form used in log and error messages.
    pub fn label(&self) -> String {
        format!("{}-{}", self.isd_id, self.asn)
    }
}

/// A peering LAN. Every VLAN has its own members, policies and links.
#[derive(Debug, Clone)]
pub struct Vlan {
    pub id: i64,
    pub name: String,
    pub long_name: String,
    pub ip_network: IpNet,
}

/// An agent speaking for an AS, typically deployed next to a border router.
#[derive(Debug, Clone)]
pub struct PeeringClient {
    pub id: i64,
    pub asys_id: i64,
    pub name: String,
    pub secret_token: String,
}

/// Connection of a peering client to a VLAN.
///
/// The port range `[first_port, last_port)` bounds the UDP ports links may
/// use on this interface; 0 in either field means the range has not been
/// configured yet.
#[derive(Debug, Clone)]
pub struct Interface {
    pub id: i64,
    pub peering_client_id: i64,
    pub vlan_id: i64,
    pub public_ip: IpAddr,
    pub first_port: u16,
    pub last_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Core = 0,
    Peering = 1,
    Provider = 2,
}

impl LinkType {
    fn from_i64(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Self::Core),
            1 => Ok(Self::Peering),
            2 => Ok(Self::Provider),
            _ => Err(StoreError::Validation(format!("invalid link type {value}"))),
        }
    }
}

/// A link row joined with both interfaces and their owning ASes.
#[derive(Debug, Clone)]
pub struct LinkDetail {
    pub id: i64,
    pub link_type: LinkType,
    pub interface_a: i64,
    pub asn_a: Asn,
    pub ip_a: IpAddr,
    pub port_a: u16,
    pub interface_b: i64,
    pub asn_b: Asn,
    pub ip_b: IpAddr,
    pub port_b: u16,
}

/// Target of a peering policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerSelector {
    Everyone,
    Asys(Asn),
    Owner(String),
    Isd(u16),
}

/// One peering policy, in the tagged form shared with the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    pub vlan: String,
    pub asn: Asn,
    pub accept: bool,
    pub peer: PeerSelector,
}

fn read_owner(row: &SqliteRow) -> Owner {
    Owner {
        id: row.get("id"),
        name: row.get("name"),
        long_name: row.get("long_name"),
        contact: row.get("contact"),
    }
}

fn read_asys(row: &SqliteRow) -> Result<Asys> {
    Ok(Asys {
        id: row.get("id"),
        asn: Asn::new(row.get::<i64, _>("asn") as u64)?,
        isd_id: row.get::<i64, _>("isd_id") as u16,
        owner_id: row.get("owner_id"),
        is_core: row.get("is_core"),
        name: row.get("name"),
    })
}

fn read_vlan(row: &SqliteRow) -> Result<Vlan> {
    Ok(Vlan {
        id: row.get("id"),
        name: row.get("name"),
        long_name: row.get("long_name"),
        ip_network: row
            .get::<String, _>("ip_network")
            .parse()
            .map_err(|_| StoreError::Validation("invalid IP network in store".to_string()))?,
    })
}

fn read_interface(row: &SqliteRow) -> Result<Interface> {
    Ok(Interface {
        id: row.get("id"),
        peering_client_id: row.get("peering_client_id"),
        vlan_id: row.get("vlan_id"),
        public_ip: parse_ip(&row.get::<String, _>("public_ip"))?,
        first_port: row.get::<i64, _>("first_port") as u16,
        last_port: row.get::<i64, _>("last_port") as u16,
    })
}

fn read_link_detail(row: &SqliteRow) -> Result<LinkDetail> {
    Ok(LinkDetail {
        id: row.get("id"),
        link_type: LinkType::from_i64(row.get("link_type"))?,
        interface_a: row.get("interface_a"),
        asn_a: Asn::new(row.get::<i64, _>("asn_a") as u64)?,
        ip_a: parse_ip(&row.get::<String, _>("ip_a"))?,
        port_a: row.get::<i64, _>("port_a") as u16,
        interface_b: row.get("interface_b"),
        asn_b: Asn::new(row.get::<i64, _>("asn_b") as u64)?,
        ip_b: parse_ip(&row.get::<String, _>("ip_b"))?,
        port_b: row.get::<i64, _>("port_b") as u16,
    })
}

fn parse_ip(value: &str) -> Result<IpAddr> {
    value
        .parse()
        .map_err(|_| StoreError::Validation("invalid IP address in store".to_string()))
}

/// Generate a random API token. A blank token disables API access.
pub fn gen_secret_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);

    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

//
// Provisioning. Owners, ISDs, ASes, VLANs, clients and interfaces are
// managed administratively, not through the peering API; deployments and
// tests seed through these functions.
//

pub async fn create_owner(
    conn: &mut SqliteConnection,
    name: &str,
    long_name: &str,
    contact: &str,
) -> Result<Owner> {
    let result = sqlx::query("INSERT INTO owner (name, long_name, contact) VALUES (?, ?, ?)")
        .bind(name)
        .bind(long_name)
        .bind(contact)
        .execute(&mut *conn)
        .await
        .map_err(|e| StoreError::on_insert(e, "owner"))?;

    Ok(Owner {
        id: result.last_insert_rowid(),
        name: name.to_string(),
        long_name: long_name.to_string(),
        contact: contact.to_string(),
    })
}

pub async fn create_isd(conn: &mut SqliteConnection, isd_id: u16, name: &str) -> Result<Isd> {
    if isd_id == 0 {
        return Err(StoreError::Validation("ISD id must be positive".to_string()));
    }

    sqlx::query("INSERT INTO isd (isd_id, name) VALUES (?, ?)")
        .bind(isd_id as i64)
        .bind(name)
        .execute(&mut *conn)
        .await
        .map_err(|e| StoreError::on_insert(e, "ISD"))?;

    Ok(Isd {
        isd_id,
        name: name.to_string(),
    })
}

pub async fn create_asys(
    conn: &mut SqliteConnection,
    asn: Asn,
    isd_id: u16,
    owner_id: i64,
    is_core: bool,
    name: &str,
) -> Result<Asys> {
    let result = sqlx::query(
        "INSERT INTO asys (asn, isd_id, owner_id, is_core, name) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(asn.as_u64() as i64)
    .bind(isd_id as i64)
    .bind(owner_id)
    .bind(is_core)
    .bind(name)
    .execute(&mut *conn)
    .await
    .map_err(|e| StoreError::on_insert(e, "AS"))?;

    Ok(Asys {
        id: result.last_insert_rowid(),
        asn,
        isd_id,
        owner_id,
        is_core,
        name: name.to_string(),
    })
}

pub async fn create_vlan(
    conn: &mut SqliteConnection,
    name: &str,
    long_name: &str,
    ip_network: IpNet,
) -> Result<Vlan> {
    let result = sqlx::query("INSERT INTO vlan (name, long_name, ip_network) VALUES (?, ?, ?)")
        .bind(name)
        .bind(long_name)
        .bind(ip_network.to_string())
        .execute(&mut *conn)
        .await
        .map_err(|e| StoreError::on_insert(e, "VLAN"))?;

    Ok(Vlan {
        id: result.last_insert_rowid(),
        name: name.to_string(),
        long_name: long_name.to_string(),
        ip_network,
    })
}

pub async fn create_peering_client(
    conn: &mut SqliteConnection,
    asys_id: i64,
    name: &str,
) -> Result<PeeringClient> {
    let secret_token = gen_secret_token();

    let result =
        sqlx::query("INSERT INTO peering_client (asys_id, name, secret_token) VALUES (?, ?, ?)")
            .bind(asys_id)
            .bind(name)
            .bind(&secret_token)
            .execute(&mut *conn)
            .await
            .map_err(|e| StoreError::on_insert(e, "peering client"))?;

    Ok(PeeringClient {
        id: result.last_insert_rowid(),
        asys_id,
        name: name.to_string(),
        secret_token,
    })
}

/// Attaches a peering client to a VLAN. Without an explicit address the
/// smallest unused host address of the VLAN subnet is assigned.
pub async fn create_interface(
    conn: &mut SqliteConnection,
    client: &PeeringClient,
    vlan: &Vlan,
    public_ip: Option<IpAddr>,
    first_port: u16,
    last_port: u16,
) -> Result<Interface> {
    let public_ip = match public_ip {
        Some(ip) => {
            if !vlan.ip_network.contains(&ip) {
                return Err(StoreError::Validation(format!(
                    "IP address {ip} is not from the VLAN's subnet."
                )));
            }
            ip
        }
        None => unused_ip(conn, vlan).await?,
    };

    let result = sqlx::query(
        r#"
        INSERT INTO interface (peering_client_id, vlan_id, public_ip, first_port, last_port)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(client.id)
    .bind(vlan.id)
    .bind(public_ip.to_string())
    .bind(first_port as i64)
    .bind(last_port as i64)
    .execute(&mut *conn)
    .await
    .map_err(|e| StoreError::on_insert(e, "interface"))?;

    Ok(Interface {
        id: result.last_insert_rowid(),
        peering_client_id: client.id,
        vlan_id: vlan.id,
        public_ip,
        first_port,
        last_port,
    })
}

//
// Lookups.
//

pub async fn owner_by_name(conn: &mut SqliteConnection, name: &str) -> Result<Option<Owner>> {
    let row = sqlx::query("SELECT id, name, long_name, contact FROM owner WHERE name = ?")
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(row.as_ref().map(read_owner))
}

pub async fn vlan_by_name(conn: &mut SqliteConnection, name: &str) -> Result<Option<Vlan>> {
    let row = sqlx::query("SELECT id, name, long_name, ip_network FROM vlan WHERE name = ?")
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref().map(read_vlan).transpose()
}

pub async fn asys_by_asn(conn: &mut SqliteConnection, asn: Asn) -> Result<Option<Asys>> {
    let row = sqlx::query("SELECT id, asn, isd_id, owner_id, is_core, name FROM asys WHERE asn = ?")
        .bind(asn.as_u64() as i64)
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref().map(read_asys).transpose()
}

pub async fn asys_by_id(conn: &mut SqliteConnection, id: i64) -> Result<Option<Asys>> {
    let row = sqlx::query("SELECT id, asn, isd_id, owner_id, is_core, name FROM asys WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref().map(read_asys).transpose()
}

pub async fn isd_exists(conn: &mut SqliteConnection, isd_id: u16) -> Result<bool> {
    let row = sqlx::query("SELECT 1 FROM isd WHERE isd_id = ?")
        .bind(isd_id as i64)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(row.is_some())
}

pub async fn client_by_name(
    conn: &mut SqliteConnection,
    asys_id: i64,
    name: &str,
) -> Result<Option<PeeringClient>> {
    let row = sqlx::query(
        "SELECT id, asys_id, name, secret_token FROM peering_client WHERE asys_id = ? AND name = ?",
    )
    .bind(asys_id)
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|row| PeeringClient {
        id: row.get("id"),
        asys_id: row.get("asys_id"),
        name: row.get("name"),
        secret_token: row.get("secret_token"),
    }))
}

/// The stored API token of `(asn, client)`, if such a client exists.
pub async fn client_token(
    conn: &mut SqliteConnection,
    asn: Asn,
    client: &str,
) -> Result<Option<String>> {
    let row = sqlx::query(
        r#"
        SELECT c.secret_token AS secret_token
        FROM peering_client c
        JOIN asys a ON a.id = c.asys_id
        WHERE a.asn = ? AND c.name = ?
        "#,
    )
    .bind(asn.as_u64() as i64)
    .bind(client)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|row| row.get("secret_token")))
}

pub async fn interface_by_vlan_ip(
    conn: &mut SqliteConnection,
    vlan_id: i64,
    ip: IpAddr,
) -> Result<Option<Interface>> {
    let row = sqlx::query(
        r#"
        SELECT id, peering_client_id, vlan_id, public_ip, first_port, last_port
        FROM interface
        WHERE vlan_id = ? AND public_ip = ?
        "#,
    )
    .bind(vlan_id)
    .bind(ip.to_string())
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(read_interface).transpose()
}

pub async fn interfaces_of_client(
    conn: &mut SqliteConnection,
    client_id: i64,
) -> Result<Vec<Interface>> {
    let rows = sqlx::query(
        r#"
        SELECT id, peering_client_id, vlan_id, public_ip, first_port, last_port
        FROM interface
        WHERE peering_client_id = ?
        ORDER BY id
        "#,
    )
    .bind(client_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(read_interface).collect()
}

pub async fn interfaces_of_asys_in_vlan(
    conn: &mut SqliteConnection,
    asys_id: i64,
    vlan_id: i64,
) -> Result<Vec<Interface>> {
    let rows = sqlx::query(
        r#"
        SELECT i.id AS id, i.peering_client_id AS peering_client_id, i.vlan_id AS vlan_id,
               i.public_ip AS public_ip, i.first_port AS first_port, i.last_port AS last_port
        FROM interface i
        JOIN peering_client c ON c.id = i.peering_client_id
        WHERE c.asys_id = ? AND i.vlan_id = ?
        ORDER BY i.id
        "#,
    )
    .bind(asys_id)
    .bind(vlan_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(read_interface).collect()
}

/// Names of the VLANs a client has an interface on, in interface-creation
/// order, without duplicates.
pub async fn client_vlan_names(conn: &mut SqliteConnection, client_id: i64) -> Result<Vec<String>> {
    let rows = sqlx::query(
        r#"
        SELECT v.name AS name
        FROM interface i
        JOIN vlan v ON v.id = i.vlan_id
        WHERE i.peering_client_id = ?
        ORDER BY i.id
        "#,
    )
    .bind(client_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut names: Vec<String> = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.get("name");
        if !names.contains(&name) {
            names.push(name);
        }
    }

    Ok(names)
}

/// VLANs an AS is connected to through any of its clients.
pub async fn connected_vlans(conn: &mut SqliteConnection, asys_id: i64) -> Result<Vec<Vlan>> {
    let rows = sqlx::query(
        r#"
        SELECT DISTINCT v.id AS id, v.name AS name, v.long_name AS long_name,
               v.ip_network AS ip_network
        FROM vlan v
        JOIN interface i ON i.vlan_id = v.id
        JOIN peering_client c ON c.id = i.peering_client_id
        WHERE c.asys_id = ?
        ORDER BY v.id
        "#,
    )
    .bind(asys_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(read_vlan).collect()
}

pub async fn is_connected_to_vlan(
    conn: &mut SqliteConnection,
    asys_id: i64,
    vlan_id: i64,
) -> Result<bool> {
    let row = sqlx::query(
        r#"
        SELECT 1
        FROM interface i
        JOIN peering_client c ON c.id = i.peering_client_id
        WHERE c.asys_id = ? AND i.vlan_id = ?
        LIMIT 1
        "#,
    )
    .bind(asys_id)
    .bind(vlan_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.is_some())
}

/// IDs of all ASes with at least one interface on the VLAN.
pub async fn vlan_member_ids(conn: &mut SqliteConnection, vlan_id: i64) -> Result<HashSet<i64>> {
    let rows = sqlx::query(
        r#"
        SELECT DISTINCT c.asys_id AS asys_id
        FROM interface i
        JOIN peering_client c ON c.id = i.peering_client_id
        WHERE i.vlan_id = ?
        "#,
    )
    .bind(vlan_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.iter().map(|row| row.get("asys_id")).collect())
}

pub async fn update_interface_ports(
    conn: &mut SqliteConnection,
    interface_id: i64,
    first_port: u16,
    last_port: u16,
) -> Result<()> {
    sqlx::query("UPDATE interface SET first_port = ?, last_port = ? WHERE id = ?")
        .bind(first_port as i64)
        .bind(last_port as i64)
        .bind(interface_id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

pub async fn asys_of_interface(conn: &mut SqliteConnection, interface_id: i64) -> Result<Asys> {
    let row = sqlx::query(
        r#"
        SELECT a.id AS id, a.asn AS asn, a.isd_id AS isd_id, a.owner_id AS owner_id,
               a.is_core AS is_core, a.name AS name
        FROM asys a
        JOIN peering_client c ON c.asys_id = a.id
        JOIN interface i ON i.peering_client_id = c.id
        WHERE i.id = ?
        "#,
    )
    .bind(interface_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref()
        .map(read_asys)
        .transpose()?
        .ok_or(StoreError::NotFound("interface"))
}

//
// Links.
//

const LINK_DETAIL_SELECT: &str = r#"
    SELECT l.id AS id, l.link_type AS link_type,
           l.interface_a AS interface_a, l.port_a AS port_a,
           l.interface_b AS interface_b, l.port_b AS port_b,
           ia.public_ip AS ip_a, ib.public_ip AS ip_b,
           aa.asn AS asn_a, ab.asn AS asn_b
    FROM link l
    JOIN interface ia ON ia.id = l.interface_a
    JOIN peering_client ca ON ca.id = ia.peering_client_id
    JOIN asys aa ON aa.id = ca.asys_id
    JOIN interface ib ON ib.id = l.interface_b
    JOIN peering_client cb ON cb.id = ib.peering_client_id
    JOIN asys ab ON ab.id = cb.asys_id
"#;

pub async fn create_link(
    conn: &mut SqliteConnection,
    link_type: LinkType,
    interface_a: i64,
    port_a: u16,
    interface_b: i64,
    port_b: u16,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO link (link_type, interface_a, port_a, interface_b, port_b)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(link_type as i64)
    .bind(interface_a)
    .bind(port_a as i64)
    .bind(interface_b)
    .bind(port_b as i64)
    .execute(&mut *conn)
    .await
    .map_err(|e| StoreError::on_insert(e, "link"))?;

    Ok(result.last_insert_rowid())
}

pub async fn delete_link(conn: &mut SqliteConnection, link_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM link WHERE id = ?")
        .bind(link_id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

pub async fn link_count(conn: &mut SqliteConnection) -> Result<u64> {
    let row = sqlx::query("SELECT COUNT(*) AS count FROM link")
        .fetch_one(&mut *conn)
        .await?;

    Ok(row.get::<i64, _>("count") as u64)
}

/// All links incident on the given interface.
pub async fn links_of_interface(
    conn: &mut SqliteConnection,
    interface_id: i64,
) -> Result<Vec<LinkDetail>> {
    let sql = format!("{LINK_DETAIL_SELECT} WHERE l.interface_a = ? OR l.interface_b = ? ORDER BY l.id");

    let rows = sqlx::query(&sql)
        .bind(interface_id)
        .bind(interface_id)
        .fetch_all(&mut *conn)
        .await?;

    rows.iter().map(read_link_detail).collect()
}

/// All links between two ASes within one VLAN, in either orientation.
pub async fn links_between(
    conn: &mut SqliteConnection,
    vlan_id: i64,
    asys_id: i64,
    peer_id: i64,
) -> Result<Vec<LinkDetail>> {
    let sql = format!(
        r#"{LINK_DETAIL_SELECT}
        WHERE ia.vlan_id = ?
          AND ((ca.asys_id = ? AND cb.asys_id = ?) OR (ca.asys_id = ? AND cb.asys_id = ?))
        ORDER BY l.id
        "#
    );

    let rows = sqlx::query(&sql)
        .bind(vlan_id)
        .bind(asys_id)
        .bind(peer_id)
        .bind(peer_id)
        .bind(asys_id)
        .fetch_all(&mut *conn)
        .await?;

    rows.iter().map(read_link_detail).collect()
}

/// IDs of the ASes the given AS currently has links with in the VLAN.
pub async fn linked_peer_ids(
    conn: &mut SqliteConnection,
    vlan_id: i64,
    asys_id: i64,
) -> Result<HashSet<i64>> {
    let rows = sqlx::query(
        r#"
        SELECT CASE WHEN ca.asys_id = ? THEN cb.asys_id ELSE ca.asys_id END AS peer_id
        FROM link l
        JOIN interface ia ON ia.id = l.interface_a
        JOIN peering_client ca ON ca.id = ia.peering_client_id
        JOIN interface ib ON ib.id = l.interface_b
        JOIN peering_client cb ON cb.id = ib.peering_client_id
        WHERE ia.vlan_id = ? AND (ca.asys_id = ? OR cb.asys_id = ?)
        "#,
    )
    .bind(asys_id)
    .bind(vlan_id)
    .bind(asys_id)
    .bind(asys_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.iter().map(|row| row.get("peer_id")).collect())
}

/// UDP ports already taken by links incident on the interface.
pub async fn used_ports(conn: &mut SqliteConnection, interface_id: i64) -> Result<HashSet<u16>> {
    let rows = sqlx::query(
        r#"
        SELECT port_a AS port FROM link WHERE interface_a = ?
        UNION ALL
        SELECT port_b AS port FROM link WHERE interface_b = ?
        "#,
    )
    .bind(interface_id)
    .bind(interface_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .iter()
        .map(|row| row.get::<i64, _>("port") as u16)
        .collect())
}

//
// Accepted peers (derived, resolver-owned).
//

pub async fn accepted_peer_ids(
    conn: &mut SqliteConnection,
    vlan_id: i64,
    asys_id: i64,
) -> Result<HashSet<i64>> {
    let rows = sqlx::query("SELECT peer_id FROM accepted_peer WHERE vlan_id = ? AND asys_id = ?")
        .bind(vlan_id)
        .bind(asys_id)
        .fetch_all(&mut *conn)
        .await?;

    Ok(rows.iter().map(|row| row.get("peer_id")).collect())
}

pub async fn insert_accepted_peer(
    conn: &mut SqliteConnection,
    vlan_id: i64,
    asys_id: i64,
    peer_id: i64,
) -> Result<()> {
    sqlx::query("INSERT INTO accepted_peer (vlan_id, asys_id, peer_id) VALUES (?, ?, ?)")
        .bind(vlan_id)
        .bind(asys_id)
        .bind(peer_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| StoreError::on_insert(e, "accepted peer"))?;

    Ok(())
}

pub async fn delete_accepted_peer(
    conn: &mut SqliteConnection,
    vlan_id: i64,
    asys_id: i64,
    peer_id: i64,
) -> Result<()> {
    sqlx::query("DELETE FROM accepted_peer WHERE vlan_id = ? AND asys_id = ? AND peer_id = ?")
        .bind(vlan_id)
        .bind(asys_id)
        .bind(peer_id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// Peers accepted by the AS that accept it back.
pub async fn mutually_accepted_peer_ids(
    conn: &mut SqliteConnection,
    vlan_id: i64,
    asys_id: i64,
) -> Result<HashSet<i64>> {
    let rows = sqlx::query(
        r#"
        SELECT a.peer_id AS peer_id
        FROM accepted_peer a
        JOIN accepted_peer b
          ON b.vlan_id = a.vlan_id AND b.asys_id = a.peer_id AND b.peer_id = a.asys_id
        WHERE a.vlan_id = ? AND a.asys_id = ?
        "#,
    )
    .bind(vlan_id)
    .bind(asys_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.iter().map(|row| row.get("peer_id")).collect())
}

//
// Policy queries used by the resolver.
//

/// Peer-AS ids named by AS-level policies of `(vlan, asys)` with the given
/// accept flag.
pub async fn as_policy_peers(
    conn: &mut SqliteConnection,
    vlan_id: i64,
    asys_id: i64,
    accept: bool,
) -> Result<HashSet<i64>> {
    let rows = sqlx::query(
        "SELECT peer_as_id FROM as_peer_policy WHERE vlan_id = ? AND asys_id = ? AND accept = ?",
    )
    .bind(vlan_id)
    .bind(asys_id)
    .bind(accept)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.iter().map(|row| row.get("peer_as_id")).collect())
}

/// AS ids covered by owner-level policies of `(vlan, asys)`, excluding the
/// policy owner itself.
pub async fn owner_policy_members(
    conn: &mut SqliteConnection,
    vlan_id: i64,
    asys_id: i64,
    accept: bool,
) -> Result<HashSet<i64>> {
    let rows = sqlx::query(
        r#"
        SELECT a.id AS id
        FROM asys a
        WHERE a.owner_id IN (
            SELECT peer_owner_id FROM owner_peer_policy
            WHERE vlan_id = ? AND asys_id = ? AND accept = ?
        ) AND a.id <> ?
        "#,
    )
    .bind(vlan_id)
    .bind(asys_id)
    .bind(accept)
    .bind(asys_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.iter().map(|row| row.get("id")).collect())
}

/// AS ids covered by ISD-level policies of `(vlan, asys)`, excluding the
/// policy owner itself.
pub async fn isd_policy_members(
    conn: &mut SqliteConnection,
    vlan_id: i64,
    asys_id: i64,
    accept: bool,
) -> Result<HashSet<i64>> {
    let rows = sqlx::query(
        r#"
        SELECT a.id AS id
        FROM asys a
        WHERE a.isd_id IN (
            SELECT peer_isd_id FROM isd_peer_policy
            WHERE vlan_id = ? AND asys_id = ? AND accept = ?
        ) AND a.id <> ?
        "#,
    )
    .bind(vlan_id)
    .bind(asys_id)
    .bind(accept)
    .bind(asys_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.iter().map(|row| row.get("id")).collect())
}

/// Whether `(vlan, asys)` has an accept-all default policy. A missing or
/// rejecting default policy means peering is rejected by default.
pub async fn default_policy_accept(
    conn: &mut SqliteConnection,
    vlan_id: i64,
    asys_id: i64,
) -> Result<bool> {
    let row = sqlx::query("SELECT accept FROM default_policy WHERE vlan_id = ? AND asys_id = ?")
        .bind(vlan_id)
        .bind(asys_id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(row.map(|row| row.get("accept")).unwrap_or(false))
}

//
// Policy CRUD.
//

enum ResolvedPeer {
    Everyone,
    Asys(i64),
    Owner(i64),
    Isd(u16),
}

struct ResolvedPolicy {
    vlan: Vlan,
    asys: Asys,
    peer: ResolvedPeer,
}

async fn resolve_policy(conn: &mut SqliteConnection, rule: &PolicyRule) -> Result<ResolvedPolicy> {
    let vlan = vlan_by_name(conn, &rule.vlan)
        .await?
        .ok_or_else(|| StoreError::Validation("VLAN does not exist.".to_string()))?;
    let asys = asys_by_asn(conn, rule.asn)
        .await?
        .ok_or_else(|| StoreError::Validation("AS does not exist.".to_string()))?;

    let peer = match &rule.peer {
        PeerSelector::Everyone => ResolvedPeer::Everyone,
        PeerSelector::Asys(peer_asn) => {
            let peer = asys_by_asn(conn, *peer_asn)
                .await?
                .ok_or_else(|| StoreError::Validation("AS does not exist.".to_string()))?;
            ResolvedPeer::Asys(peer.id)
        }
        PeerSelector::Owner(name) => {
            let owner = owner_by_name(conn, name)
                .await?
                .ok_or_else(|| StoreError::Validation("Owner does not exist.".to_string()))?;
            ResolvedPeer::Owner(owner.id)
        }
        PeerSelector::Isd(isd_id) => {
            if !isd_exists(conn, *isd_id).await? {
                return Err(StoreError::Validation("ISD does not exist.".to_string()));
            }
            ResolvedPeer::Isd(*isd_id)
        }
    };

    Ok(ResolvedPolicy { vlan, asys, peer })
}

/// Validates and persists one policy.
///
/// The policy's AS must be connected to the VLAN and AS-level policies may
/// not name their own AS. A duplicate natural key yields `AlreadyExists`.
pub async fn create_policy(conn: &mut SqliteConnection, rule: &PolicyRule) -> Result<()> {
    let resolved = resolve_policy(conn, rule).await?;

    if !is_connected_to_vlan(conn, resolved.asys.id, resolved.vlan.id).await? {
        return Err(StoreError::Validation(format!(
            "{} is not a member of {}.",
            resolved.asys.label(),
            resolved.vlan.name
        )));
    }

    match resolved.peer {
        ResolvedPeer::Everyone => {
            sqlx::query("INSERT INTO default_policy (vlan_id, asys_id, accept) VALUES (?, ?, ?)")
                .bind(resolved.vlan.id)
                .bind(resolved.asys.id)
                .bind(rule.accept)
                .execute(&mut *conn)
                .await
                .map_err(|e| StoreError::on_insert(e, "default policy"))?;
        }
        ResolvedPeer::Asys(peer_id) => {
            if peer_id == resolved.asys.id {
                return Err(StoreError::Validation(
                    "AS and peer AS are identical.".to_string(),
                ));
            }
            sqlx::query(
                "INSERT INTO as_peer_policy (vlan_id, asys_id, peer_as_id, accept) VALUES (?, ?, ?, ?)",
            )
            .bind(resolved.vlan.id)
            .bind(resolved.asys.id)
            .bind(peer_id)
            .bind(rule.accept)
            .execute(&mut *conn)
            .await
            .map_err(|e| StoreError::on_insert(e, "AS peering policy"))?;
        }
        ResolvedPeer::Owner(owner_id) => {
            sqlx::query(
                "INSERT INTO owner_peer_policy (vlan_id, asys_id, peer_owner_id, accept) VALUES (?, ?, ?, ?)",
            )
            .bind(resolved.vlan.id)
            .bind(resolved.asys.id)
            .bind(owner_id)
            .bind(rule.accept)
            .execute(&mut *conn)
            .await
            .map_err(|e| StoreError::on_insert(e, "owner peering policy"))?;
        }
        ResolvedPeer::Isd(isd_id) => {
            sqlx::query(
                "INSERT INTO isd_peer_policy (vlan_id, asys_id, peer_isd_id, accept) VALUES (?, ?, ?, ?)",
            )
            .bind(resolved.vlan.id)
            .bind(resolved.asys.id)
            .bind(isd_id as i64)
            .bind(rule.accept)
            .execute(&mut *conn)
            .await
            .map_err(|e| StoreError::on_insert(e, "ISD peering policy"))?;
        }
    }

    Ok(())
}

/// Checks for a policy by its natural key. The accept flag is not part of
/// the key.
pub async fn policy_exists(conn: &mut SqliteConnection, rule: &PolicyRule) -> Result<bool> {
    let resolved = resolve_policy(conn, rule).await?;

    let row = match resolved.peer {
        ResolvedPeer::Everyone => {
            sqlx::query("SELECT 1 FROM default_policy WHERE vlan_id = ? AND asys_id = ?")
                .bind(resolved.vlan.id)
                .bind(resolved.asys.id)
                .fetch_optional(&mut *conn)
                .await?
        }
        ResolvedPeer::Asys(peer_id) => sqlx::query(
            "SELECT 1 FROM as_peer_policy WHERE vlan_id = ? AND asys_id = ? AND peer_as_id = ?",
        )
        .bind(resolved.vlan.id)
        .bind(resolved.asys.id)
        .bind(peer_id)
        .fetch_optional(&mut *conn)
        .await?,
        ResolvedPeer::Owner(owner_id) => sqlx::query(
            "SELECT 1 FROM owner_peer_policy WHERE vlan_id = ? AND asys_id = ? AND peer_owner_id = ?",
        )
        .bind(resolved.vlan.id)
        .bind(resolved.asys.id)
        .bind(owner_id)
        .fetch_optional(&mut *conn)
        .await?,
        ResolvedPeer::Isd(isd_id) => sqlx::query(
            "SELECT 1 FROM isd_peer_policy WHERE vlan_id = ? AND asys_id = ? AND peer_isd_id = ?",
        )
        .bind(resolved.vlan.id)
        .bind(resolved.asys.id)
        .bind(isd_id as i64)
        .fetch_optional(&mut *conn)
        .await?,
    };

    Ok(row.is_some())
}

/// Deletes a policy by its natural key. Returns false if no such policy
/// exists.
pub async fn delete_policy(conn: &mut SqliteConnection, rule: &PolicyRule) -> Result<bool> {
    let resolved = resolve_policy(conn, rule).await?;

    let result = match resolved.peer {
        ResolvedPeer::Everyone => {
            sqlx::query("DELETE FROM default_policy WHERE vlan_id = ? AND asys_id = ?")
                .bind(resolved.vlan.id)
                .bind(resolved.asys.id)
                .execute(&mut *conn)
                .await?
        }
        ResolvedPeer::Asys(peer_id) => sqlx::query(
            "DELETE FROM as_peer_policy WHERE vlan_id = ? AND asys_id = ? AND peer_as_id = ?",
        )
        .bind(resolved.vlan.id)
        .bind(resolved.asys.id)
        .bind(peer_id)
        .execute(&mut *conn)
        .await?,
        ResolvedPeer::Owner(owner_id) => sqlx::query(
            "DELETE FROM owner_peer_policy WHERE vlan_id = ? AND asys_id = ? AND peer_owner_id = ?",
        )
        .bind(resolved.vlan.id)
        .bind(resolved.asys.id)
        .bind(owner_id)
        .execute(&mut *conn)
        .await?,
        ResolvedPeer::Isd(isd_id) => sqlx::query(
            "DELETE FROM isd_peer_policy WHERE vlan_id = ? AND asys_id = ? AND peer_isd_id = ?",
        )
        .bind(resolved.vlan.id)
        .bind(resolved.asys.id)
        .bind(isd_id as i64)
        .execute(&mut *conn)
        .await?,
    };

    Ok(result.rows_affected() > 0)
}

/// Deletes every policy of an AS, optionally limited to one VLAN.
pub async fn delete_policies_of_asys(
    conn: &mut SqliteConnection,
    asys_id: i64,
    vlan_id: Option<i64>,
) -> Result<()> {
    for table in [
        "default_policy",
        "as_peer_policy",
        "owner_peer_policy",
        "isd_peer_policy",
    ] {
        match vlan_id {
            Some(vlan_id) => {
                let sql = format!("DELETE FROM {table} WHERE asys_id = ? AND vlan_id = ?");
                sqlx::query(&sql)
                    .bind(asys_id)
                    .bind(vlan_id)
                    .execute(&mut *conn)
                    .await?;
            }
            None => {
                let sql = format!("DELETE FROM {table} WHERE asys_id = ?");
                sqlx::query(&sql).bind(asys_id).execute(&mut *conn).await?;
            }
        }
    }

    Ok(())
}

fn push_filters(sql: &mut String, vlan_id: Option<i64>, accept: Option<bool>) {
    if vlan_id.is_some() {
        sql.push_str(" AND p.vlan_id = ?");
    }
    if accept.is_some() {
        sql.push_str(" AND p.accept = ?");
    }
}

pub async fn list_default_policies(
    conn: &mut SqliteConnection,
    asys_id: i64,
    vlan_id: Option<i64>,
    accept: Option<bool>,
) -> Result<Vec<PolicyRule>> {
    let mut sql = String::from(
        r#"
        SELECT v.name AS vlan, a.asn AS asn, p.accept AS accept
        FROM default_policy p
        JOIN vlan v ON v.id = p.vlan_id
        JOIN asys a ON a.id = p.asys_id
        WHERE p.asys_id = ?
        "#,
    );
    push_filters(&mut sql, vlan_id, accept);
    sql.push_str(" ORDER BY p.id");

    let mut query = sqlx::query(&sql).bind(asys_id);
    if let Some(vlan_id) = vlan_id {
        query = query.bind(vlan_id);
    }
    if let Some(accept) = accept {
        query = query.bind(accept);
    }

    let rows = query.fetch_all(&mut *conn).await?;

    rows.iter()
        .map(|row| {
            Ok(PolicyRule {
                vlan: row.get("vlan"),
                asn: Asn::new(row.get::<i64, _>("asn") as u64)?,
                accept: row.get("accept"),
                peer: PeerSelector::Everyone,
            })
        })
        .collect()
}

pub async fn list_as_policies(
    conn: &mut SqliteConnection,
    asys_id: i64,
    vlan_id: Option<i64>,
    accept: Option<bool>,
    peer_as_id: Option<i64>,
) -> Result<Vec<PolicyRule>> {
    let mut sql = String::from(
        r#"
        SELECT v.name AS vlan, a.asn AS asn, p.accept AS accept, pa.asn AS peer_asn
        FROM as_peer_policy p
        JOIN vlan v ON v.id = p.vlan_id
        JOIN asys a ON a.id = p.asys_id
        JOIN asys pa ON pa.id = p.peer_as_id
        WHERE p.asys_id = ?
        "#,
    );
    push_filters(&mut sql, vlan_id, accept);
    if peer_as_id.is_some() {
        sql.push_str(" AND p.peer_as_id = ?");
    }
    sql.push_str(" ORDER BY p.id");

    let mut query = sqlx::query(&sql).bind(asys_id);
    if let Some(vlan_id) = vlan_id {
        query = query.bind(vlan_id);
    }
    if let Some(accept) = accept {
        query = query.bind(accept);
    }
    if let Some(peer_as_id) = peer_as_id {
        query = query.bind(peer_as_id);
    }

    let rows = query.fetch_all(&mut *conn).await?;

    rows.iter()
        .map(|row| {
            Ok(PolicyRule {
                vlan: row.get("vlan"),
                asn: Asn::new(row.get::<i64, _>("asn") as u64)?,
                accept: row.get("accept"),
                peer: PeerSelector::Asys(Asn::new(row.get::<i64, _>("peer_asn") as u64)?),
            })
        })
        .collect()
}

pub async fn list_owner_policies(
    conn: &mut SqliteConnection,
    asys_id: i64,
    vlan_id: Option<i64>,
    accept: Option<bool>,
    peer_owner_id: Option<i64>,
) -> Result<Vec<PolicyRule>> {
    let mut sql = String::from(
        r#"
        SELECT v.name AS vlan, a.asn AS asn, p.accept AS accept, o.name AS peer_owner
        FROM owner_peer_policy p
        JOIN vlan v ON v.id = p.vlan_id
        JOIN asys a ON a.id = p.asys_id
        JOIN owner o ON o.id = p.peer_owner_id
        WHERE p.asys_id = ?
        "#,
    );
    push_filters(&mut sql, vlan_id, accept);
    if peer_owner_id.is_some() {
        sql.push_str(" AND p.peer_owner_id = ?");
    }
    sql.push_str(" ORDER BY p.id");

    let mut query = sqlx::query(&sql).bind(asys_id);
    if let Some(vlan_id) = vlan_id {
        query = query.bind(vlan_id);
    }
    if let Some(accept) = accept {
        query = query.bind(accept);
    }
    if let Some(peer_owner_id) = peer_owner_id {
        query = query.bind(peer_owner_id);
    }

    let rows = query.fetch_all(&mut *conn).await?;

    rows.iter()
        .map(|row| {
            Ok(PolicyRule {
                vlan: row.get("vlan"),
                asn: Asn::new(row.get::<i64, _>("asn") as u64)?,
                accept: row.get("accept"),
                peer: PeerSelector::Owner(row.get("peer_owner")),
            })
        })
        .collect()
}

pub async fn list_isd_policies(
    conn: &mut SqliteConnection,
    asys_id: i64,
    vlan_id: Option<i64>,
    accept: Option<bool>,
    peer_isd: Option<u16>,
) -> Result<Vec<PolicyRule>> {
    let mut sql = String::from(
        r#"
        SELECT v.name AS vlan, a.asn AS asn, p.accept AS accept, p.peer_isd_id AS peer_isd
        FROM isd_peer_policy p
        JOIN vlan v ON v.id = p.vlan_id
        JOIN asys a ON a.id = p.asys_id
        WHERE p.asys_id = ?
        "#,
    );
    push_filters(&mut sql, vlan_id, accept);
    if peer_isd.is_some() {
        sql.push_str(" AND p.peer_isd_id = ?");
    }
    sql.push_str(" ORDER BY p.id");

    let mut query = sqlx::query(&sql).bind(asys_id);
    if let Some(vlan_id) = vlan_id {
        query = query.bind(vlan_id);
    }
    if let Some(accept) = accept {
        query = query.bind(accept);
    }
    if let Some(peer_isd) = peer_isd {
        query = query.bind(peer_isd as i64);
    }

    let rows = query.fetch_all(&mut *conn).await?;

    rows.iter()
        .map(|row| {
            Ok(PolicyRule {
                vlan: row.get("vlan"),
                asn: Asn::new(row.get::<i64, _>("asn") as u64)?,
                accept: row.get("accept"),
                peer: PeerSelector::Isd(row.get::<i64, _>("peer_isd") as u16),
            })
        })
        .collect()
}

//
// Owner queries for the informational API.
//

/// Owners matching both filters. At most two rows are fetched, enough for
/// callers to tell "unique" from "ambiguous".
pub async fn find_owners(
    conn: &mut SqliteConnection,
    name: Option<&str>,
    asn: Option<Asn>,
) -> Result<Vec<Owner>> {
    let mut sql = String::from(
        "SELECT DISTINCT o.id AS id, o.name AS name, o.long_name AS long_name, o.contact AS contact FROM owner o",
    );
    if asn.is_some() {
        sql.push_str(" JOIN asys a ON a.owner_id = o.id AND a.asn = ?");
    }
    if name.is_some() {
        sql.push_str(" WHERE o.name = ?");
    }
    sql.push_str(" LIMIT 2");

    let mut query = sqlx::query(&sql);
    if let Some(asn) = asn {
        query = query.bind(asn.as_u64() as i64);
    }
    if let Some(name) = name {
        query = query.bind(name);
    }

    let rows = query.fetch_all(&mut *conn).await?;

    Ok(rows.iter().map(read_owner).collect())
}

/// Owners whose full name contains the given substring, case-insensitively.
pub async fn search_owners(conn: &mut SqliteConnection, long_name: &str) -> Result<Vec<Owner>> {
    let rows = sqlx::query(
        r#"
        SELECT id, name, long_name, contact FROM owner
        WHERE instr(lower(long_name), lower(?)) > 0
        ORDER BY id
        "#,
    )
    .bind(long_name)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.iter().map(read_owner).collect())
}

/// ASN strings of all ASes of an owner, in ascending order.
pub async fn owner_asns(conn: &mut SqliteConnection, owner_id: i64) -> Result<Vec<Asn>> {
    let rows = sqlx::query("SELECT asn FROM asys WHERE owner_id = ? ORDER BY asn")
        .bind(owner_id)
        .fetch_all(&mut *conn)
        .await?;

    rows.iter()
        .map(|row| Ok(Asn::new(row.get::<i64, _>("asn") as u64)?))
        .collect()
}

//
// Resource allocators. Both are deterministic: identical state yields
// identical results.
//

/// The smallest unused host address in the VLAN's subnet.
pub async fn unused_ip(conn: &mut SqliteConnection, vlan: &Vlan) -> Result<IpAddr> {
    let rows = sqlx::query("SELECT public_ip FROM interface WHERE vlan_id = ?")
        .bind(vlan.id)
        .fetch_all(&mut *conn)
        .await?;

    let mut in_use = HashSet::default();
    for row in &rows {
        in_use.insert(parse_ip(&row.get::<String, _>("public_ip"))?);
    }

    for ip in vlan.ip_network.hosts() {
        if !in_use.contains(&ip) {
            return Ok(ip);
        }
    }

    Err(StoreError::NoUnusedIps(vlan.name.clone()))
}

/// The smallest unused port in the interface's range `[first_port,
/// last_port)`.
///
/// Ports are scoped to the interface: links incident on other interfaces,
/// even of the same AS, do not occupy ports here. An unset range (either
/// bound 0) never has free ports.
pub async fn unused_port(conn: &mut SqliteConnection, interface: &Interface) -> Result<u16> {
    if interface.first_port == 0 || interface.last_port == 0 {
        return Err(StoreError::NoUnusedPorts(interface.public_ip.to_string()));
    }

    let in_use = used_ports(conn, interface.id).await?;

    for port in interface.first_port..interface.last_port {
        if !in_use.contains(&port) {
            return Ok(port);
        }
    }

    Err(StoreError::NoUnusedPorts(interface.public_ip.to_string()))
}
