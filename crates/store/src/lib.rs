//! Persistent state of the peering coordinator.
//!
//! The coordinator keeps owners, ISDs, ASes, peering VLANs, clients,
//! interfaces, peering policies and the derived accepted-peer and link
//! relations in an embedded SQLite database. Every write RPC runs inside a
//! single transaction spanning the policy write, the policy resolver and the
//! link reconciliation.

pub mod asn;
pub mod error;
pub mod models;
pub mod resolver;

pub use asn::Asn;
pub use error::{Result, StoreError};

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction, pool::PoolConnection};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS owner (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        long_name TEXT NOT NULL,
        contact TEXT NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS isd (
        isd_id INTEGER PRIMARY KEY,
        name TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS asys (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        asn INTEGER NOT NULL UNIQUE,
        isd_id INTEGER NOT NULL REFERENCES isd(isd_id) ON DELETE CASCADE,
        owner_id INTEGER NOT NULL REFERENCES owner(id) ON DELETE CASCADE,
        is_core INTEGER NOT NULL,
        name TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS vlan (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        long_name TEXT NOT NULL,
        ip_network TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS peering_client (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        asys_id INTEGER NOT NULL REFERENCES asys(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        secret_token TEXT NOT NULL,
        UNIQUE (asys_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS interface (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        peering_client_id INTEGER NOT NULL REFERENCES peering_client(id) ON DELETE CASCADE,
        vlan_id INTEGER NOT NULL REFERENCES vlan(id) ON DELETE CASCADE,
        public_ip TEXT NOT NULL,
        first_port INTEGER NOT NULL DEFAULT 0,
        last_port INTEGER NOT NULL DEFAULT 0,
        UNIQUE (vlan_id, public_ip)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS link (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        link_type INTEGER NOT NULL,
        interface_a INTEGER NOT NULL REFERENCES interface(id) ON DELETE CASCADE,
        port_a INTEGER NOT NULL,
        interface_b INTEGER NOT NULL REFERENCES interface(id) ON DELETE CASCADE,
        port_b INTEGER NOT NULL,
        UNIQUE (interface_a, interface_b),
        CHECK (interface_a <> interface_b)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS accepted_peer (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        vlan_id INTEGER NOT NULL REFERENCES vlan(id) ON DELETE CASCADE,
        asys_id INTEGER NOT NULL REFERENCES asys(id) ON DELETE CASCADE,
        peer_id INTEGER NOT NULL REFERENCES asys(id) ON DELETE CASCADE,
        UNIQUE (vlan_id, asys_id, peer_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS default_policy (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        vlan_id INTEGER NOT NULL REFERENCES vlan(id) ON DELETE CASCADE,
        asys_id INTEGER NOT NULL REFERENCES asys(id) ON DELETE CASCADE,
        accept INTEGER NOT NULL,
        UNIQUE (vlan_id, asys_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS as_peer_policy (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        vlan_id INTEGER NOT NULL REFERENCES vlan(id) ON DELETE CASCADE,
        asys_id INTEGER NOT NULL REFERENCES asys(id) ON DELETE CASCADE,
        peer_as_id INTEGER NOT NULL REFERENCES asys(id) ON DELETE CASCADE,
        accept INTEGER NOT NULL,
        UNIQUE (vlan_id, asys_id, peer_as_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS isd_peer_policy (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        vlan_id INTEGER NOT NULL REFERENCES vlan(id) ON DELETE CASCADE,
        asys_id INTEGER NOT NULL REFERENCES asys(id) ON DELETE CASCADE,
        peer_isd_id INTEGER NOT NULL REFERENCES isd(isd_id) ON DELETE CASCADE,
        accept INTEGER NOT NULL,
        UNIQUE (vlan_id, asys_id, peer_isd_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS owner_peer_policy (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        vlan_id INTEGER NOT NULL REFERENCES vlan(id) ON DELETE CASCADE,
        asys_id INTEGER NOT NULL REFERENCES asys(id) ON DELETE CASCADE,
        peer_owner_id INTEGER NOT NULL REFERENCES owner(id) ON DELETE CASCADE,
        accept INTEGER NOT NULL,
        UNIQUE (vlan_id, asys_id, peer_owner_id)
    )
    "#,
];

/// Handle to the coordinator database.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (or creates) the database file.
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(options).await?;

        Ok(Self { pool })
    }

    /// Opens a private in-memory database. A single pooled connection keeps
    /// every handle on the same database instance.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Creates the tables if they do not exist yet.
    pub async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub async fn acquire(&self) -> Result<PoolConnection<Sqlite>> {
        Ok(self.pool.acquire().await?)
    }
}
