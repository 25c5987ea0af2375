//! Client/server test fixture
//!
//! A provisioned client and server, each with its own state directory under
//! one temporary directory, plus a [`Carrier`] standing in for whatever moves
//! bundle files between them.
//!
//! # Example
//!
//! ```no_run
//! use ddd_integration_tests::fixtures::TwoNodeFixture;
//!
//! #[tokio::test]
//! async fn test_exchange() {
//!     let fixture = TwoNodeFixture::new();
//!     fixture.client.enqueue_adu(&fixture.server_id, "mail", b"hi").unwrap();
//!     let bundle = fixture.upstream().await.unwrap();
//!     fixture.server.ingest(&bundle.bytes).await.unwrap();
//! }
//! ```

use ddd_core::{
    BundleTransmission, LocalKeys, OutboundBundle, Result, Role, TransmissionConfig,
};
use ddd_crypto::PeerIdentity;
use ddd_crypto::handshake::{ClientKeyBundle, ServerKeyBundle};
use ddd_crypto::id_cipher::IdKdfParams;
use rand_core::OsRng;
use std::collections::VecDeque;
use std::path::PathBuf;
use tempfile::TempDir;

/// Provisioned client/server pair
pub struct TwoNodeFixture {
    pub client: BundleTransmission,
    pub server: BundleTransmission,
    pub client_id: PeerIdentity,
    pub server_id: PeerIdentity,
    client_keys: ClientKeyBundle,
    server_keys: ServerKeyBundle,
    capacity: u64,
    dir: TempDir,
}

impl TwoNodeFixture {
    /// Fixture with the default window capacity
    pub fn new() -> Self {
        Self::with_capacity(ddd_core::config::DEFAULT_WINDOW_CAPACITY)
    }

    /// Fixture whose nodes use `capacity` bundles per window
    pub fn with_capacity(capacity: u64) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let client_keys = ClientKeyBundle::generate(&mut OsRng);
        let server_keys = ServerKeyBundle::generate(&mut OsRng);

        let client = open_client(&dir, &client_keys, &server_keys, capacity);
        let server = open_server(&dir, &server_keys, capacity);
        Self {
            client_id: client.local_id().clone(),
            server_id: server.local_id().clone(),
            client,
            server,
            client_keys,
            server_keys,
            capacity,
            dir,
        }
    }

    /// Root of both state directories
    pub fn root(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Client bundle for the server, if any
    pub async fn upstream(&self) -> Result<Option<OutboundBundle>> {
        self.client.bundle_to_send_for(&self.server_id).await
    }

    /// Server bundle for the client, if any
    pub async fn downstream(&self) -> Result<Option<OutboundBundle>> {
        self.server.bundle_to_send_for(&self.client_id).await
    }

    /// Drop and reopen both nodes from their state directories
    pub fn restart(&mut self) {
        self.client = open_client(&self.dir, &self.client_keys, &self.server_keys, self.capacity);
        self.server = open_server(&self.dir, &self.server_keys, self.capacity);
    }

    /// Another client provisioned with the same server
    pub fn second_client(&self, name: &str) -> BundleTransmission {
        let keys = ClientKeyBundle::generate(&mut OsRng);
        let config = config(Role::Client, self.dir.path().join(name), self.capacity);
        BundleTransmission::open(
            config,
            LocalKeys::Client {
                keys,
                server: self.server_keys.public(),
            },
        )
        .expect("open second client")
    }
}

impl Default for TwoNodeFixture {
    fn default() -> Self {
        Self::new()
    }
}

fn config(role: Role, state_dir: PathBuf, capacity: u64) -> TransmissionConfig {
    let mut config = TransmissionConfig::new(role, state_dir);
    config.window_capacity = capacity;
    config.id_kdf = IdKdfParams::low_security();
    config
}

fn open_client(
    dir: &TempDir,
    keys: &ClientKeyBundle,
    server: &ServerKeyBundle,
    capacity: u64,
) -> BundleTransmission {
    BundleTransmission::open(
        config(Role::Client, dir.path().join("client"), capacity),
        LocalKeys::Client {
            keys: keys.clone(),
            server: server.public(),
        },
    )
    .expect("open client")
}

fn open_server(dir: &TempDir, keys: &ServerKeyBundle, capacity: u64) -> BundleTransmission {
    BundleTransmission::open(
        config(Role::Server, dir.path().join("server"), capacity),
        LocalKeys::Server(keys.clone()),
    )
    .expect("open server")
}

/// Unreliable carrier: holds bundle bytes until told to deliver them, in
/// any order, any number of times
#[derive(Default)]
pub struct Carrier {
    held: VecDeque<Vec<u8>>,
}

impl Carrier {
    /// Take a bundle on board
    pub fn pick_up(&mut self, bundle: &OutboundBundle) {
        self.held.push_back(bundle.bytes.clone());
    }

    /// Bundles on board
    pub fn len(&self) -> usize {
        self.held.len()
    }

    /// Whether nothing is on board
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Deliver everything newest first, keeping nothing
    pub fn drain_reversed(&mut self) -> Vec<Vec<u8>> {
        self.held.drain(..).rev().collect()
    }

    /// Deliver everything in pickup order, keeping a copy on board
    pub fn replay(&self) -> Vec<Vec<u8>> {
        self.held.iter().cloned().collect()
    }
}
