//! Key files.
//!
//! Each role keeps its keys in one directory of three-line envelope files:
//!
//! | Role   | Own keys                                                     | Provisioned              |
//! |--------|--------------------------------------------------------------|--------------------------|
//! | client | `clientIdentity`, `clientBase` (`.pub` + `.pvt`)              | the three server `.pub`  |
//! | server | `server_identity`, `server_signed_pre`, `server_ratchet`     | none                     |
//!
//! A client directory is complete once the server public keys have been
//! copied into it.

use crate::config::Role;
use crate::error::{Error, Result};
use crate::store::write_atomic;
use ddd_crypto::handshake::{ClientKeyBundle, ServerKeyBundle, ServerPublicBundle};
use ddd_crypto::pem::{self, PRIVATE_KEY, PUBLIC_KEY};
use ddd_crypto::x25519::{PrivateKey, PublicKey};
use ddd_crypto::{IdentityKey, IdentityKeyPair, PeerIdentity};
use rand_core::{CryptoRng, RngCore};
use std::path::{Path, PathBuf};
use tracing::info;

/// Client identity key file stem
pub const CLIENT_IDENTITY: &str = "clientIdentity";
/// Client base key file stem
pub const CLIENT_BASE: &str = "clientBase";
/// Server identity key file stem
pub const SERVER_IDENTITY: &str = "server_identity";
/// Server signed pre-key file stem
pub const SERVER_SIGNED_PRE: &str = "server_signed_pre";
/// Server ratchet key file stem
pub const SERVER_RATCHET: &str = "server_ratchet";

const PUBLIC_EXT: &str = "pub";
const PRIVATE_EXT: &str = "pvt";

/// Keys of the local node.
#[derive(Debug, Clone)]
pub enum LocalKeys {
    /// Client keys plus the provisioned server public keys
    Client {
        /// Own identity and base key
        keys: ClientKeyBundle,
        /// Server public keys
        server: ServerPublicBundle,
    },
    /// Server keys
    Server(ServerKeyBundle),
}

impl LocalKeys {
    /// Role these keys belong to.
    #[must_use]
    pub fn role(&self) -> Role {
        match self {
            Self::Client { .. } => Role::Client,
            Self::Server(_) => Role::Server,
        }
    }

    /// Long-term identity.
    #[must_use]
    pub fn identity(&self) -> &IdentityKeyPair {
        match self {
            Self::Client { keys, .. } => &keys.identity,
            Self::Server(keys) => &keys.identity,
        }
    }

    /// Identifier of the local node.
    #[must_use]
    pub fn peer_id(&self) -> PeerIdentity {
        self.identity().peer_id()
    }
}

fn key_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    dir.join(format!("{stem}.{ext}"))
}

fn write_key(dir: &Path, stem: &str, public: &[u8; 32], private: &[u8; 32]) -> Result<()> {
    write_atomic(
        &key_path(dir, stem, PUBLIC_EXT),
        pem::encode(PUBLIC_KEY, public).as_bytes(),
    )?;
    write_atomic(
        &key_path(dir, stem, PRIVATE_EXT),
        pem::encode(PRIVATE_KEY, private).as_bytes(),
    )?;
    Ok(())
}

fn read_key(path: &Path, kind: &str) -> Result<[u8; 32]> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("cannot read key file {}: {e}", path.display()))
    })?;
    pem::decode_key(kind, &text).map_err(|source| Error::KeyFile {
        path: path.to_path_buf(),
        source,
    })
}

fn read_public(dir: &Path, stem: &str) -> Result<[u8; 32]> {
    read_key(&key_path(dir, stem, PUBLIC_EXT), PUBLIC_KEY)
}

fn read_private(dir: &Path, stem: &str) -> Result<[u8; 32]> {
    read_key(&key_path(dir, stem, PRIVATE_EXT), PRIVATE_KEY)
}

fn identity_key(dir: &Path, stem: &str) -> Result<IdentityKey> {
    let path = key_path(dir, stem, PUBLIC_EXT);
    IdentityKey::from_bytes(&read_public(dir, stem)?).map_err(|source| Error::KeyFile { path, source })
}

/// Write a new client key set into `dir`.
///
/// # Errors
///
/// Storage failures.
pub fn generate_client<R: RngCore + CryptoRng>(dir: &Path, rng: &mut R) -> Result<ClientKeyBundle> {
    let keys = ClientKeyBundle::generate(rng);
    save_client(dir, &keys)?;
    info!("Generated client keys in {} ({})", dir.display(), keys.identity.peer_id());
    Ok(keys)
}

/// Write a new server key set into `dir`.
///
/// # Errors
///
/// Storage failures.
pub fn generate_server<R: RngCore + CryptoRng>(dir: &Path, rng: &mut R) -> Result<ServerKeyBundle> {
    let keys = ServerKeyBundle::generate(rng);
    save_server(dir, &keys)?;
    info!("Generated server keys in {} ({})", dir.display(), keys.identity.peer_id());
    Ok(keys)
}

/// Persist a client key set.
///
/// # Errors
///
/// Storage failures.
pub fn save_client(dir: &Path, keys: &ClientKeyBundle) -> Result<()> {
    write_key(
        dir,
        CLIENT_IDENTITY,
        &keys.identity.public().to_bytes(),
        &keys.identity.to_bytes(),
    )?;
    write_key(dir, CLIENT_BASE, &keys.base.public_key().to_bytes(), &keys.base.to_bytes())
}

/// Persist a server key set.
///
/// # Errors
///
/// Storage failures.
pub fn save_server(dir: &Path, keys: &ServerKeyBundle) -> Result<()> {
    write_key(
        dir,
        SERVER_IDENTITY,
        &keys.identity.public().to_bytes(),
        &keys.identity.to_bytes(),
    )?;
    write_key(
        dir,
        SERVER_SIGNED_PRE,
        &keys.signed_pre.public_key().to_bytes(),
        &keys.signed_pre.to_bytes(),
    )?;
    write_key(
        dir,
        SERVER_RATCHET,
        &keys.ratchet.public_key().to_bytes(),
        &keys.ratchet.to_bytes(),
    )
}

/// Copy the server public key files from `server_dir` into `client_dir`.
///
/// # Errors
///
/// Missing or malformed server key files, or storage failures.
pub fn provision_server_keys(server_dir: &Path, client_dir: &Path) -> Result<()> {
    for stem in [SERVER_IDENTITY, SERVER_SIGNED_PRE, SERVER_RATCHET] {
        let bytes = read_public(server_dir, stem)?;
        write_atomic(
            &key_path(client_dir, stem, PUBLIC_EXT),
            pem::encode(PUBLIC_KEY, &bytes).as_bytes(),
        )?;
    }
    Ok(())
}

/// Load the server public keys provisioned into `dir`.
///
/// # Errors
///
/// Missing or malformed key files.
pub fn load_server_public(dir: &Path) -> Result<ServerPublicBundle> {
    Ok(ServerPublicBundle {
        identity: identity_key(dir, SERVER_IDENTITY)?,
        signed_pre: PublicKey::from_bytes(read_public(dir, SERVER_SIGNED_PRE)?),
        ratchet: PublicKey::from_bytes(read_public(dir, SERVER_RATCHET)?),
    })
}

/// Load the keys of `role` from `dir`.
///
/// # Errors
///
/// Missing or malformed key files, or a private key that does not match its
/// public file.
pub fn load(role: Role, dir: &Path) -> Result<LocalKeys> {
    match role {
        Role::Client => {
            let identity = IdentityKeyPair::from_bytes(&read_private(dir, CLIENT_IDENTITY)?);
            check_pair(dir, CLIENT_IDENTITY, &identity.public().to_bytes())?;
            let base = PrivateKey::from_bytes(read_private(dir, CLIENT_BASE)?);
            check_pair(dir, CLIENT_BASE, &base.public_key().to_bytes())?;
            Ok(LocalKeys::Client {
                keys: ClientKeyBundle { identity, base },
                server: load_server_public(dir)?,
            })
        }
        Role::Server => {
            let identity = IdentityKeyPair::from_bytes(&read_private(dir, SERVER_IDENTITY)?);
            check_pair(dir, SERVER_IDENTITY, &identity.public().to_bytes())?;
            let signed_pre = PrivateKey::from_bytes(read_private(dir, SERVER_SIGNED_PRE)?);
            check_pair(dir, SERVER_SIGNED_PRE, &signed_pre.public_key().to_bytes())?;
            let ratchet = PrivateKey::from_bytes(read_private(dir, SERVER_RATCHET)?);
            check_pair(dir, SERVER_RATCHET, &ratchet.public_key().to_bytes())?;
            Ok(LocalKeys::Server(ServerKeyBundle {
                identity,
                signed_pre,
                ratchet,
            }))
        }
    }
}

fn check_pair(dir: &Path, stem: &str, derived: &[u8; 32]) -> Result<()> {
    if &read_public(dir, stem)? == derived {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "{stem}.{PUBLIC_EXT} does not match {stem}.{PRIVATE_EXT}"
        )))
    }
}

/// Peer id of the public key file at `path`.
///
/// # Errors
///
/// Missing or malformed key file.
pub fn peer_id_of(path: &Path) -> Result<PeerIdentity> {
    Ok(PeerIdentity::from_key_bytes(&read_key(path, PUBLIC_KEY)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;
    use tempfile::TempDir;

    #[test]
    fn test_generate_and_load() {
        let server_dir = TempDir::new().unwrap();
        let client_dir = TempDir::new().unwrap();
        let server = generate_server(server_dir.path(), &mut OsRng).unwrap();
        let client = generate_client(client_dir.path(), &mut OsRng).unwrap();

        // Client keys are incomplete until provisioned
        assert!(load(Role::Client, client_dir.path()).is_err());
        provision_server_keys(server_dir.path(), client_dir.path()).unwrap();

        let LocalKeys::Client { keys, server: provisioned } =
            load(Role::Client, client_dir.path()).unwrap()
        else {
            panic!("expected client keys");
        };
        assert_eq!(keys.public(), client.public());
        assert_eq!(provisioned, server.public());

        let loaded = load(Role::Server, server_dir.path()).unwrap();
        assert_eq!(loaded.role(), Role::Server);
        assert_eq!(loaded.peer_id(), server.identity.peer_id());
    }

    #[test]
    fn test_peer_id_of_file() {
        let dir = TempDir::new().unwrap();
        let client = generate_client(dir.path(), &mut OsRng).unwrap();
        let id = peer_id_of(&dir.path().join("clientIdentity.pub")).unwrap();
        assert_eq!(id, client.identity.peer_id());
        assert_eq!(id.as_str().len(), 27);
    }

    #[test]
    fn test_mismatched_pair_rejected() {
        let dir = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        generate_server(dir.path(), &mut OsRng).unwrap();
        generate_server(other.path(), &mut OsRng).unwrap();
        std::fs::copy(
            other.path().join("server_ratchet.pub"),
            dir.path().join("server_ratchet.pub"),
        )
        .unwrap();
        assert!(matches!(
            load(Role::Server, dir.path()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_corrupt_key_file() {
        let dir = TempDir::new().unwrap();
        generate_client(dir.path(), &mut OsRng).unwrap();
        std::fs::write(dir.path().join("clientBase.pvt"), "not a key\n").unwrap();
        assert!(matches!(
            load(Role::Client, dir.path()),
            Err(Error::KeyFile { .. })
        ));
    }
}
