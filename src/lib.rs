mod types;
pub use types::{X25519PublicKey, X25519Secret};

mod error;
pub use error::Error;

mod config;
pub use config::ProtocolConfig;

mod store;
pub use store::{KeyStore, MemoryKeyStore, StoreOp};

mod identity;
pub use identity::{Identity, IdentityKeyManager, IdentityKeyPair};

mod prekey;
pub use prekey::{OneTimePreKey, PreKeyManager, PublicBundle, SignedPreKey};

mod x3dh;
pub use x3dh::{HandshakeSecret, InitiationResult, X3dh};

mod envelope;
pub use envelope::{Envelope, HandshakeEnvelope, RatchetEnvelope};

mod ratchet;
pub use ratchet::DoubleRatchet;

mod session;
pub use session::{PeerAddress, Session, SessionEstablisher};

mod proto;
