pub mod audit;
pub mod bootstrap;
pub mod daemon;
pub mod file;
pub mod health;
pub mod identity;
pub mod init;
pub mod keys;
pub mod push;
pub mod version;

pub use audit::Audit;
pub use bootstrap::Bootstrap;
pub use daemon::Daemon;
pub use file::File;
pub use health::Health;
pub use identity::Identity;
pub use init::Init;
pub use keys::Keys;
pub use push::Push;
pub use version::Version;
