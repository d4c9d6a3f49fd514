//! Built-in negotiable stream features.

pub mod bind;
pub mod compress;
pub mod legacy;
pub mod sasl;
pub mod starttls;

pub use bind::ResourceBind;
pub use compress::Compression;
pub use legacy::LegacyAuth;
pub use sasl::SaslAuth;
pub use starttls::StartTls;
