//! Registry access: credentials for private registries and image digests.

pub mod credentials;
pub mod digest;

pub use credentials::{
    CredentialScope, LoginOutcome, RegistryCredential, RegistryCredentialStore,
    parse_auth_bundle,
};
pub use digest::{ImageDigestResolver, StalenessPolicy};
