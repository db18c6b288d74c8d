//! Identity resolution: platform accounts and the confidence-graded links
//! between them.

pub mod model;
pub mod resolver;
pub mod similarity;
pub mod store;

pub use model::{Identity, IdentityKey, IdentityLink, LinkMetadata, LinkSource};
pub use resolver::{IdentityResolver, Resolution, ResolverConfig};
pub use store::{IdentityStore, IdentityStoreError, InMemoryIdentityStore};
