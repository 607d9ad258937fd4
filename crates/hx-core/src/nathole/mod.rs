//! NAT behavior discovery and classification
//!
//! Used as the fallback path for peer-to-peer traversal: a client observes
//! its public mapping from several STUN endpoints, then classifies how the
//! NAT in front of it rewrites addresses.

mod classify;
mod discover;
mod local;

pub use classify::{
    classify_feature_count, classify_nat_feature, FeatureCount, NatBehavior, NatFeature, NatType,
};
pub use discover::{discover, DISCOVER_TIMEOUT};
pub use local::list_local_ips_for_nat_hole;
