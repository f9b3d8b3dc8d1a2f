pub mod ch;
pub mod command;
pub mod config;
pub mod distribution;
pub mod error;
pub mod l1;
pub mod log;
pub mod member;
pub mod metrics;
pub mod notifier;
pub mod rehash;
pub mod rpc;
pub mod store;
pub mod topology;
pub mod triangle;
pub mod txlog;

pub use ch::{create_consistent_hash, ConsistentHash, ConsistentHashRef, DefaultConsistentHash, UnionConsistentHash};
pub use command::{GlobalTransaction, PrepareCommand, WriteCommand};
pub use config::{CacheConfig, DistributionConfig, L1Config, LeaveProtocol};
pub use distribution::{CacheContext, DistributionManager, JoinState};
pub use error::{DistributionError, Result};
pub use l1::{InvalidationDispatch, L1Manager};
pub use member::Member;
pub use metrics::{DistributionMetrics, MetricsSnapshot};
pub use notifier::{LocalMembershipNotifier, MembershipNotifier, ViewChangeListener, ViewChangedEvent};
pub use rehash::{RehashKind, RehashReport, RehashTask};
pub use rpc::{RehashCommand, Response, ResponseMode, RpcManager};
pub use store::{CacheStore, DataContainer, InMemoryDataContainer, InternalCacheValue, Key, StateMap};
pub use topology::{CacheTopology, DataLocality, DistributionInfo, LocalizedCacheTopology};
pub use triangle::TriangleOrderManager;
pub use txlog::TransactionLogger;
