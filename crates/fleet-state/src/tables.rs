//! redb table definitions for the fleet ledger.
//!
//! Record tables use `&str` keys (record ID) and `&[u8]` values
//! (JSON-serialized records). Name tables map a non-deleted record's
//! unique name to its ID.

use redb::TableDefinition;

pub const CLUSTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("clusters");
pub const CLUSTER_NAMES: TableDefinition<&str, &str> = TableDefinition::new("cluster_names");

pub const CAPABILITIES: TableDefinition<&str, &[u8]> = TableDefinition::new("capabilities");
pub const CAPABILITY_NAMES: TableDefinition<&str, &str> =
    TableDefinition::new("capability_names");

pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");
pub const NODE_NAMES: TableDefinition<&str, &str> = TableDefinition::new("node_names");

pub const DEPLOYMENT_PLANS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("deployment_plans");
pub const DEPLOYMENT_PLAN_NAMES: TableDefinition<&str, &str> =
    TableDefinition::new("deployment_plan_names");

pub const META_INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("meta_instances");
pub const META_INSTANCE_NAMES: TableDefinition<&str, &str> =
    TableDefinition::new("meta_instance_names");

/// Durable-execution checkpoints keyed by workflow ID.
pub const WORKFLOWS: TableDefinition<&str, &[u8]> = TableDefinition::new("workflows");
