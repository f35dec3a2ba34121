//! Shared node-details pipeline.
//!
//! Ironic nodes are the primary rows. Joins run in a fixed order:
//!
//! 1. reservation: nova aggregates flattened per host, owner project from
//!    `metadata["blazar:owner"]`, project name from keystone
//! 2. node type: blazar hosts by `hypervisor_hostname`
//! 3. port (optional): ironic ports by `node_uuid`
//!
//! Steps 1 and 2 default unmatched nodes to empty labels; step 3 drops
//! nodes without a port.

use std::sync::Arc;

use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::debug;

use crate::backend::{Backend, Resource};
use crate::error::UpstreamResult;
use crate::join::{index_by, join, rows_from_records, FieldMap, JoinPolicy};
use crate::model::{scalar_to_string, JoinedRow, RawRecord};

const NODE_FIELDS: [FieldMap<'static>; 6] = [
    FieldMap::same("uuid"),
    FieldMap::same("name"),
    FieldMap::same("maintenance"),
    FieldMap::same("provision_state"),
    FieldMap::same("last_error"),
    FieldMap::same("updated_at"),
];

/// Backends feeding the node-details pipeline.
#[derive(Clone)]
pub struct NodeSources {
    pub ironic: Arc<dyn Backend>,
    pub nova: Arc<dyn Backend>,
    pub keystone: Arc<dyn Backend>,
    pub blazar: Arc<dyn Backend>,
    /// Aggregate holding unreserved nodes
    pub freepool_aggregate_id: i64,
}

/// Raw inputs of one pipeline run.
#[derive(Debug, Default)]
pub struct NodeInputs {
    pub nodes: Vec<RawRecord>,
    pub aggregates: Vec<RawRecord>,
    pub projects: Vec<RawRecord>,
    pub hosts: Vec<RawRecord>,
    pub ports: Option<Vec<RawRecord>>,
}

impl NodeSources {
    /// Fetch every input concurrently. Ports are only fetched when asked for.
    pub async fn fetch(&self, with_ports: bool) -> UpstreamResult<NodeInputs> {
        let ports = async {
            if with_ports {
                self.ironic.list(&Resource::IRONIC_PORTS, &[]).await.map(Some)
            } else {
                Ok(None)
            }
        };
        let (nodes, aggregates, projects, hosts, ports) = tokio::try_join!(
            self.ironic.list(&Resource::IRONIC_NODES, &[]),
            self.nova.list(&Resource::NOVA_AGGREGATES, &[]),
            self.keystone.list(&Resource::KEYSTONE_PROJECTS, &[]),
            self.blazar.list(&Resource::BLAZAR_HOSTS, &[]),
            ports,
        )?;
        Ok(NodeInputs {
            nodes,
            aggregates,
            projects,
            hosts,
            ports,
        })
    }

    /// Fetch and join.
    pub async fn node_details(&self, region: &str, with_ports: bool) -> UpstreamResult<Vec<JoinedRow>> {
        let inputs = self.fetch(with_ports).await?;
        Ok(join_node_details(region, &inputs, self.freepool_aggregate_id))
    }
}

/// One synthetic record per reserved host: id is the node uuid, fields are
/// the owning project's id and name.
pub fn reservation_records(aggregates: &[RawRecord], projects: &[RawRecord], freepool_aggregate_id: i64) -> Vec<RawRecord> {
    let projects = index_by("projects", projects, |p| Some(p.id.clone()));
    let freepool = freepool_aggregate_id.to_string();
    let mut reservations = Vec::new();

    for aggregate in aggregates {
        if aggregate.id == freepool {
            continue;
        }
        let hosts = match aggregate.get("hosts").and_then(JsonValue::as_array) {
            Some(hosts) if !hosts.is_empty() => hosts,
            _ => continue,
        };
        let Some(owner) = aggregate.str_at(&["metadata", "blazar:owner"]) else {
            debug!(target: "exporter::collector::inventory", aggregate = %aggregate.id, "Aggregate without owner skipped");
            continue;
        };
        let project_name = projects
            .get(&owner)
            .and_then(|p| p.str_field("name"))
            .unwrap_or_default();

        for host in hosts.iter().filter_map(scalar_to_string) {
            let mut fields = JsonMap::new();
            fields.insert("project_id".into(), JsonValue::String(owner.clone()));
            fields.insert("project_name".into(), JsonValue::String(project_name.clone()));
            reservations.push(RawRecord::new(host, fields));
        }
    }
    reservations
}

/// One synthetic record per port, keyed by node uuid, with the link
/// connection fields lifted to the top level.
pub fn port_records(ports: &[RawRecord]) -> Vec<RawRecord> {
    ports
        .iter()
        .filter_map(|port| {
            let node = port.str_field("node_uuid")?;
            let mut fields = JsonMap::new();
            fields.insert("port_uuid".into(), JsonValue::String(port.id.clone()));
            for key in ["port_id", "switch_info"] {
                if let Some(value) = port.str_at(&["local_link_connection", key]) {
                    fields.insert(key.into(), JsonValue::String(value));
                }
            }
            Some(RawRecord::new(node, fields))
        })
        .collect()
}

/// Run the join chain over already fetched inputs.
pub fn join_node_details(region: &str, inputs: &NodeInputs, freepool_aggregate_id: i64) -> Vec<JoinedRow> {
    let mut rows = rows_from_records(&inputs.nodes, |n| Some(n.id.clone()), &NODE_FIELDS);
    for row in &mut rows {
        row.set_field("region", region);
    }

    let reservations = reservation_records(&inputs.aggregates, &inputs.projects, freepool_aggregate_id);
    let by_host = index_by("reservations", &reservations, |r| Some(r.id.clone()));
    let rows = join(
        rows,
        &by_host,
        |row| Some(row.key.clone()),
        &[FieldMap::same("project_id"), FieldMap::same("project_name")],
        &JoinPolicy::default_empty(),
    );

    let by_hostname = index_by("blazar hosts", &inputs.hosts, |h| h.str_field("hypervisor_hostname"));
    let rows = join(
        rows,
        &by_hostname,
        |row| Some(row.key.clone()),
        &[FieldMap::same("node_type")],
        &JoinPolicy::default_empty(),
    );

    let Some(ports) = &inputs.ports else {
        return rows;
    };
    let ports = port_records(ports);
    let by_node = index_by("ironic ports", &ports, |p| Some(p.id.clone()));
    join(
        rows,
        &by_node,
        |row| Some(row.key.clone()),
        &[
            FieldMap::same("port_uuid"),
            FieldMap::same("port_id"),
            FieldMap::same("switch_info"),
        ],
        &JoinPolicy::DropUnmatched,
    )
}
