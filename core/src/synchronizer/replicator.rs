//! Local mirrors of dense variables.
//!
//! With local replication on, each replica reads a worker-local copy of a dense variable
//! instead of the parameter-server master. After the barrier, the mirrors are refreshed from
//! the master.

use crate::error::{Result, SyncError};
use crate::graph::{
    prepend_name_scope, replica_prefix, DeviceSpec, Graph, OpId, OpKind, OpSpec, TensorRef,
};

/// Builds per-replica mirror variables of a master variable.
pub trait VariableReplicator {
    fn build_mirror_vars(
        &self,
        graph: &mut Graph,
        master: OpId,
        device: &DeviceSpec,
        count: usize,
    ) -> Result<MirrorVars>;
}

/// Mirror variables of one master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorVars {
    pub master: OpId,
    /// Mirror of replica `i` at index `i`.
    pub mirrors: Vec<OpId>,
    /// Ops copying the master's current value into each mirror; run once before training.
    pub initializers: Vec<OpId>,
}

impl MirrorVars {
    /// Creates one op per mirror that copies the master into it after every op in `deps`.
    pub fn get_all_update_ops(&self, graph: &mut Graph, deps: &[OpId], device: &DeviceSpec) -> Result<Vec<OpId>> {
        let master_name = graph.op(self.master).name.clone();
        let read = read_master(graph, self.master, format!("{master_name}/mirror_read"), deps.to_vec(), device)?;
        self.mirrors
            .iter()
            .map(|&mirror| {
                let name = format!("{}/update", graph.op(mirror).name);
                let assign = graph.add_op(
                    OpSpec::new(name, OpKind::Assign)
                        .inputs(vec![TensorRef::new(mirror, 0), read])
                        .device(device),
                )?;
                Ok(assign.id())
            })
            .collect()
    }
}

fn read_master(
    graph: &mut Graph,
    master: OpId,
    name: String,
    deps: Vec<OpId>,
    device: &DeviceSpec,
) -> Result<TensorRef> {
    let meta = graph
        .op(master)
        .outputs
        .first()
        .cloned()
        .ok_or_else(|| SyncError::OutputOutOfRange {
            op: graph.op(master).name.clone(),
            index: 0,
        })?;
    let read = graph.add_op(
        OpSpec::new(name, OpKind::ReadVariable)
            .inputs(vec![TensorRef::new(master, 0)])
            .control_inputs(deps)
            .device(device)
            .output(meta),
    )?;
    Ok(read.output(0))
}

/// Default replicator: one `Variable` op per replica, with replica reads of the master
/// redirected to it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceVariableReplicator;

impl VariableReplicator for ResourceVariableReplicator {
    fn build_mirror_vars(
        &self,
        graph: &mut Graph,
        master: OpId,
        device: &DeviceSpec,
        count: usize,
    ) -> Result<MirrorVars> {
        let master_name = graph.op(master).name.clone();
        let master_handle = TensorRef::new(master, 0);
        let host = device.host();

        let mut mirrors = Vec::with_capacity(count);
        let mut initializers = Vec::with_capacity(count);
        for i in 0..count {
            let meta = graph.op(master).outputs.clone();
            let mut spec = OpSpec::new(format!("{master_name}/{}-Mirror", replica_prefix(i)), OpKind::Variable)
                .device(&host);
            for m in meta {
                spec = spec.output(m);
            }
            let mirror = graph.add_op(spec)?;

            // Replica `i` reads its own mirror from now on.
            let scope = prepend_name_scope("", &replica_prefix(i));
            let readers: Vec<OpId> = graph
                .ops()
                .filter(|(_, op)| {
                    matches!(op.kind, OpKind::ReadVariable)
                        && op.name.starts_with(&scope)
                        && op.inputs.first() == Some(&master_handle)
                })
                .map(|(id, _)| id)
                .collect();
            graph.update_consumers(&readers, master_handle, mirror.output(0));

            let mirror_name = graph.op(mirror.id()).name.clone();
            let read = read_master(graph, master, format!("{mirror_name}/init_read"), Vec::new(), &host)?;
            let init = graph.add_op(
                OpSpec::new(format!("{mirror_name}/init"), OpKind::Assign)
                    .inputs(vec![mirror.output(0), read])
                    .device(&host),
            )?;
            mirrors.push(mirror.id());
            initializers.push(init.id());
        }

        Ok(MirrorVars {
            master,
            mirrors,
            initializers,
        })
    }
}
