//! Resource proxies: the tasks that own resource connections.

use common::message::{ConnectReply, ResourceOp, ResourceReply, ResourceRequest};
use common::{ProcessHandle, ResourceId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use xa::Resource;

use crate::message::Message;
use crate::state::{InstanceId, InstanceSnapshot, InstanceState, ResourceSnapshot, Statistics};

/// A configured resource and its instances.
#[derive(Debug)]
pub(crate) struct ResourceProxy {
    pub id: ResourceId,
    pub key: String,
    pub name: String,
    pub instances: Vec<Instance>,
}

impl ResourceProxy {
    pub fn idle(&mut self) -> Option<&mut Instance> {
        self.instances
            .iter_mut()
            .find(|instance| instance.state == InstanceState::Idle)
    }

    /// True while some instance can still serve requests.
    pub fn alive(&self) -> bool {
        self.instances.iter().any(|instance| {
            matches!(
                instance.state,
                InstanceState::Started | InstanceState::Idle | InstanceState::Busy
            )
        })
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            id: self.id,
            key: self.key.clone(),
            name: self.name.clone(),
            instances: self
                .instances
                .iter()
                .map(|instance| InstanceSnapshot {
                    index: instance.index,
                    state: instance.state,
                    statistics: instance.statistics.clone(),
                })
                .collect(),
        }
    }
}

/// One connection to a resource, served by its own task.
#[derive(Debug)]
pub(crate) struct Instance {
    pub index: usize,
    pub state: InstanceState,
    pub sender: Option<mpsc::Sender<ResourceRequest>>,
    pub task: Option<JoinHandle<()>>,
    pub statistics: Statistics,
}

impl Instance {
    /// Spawns the task serving `resource`. Replies go to the coordinator
    /// through a weak sender, so instances never keep it alive.
    pub fn spawn(
        id: InstanceId,
        resource: Resource,
        process: ProcessHandle,
        coordinator: mpsc::WeakSender<Message>,
    ) -> Self {
        // One slot: the coordinator only sends to idle instances.
        let (sender, requests) = mpsc::channel(1);
        let task = tokio::spawn(serve(id, resource, process, requests, coordinator));
        Self {
            index: id.index,
            state: InstanceState::Started,
            sender: Some(sender),
            task: Some(task),
            statistics: Statistics::default(),
        }
    }
}

/// A remote domain taking part through a gateway connection.
#[derive(Debug)]
pub(crate) struct ExternalProxy {
    pub id: ResourceId,
    pub process: ProcessHandle,
    pub channel: mpsc::Sender<ResourceRequest>,
}

#[tracing::instrument(skip_all, fields(instance = %id, key = %resource.key()))]
async fn serve(
    id: InstanceId,
    resource: Resource,
    process: ProcessHandle,
    mut requests: mpsc::Receiver<ResourceRequest>,
    coordinator: mpsc::WeakSender<Message>,
) {
    let status = resource.open().await;
    let connect = Message::Connect {
        instance: id,
        reply: ConnectReply {
            resource: id.resource,
            process,
            status,
        },
    };
    if !report(&coordinator, connect).await {
        resource.close().await;
        return;
    }

    while let Some(request) = requests.recv().await {
        let started = Instant::now();
        let status = match request.op {
            ResourceOp::Prepare => resource.prepare(&request.xid, request.flags).await,
            ResourceOp::Commit => resource.commit(&request.xid, request.flags).await,
            ResourceOp::Rollback => resource.rollback(&request.xid, request.flags).await,
        };
        let reply = Message::ResourceReply {
            instance: Some(id),
            reply: ResourceReply {
                correlation: request.correlation,
                xid: request.xid,
                resource: request.resource,
                op: request.op,
                status,
            },
            elapsed: started.elapsed(),
        };
        if !report(&coordinator, reply).await {
            break;
        }
    }

    tracing::debug!("instance stopping");
    resource.close().await;
}

async fn report(coordinator: &mpsc::WeakSender<Message>, message: Message) -> bool {
    match coordinator.upgrade() {
        Some(sender) => sender.send(message).await.is_ok(),
        None => false,
    }
}
