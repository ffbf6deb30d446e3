//! Control-plane service wrapping the graph core.
//!
//! The core itself is single-threaded; this service owns it on a task and
//! serializes control commands through a channel, periodically draining the
//! core's dispatch (backend events and work-queue completions) the way the
//! main loop's poll would.

use std::sync::Arc;

use anyhow::Result;
use colored::*;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::graph::backend::NodeBackend;
use crate::graph::core::{GraphCore, GraphStats};
use crate::graph::error::Result as GraphResult;
use crate::graph::types::{
    GraphConfig, LinkId, NodeId, NodeInfo, NodeState, Properties,
};

/// Command channel for graph service communication.
pub enum GraphCommand {
    CreateNode {
        name: String,
        properties: Properties,
        response_tx: oneshot::Sender<GraphResult<NodeId>>,
    },
    SetImplementation {
        node: NodeId,
        backend: Arc<dyn NodeBackend>,
        response_tx: oneshot::Sender<GraphResult<()>>,
    },
    RegisterNode {
        node: NodeId,
        properties: Option<Properties>,
        response_tx: oneshot::Sender<GraphResult<()>>,
    },
    SetNodeState {
        node: NodeId,
        state: NodeState,
        response_tx: oneshot::Sender<GraphResult<()>>,
    },
    SetActive {
        node: NodeId,
        active: bool,
        response_tx: oneshot::Sender<GraphResult<()>>,
    },
    SetDriver {
        node: NodeId,
        driver: NodeId,
        response_tx: oneshot::Sender<GraphResult<()>>,
    },
    CreateLink {
        output_node: NodeId,
        output_port: u32,
        input_node: NodeId,
        input_port: u32,
        properties: Properties,
        response_tx: oneshot::Sender<GraphResult<LinkId>>,
    },
    DestroyLink {
        link: LinkId,
        response_tx: oneshot::Sender<GraphResult<()>>,
    },
    DestroyNode {
        node: NodeId,
        response_tx: oneshot::Sender<GraphResult<()>>,
    },
    GetNodeInfo {
        node: NodeId,
        response_tx: oneshot::Sender<Option<NodeInfo>>,
    },
    GetStats {
        response_tx: oneshot::Sender<GraphStats>,
    },
}

impl std::fmt::Debug for GraphCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GraphCommand::CreateNode { .. } => "CreateNode",
            GraphCommand::SetImplementation { .. } => "SetImplementation",
            GraphCommand::RegisterNode { .. } => "RegisterNode",
            GraphCommand::SetNodeState { .. } => "SetNodeState",
            GraphCommand::SetActive { .. } => "SetActive",
            GraphCommand::SetDriver { .. } => "SetDriver",
            GraphCommand::CreateLink { .. } => "CreateLink",
            GraphCommand::DestroyLink { .. } => "DestroyLink",
            GraphCommand::DestroyNode { .. } => "DestroyNode",
            GraphCommand::GetNodeInfo { .. } => "GetNodeInfo",
            GraphCommand::GetStats { .. } => "GetStats",
        };
        write!(f, "{name}")
    }
}

/// Graph coordinator - owns the core and handles control commands.
pub struct GraphService {
    core: GraphCore,
    command_rx: mpsc::Receiver<GraphCommand>,
}

impl GraphService {
    pub fn new(config: GraphConfig, command_rx: mpsc::Receiver<GraphCommand>) -> Self {
        info!(
            "🎛️ {}: initialized graph service",
            "GRAPH_SERVICE".on_purple().white()
        );
        Self {
            core: GraphCore::new(config),
            command_rx,
        }
    }

    /// Spawn the service on the runtime, returning a client handle.
    pub fn spawn(config: GraphConfig) -> GraphHandle {
        let (command_tx, command_rx) = mpsc::channel(64);
        let mut service = GraphService::new(config, command_rx);
        tokio::spawn(async move {
            service.run().await;
        });
        GraphHandle { command_tx }
    }

    /// Main coordination loop - handles commands and drains core dispatch.
    pub async fn run(&mut self) {
        info!(
            "🚀 {}: graph service started",
            "GRAPH_SERVICE".on_purple().white()
        );
        let mut dispatch_tick = tokio::time::interval(std::time::Duration::from_millis(5));
        dispatch_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => {
                            self.handle_command(command);
                            // Commands often queue backend events; reconcile
                            // before the next one.
                            self.core.dispatch();
                        }
                        None => {
                            info!(
                                "🛑 {}: command channel closed, shutting down",
                                "GRAPH_SERVICE".red()
                            );
                            break;
                        }
                    }
                }
                _ = dispatch_tick.tick() => {
                    self.core.dispatch();
                }
            }
        }

        info!(
            "✅ {}: shut down complete",
            "GRAPH_SERVICE".on_purple().white()
        );
    }

    fn handle_command(&mut self, command: GraphCommand) {
        match command {
            GraphCommand::CreateNode {
                name,
                properties,
                response_tx,
            } => {
                let result = self.core.node_new(&name, properties);
                let _ = response_tx.send(result);
            }
            GraphCommand::SetImplementation {
                node,
                backend,
                response_tx,
            } => {
                let result = self.core.node_set_implementation(node, backend);
                let _ = response_tx.send(result);
            }
            GraphCommand::RegisterNode {
                node,
                properties,
                response_tx,
            } => {
                let result = self.core.node_register(node, properties);
                let _ = response_tx.send(result);
            }
            GraphCommand::SetNodeState {
                node,
                state,
                response_tx,
            } => {
                let result = self.core.node_set_state(node, state);
                let _ = response_tx.send(result);
            }
            GraphCommand::SetActive {
                node,
                active,
                response_tx,
            } => {
                let result = self.core.node_set_active(node, active);
                let _ = response_tx.send(result);
            }
            GraphCommand::SetDriver {
                node,
                driver,
                response_tx,
            } => {
                let result = self.core.node_set_driver(node, driver);
                let _ = response_tx.send(result);
            }
            GraphCommand::CreateLink {
                output_node,
                output_port,
                input_node,
                input_port,
                properties,
                response_tx,
            } => {
                let result = self.core.link_new(
                    output_node,
                    output_port,
                    input_node,
                    input_port,
                    properties,
                );
                let _ = response_tx.send(result);
            }
            GraphCommand::DestroyLink { link, response_tx } => {
                let result = self.core.link_destroy(link);
                let _ = response_tx.send(result);
            }
            GraphCommand::DestroyNode { node, response_tx } => {
                let result = self.core.node_destroy(node);
                let _ = response_tx.send(result);
            }
            GraphCommand::GetNodeInfo { node, response_tx } => {
                let info = self.core.node(node).ok().map(|n| n.info.clone());
                let _ = response_tx.send(info);
            }
            GraphCommand::GetStats { response_tx } => {
                let _ = response_tx.send(self.core.stats());
            }
        }
    }
}

/// Client handle to a spawned [`GraphService`].
#[derive(Clone)]
pub struct GraphHandle {
    command_tx: mpsc::Sender<GraphCommand>,
}

impl GraphHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> GraphCommand,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build(response_tx))
            .await
            .map_err(|_| anyhow::anyhow!("graph service is gone"))?;
        response_rx
            .await
            .map_err(|_| anyhow::anyhow!("graph service dropped the reply"))
    }

    pub async fn create_node(&self, name: &str, properties: Properties) -> Result<NodeId> {
        let name = name.to_string();
        let result = self
            .request(move |response_tx| GraphCommand::CreateNode {
                name,
                properties,
                response_tx,
            })
            .await?;
        Ok(result?)
    }

    pub async fn set_implementation(
        &self,
        node: NodeId,
        backend: Arc<dyn NodeBackend>,
    ) -> Result<()> {
        let result = self
            .request(move |response_tx| GraphCommand::SetImplementation {
                node,
                backend,
                response_tx,
            })
            .await?;
        Ok(result?)
    }

    pub async fn register_node(&self, node: NodeId, properties: Option<Properties>) -> Result<()> {
        let result = self
            .request(move |response_tx| GraphCommand::RegisterNode {
                node,
                properties,
                response_tx,
            })
            .await?;
        Ok(result?)
    }

    pub async fn set_node_state(&self, node: NodeId, state: NodeState) -> Result<()> {
        let result = self
            .request(move |response_tx| GraphCommand::SetNodeState {
                node,
                state,
                response_tx,
            })
            .await?;
        Ok(result?)
    }

    pub async fn set_active(&self, node: NodeId, active: bool) -> Result<()> {
        let result = self
            .request(move |response_tx| GraphCommand::SetActive {
                node,
                active,
                response_tx,
            })
            .await?;
        Ok(result?)
    }

    pub async fn set_driver(&self, node: NodeId, driver: NodeId) -> Result<()> {
        let result = self
            .request(move |response_tx| GraphCommand::SetDriver {
                node,
                driver,
                response_tx,
            })
            .await?;
        Ok(result?)
    }

    pub async fn create_link(
        &self,
        output_node: NodeId,
        output_port: u32,
        input_node: NodeId,
        input_port: u32,
        properties: Properties,
    ) -> Result<LinkId> {
        let result = self
            .request(move |response_tx| GraphCommand::CreateLink {
                output_node,
                output_port,
                input_node,
                input_port,
                properties,
                response_tx,
            })
            .await?;
        Ok(result?)
    }

    pub async fn destroy_link(&self, link: LinkId) -> Result<()> {
        let result = self
            .request(move |response_tx| GraphCommand::DestroyLink { link, response_tx })
            .await?;
        Ok(result?)
    }

    pub async fn destroy_node(&self, node: NodeId) -> Result<()> {
        let result = self
            .request(move |response_tx| GraphCommand::DestroyNode { node, response_tx })
            .await?;
        Ok(result?)
    }

    pub async fn node_info(&self, node: NodeId) -> Result<Option<NodeInfo>> {
        self.request(move |response_tx| GraphCommand::GetNodeInfo { node, response_tx })
            .await
    }

    pub async fn stats(&self) -> Result<GraphStats> {
        self.request(|response_tx| GraphCommand::GetStats { response_tx })
            .await
    }
}

impl std::fmt::Debug for GraphHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphHandle").finish_non_exhaustive()
    }
}
